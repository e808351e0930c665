//! Error types for the SMTP server

use thiserror::Error;

/// Session policy that a command was refused under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// `AUTH` must succeed before a mail transaction
    AuthenticationRequired,
    /// `STARTTLS` must succeed before anything else
    TlsRequired,
}

/// Failure reported by a [`MailSink`](crate::MailSink)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Mail store rejected message: {0}")]
pub struct DeliveryError(pub String);

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid command")]
    InvalidCommand,

    #[error("Invalid state for command")]
    InvalidState(String),

    #[error("Invalid syntax")]
    InvalidSyntax(String),

    #[error("Command not implemented")]
    NotImplemented(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Path too long (max {max} characters)")]
    PathTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Too much mail data (max {max} bytes)")]
    TooMuchData { max: usize },

    #[error("Domain name too long (max {max} characters)")]
    DomainTooLong { max: usize },

    #[error("User name too long (max {max} characters)")]
    UserTooLong { max: usize },

    #[error("Unsupported authentication mechanism")]
    UnsupportedMechanism,

    #[error("Authentication cancelled")]
    AuthCancelled,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Policy violation: {0:?}")]
    PolicyViolation(Policy),

    #[error("TLS not available")]
    TlsNotAvailable,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server has been stopped and cannot be restarted")]
    ServerStopped,
}

/// SMTP size limits as defined in RFC 5321
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a user name
    pub const USER_MAX_LENGTH: usize = 64;

    /// Maximum length of a domain name
    pub const DOMAIN_MAX_LENGTH: usize = 255;

    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;

    /// Maximum number of recipients per message
    pub const MAX_RECIPIENTS: usize = 100;

    /// Default cap on the size of one message
    pub const MAX_DATA_SIZE: usize = 10 * 1024 * 1024;
}

/// Maps SMTP errors to appropriate response codes
impl SmtpError {
    pub fn to_response_code(&self) -> &'static str {
        match self {
            SmtpError::Io(_) => "421",
            SmtpError::InvalidCommand => "500",
            SmtpError::InvalidState(_) => "503",
            SmtpError::InvalidSyntax(_) => "501",
            SmtpError::NotImplemented(_) => "502",
            SmtpError::LineTooLong { .. } => "500",
            SmtpError::PathTooLong { .. } => "501",
            SmtpError::TooManyRecipients { .. } => "552",
            SmtpError::TooMuchData { .. } => "552",
            SmtpError::DomainTooLong { .. } => "501",
            SmtpError::UserTooLong { .. } => "501",
            SmtpError::UnsupportedMechanism => "504",
            SmtpError::AuthCancelled => "501",
            SmtpError::AuthFailed => "535",
            SmtpError::PolicyViolation(_) => "530",
            SmtpError::TlsNotAvailable => "454",
            SmtpError::TlsHandshake(_) => "421",
            SmtpError::Tls(_) => "454",
            SmtpError::Delivery(_) => "451",
            SmtpError::ConnectionClosed => "421",
            SmtpError::AlreadyRunning => "421",
            SmtpError::ServerStopped => "421",
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::Io(_) => "Service not available".to_string(),
            SmtpError::InvalidCommand => "Syntax error, command unrecognized".to_string(),
            SmtpError::InvalidState(msg) => format!("Bad sequence of commands: {msg}"),
            SmtpError::InvalidSyntax(msg) => format!("Syntax error: {msg}"),
            SmtpError::NotImplemented(msg) => format!("Command not implemented: {msg}"),
            SmtpError::LineTooLong { max } => format!("Line too long (max {max} characters)"),
            SmtpError::PathTooLong { max } => format!("Path too long (max {max} characters)"),
            SmtpError::TooManyRecipients { max } => format!("Too many recipients (max {max})"),
            SmtpError::TooMuchData { max } => format!("Too much mail data (max {max} bytes)"),
            SmtpError::DomainTooLong { max } => {
                format!("Domain name too long (max {max} characters)")
            }
            SmtpError::UserTooLong { max } => {
                format!("User name too long (max {max} characters)")
            }
            SmtpError::UnsupportedMechanism => "Unrecognized authentication type".to_string(),
            SmtpError::AuthCancelled => "Authentication cancelled".to_string(),
            SmtpError::AuthFailed => "5.7.8 Authentication credentials invalid".to_string(),
            SmtpError::PolicyViolation(Policy::AuthenticationRequired) => {
                "5.7.0 Authentication required".to_string()
            }
            SmtpError::PolicyViolation(Policy::TlsRequired) => {
                "5.7.0 Must issue a STARTTLS command first".to_string()
            }
            SmtpError::TlsNotAvailable => "TLS not available".to_string(),
            SmtpError::TlsHandshake(_) | SmtpError::Tls(_) => {
                "TLS not available due to temporary reason".to_string()
            }
            SmtpError::Delivery(_) => {
                "Requested action aborted: local error in processing".to_string()
            }
            SmtpError::ConnectionClosed => "Connection closed".to_string(),
            SmtpError::AlreadyRunning | SmtpError::ServerStopped => {
                "Service not available".to_string()
            }
        }
    }

    /// Whether the session has to be torn down after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmtpError::Io(_) | SmtpError::TlsHandshake(_) | SmtpError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_codes() {
        let auth = SmtpError::PolicyViolation(Policy::AuthenticationRequired);
        assert_eq!(auth.to_response_code(), "530");
        assert!(auth.to_response_message().contains("Authentication required"));

        let tls = SmtpError::PolicyViolation(Policy::TlsRequired);
        assert_eq!(tls.to_response_code(), "530");
        assert!(tls.to_response_message().contains("STARTTLS"));
    }

    #[test]
    fn test_auth_and_delivery_codes() {
        assert_eq!(SmtpError::AuthFailed.to_response_code(), "535");
        assert_eq!(SmtpError::UnsupportedMechanism.to_response_code(), "504");
        assert_eq!(SmtpError::AuthCancelled.to_response_code(), "501");

        let delivery = SmtpError::from(DeliveryError("disk full".to_string()));
        assert_eq!(delivery.to_response_code(), "451");
        assert_eq!(delivery.to_string(), "Mail store rejected message: disk full");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SmtpError::TlsHandshake("eof".to_string()).is_fatal());
        assert!(SmtpError::ConnectionClosed.is_fatal());
        assert!(!SmtpError::AuthFailed.is_fatal());
        assert!(!SmtpError::PolicyViolation(Policy::TlsRequired).is_fatal());
        assert!(!SmtpError::InvalidCommand.is_fatal());
    }
}

//! Server configuration

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::smtp::error::SmtpLimits;

/// Whether and how clients must authenticate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    /// `AUTH` is not offered
    #[default]
    Disabled,
    /// `AUTH` is offered but mail is accepted without it
    Optional,
    /// Mail transactions require a successful `AUTH`
    Enforced,
}

/// Transport security policy of a server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportSecurity {
    /// Plaintext only, `STARTTLS` is not offered
    #[default]
    Plain,
    /// `STARTTLS` is offered but optional
    StartTlsSupported,
    /// `STARTTLS` must succeed before any mail command
    StartTlsEnforced,
    /// Implicit TLS: the handshake happens before the greeting
    SmtpsOnly,
}

impl TransportSecurity {
    /// Whether `STARTTLS` may be issued on a channel in this state
    pub fn is_tls_offerable(self, tls_active: bool) -> bool {
        matches!(self, Self::StartTlsSupported | Self::StartTlsEnforced) && !tls_active
    }

    /// Whether a mail transaction needs an encrypted channel first
    pub fn is_tls_required_before_mail(self, tls_active: bool) -> bool {
        match self {
            Self::StartTlsEnforced => !tls_active,
            Self::SmtpsOnly => true,
            Self::Plain | Self::StartTlsSupported => false,
        }
    }

    /// Whether this policy needs a server certificate at all
    pub fn uses_tls(self) -> bool {
        self != Self::Plain
    }
}

/// Where the server certificate and key come from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsIdentity {
    /// Generate a throwaway self-signed certificate for the server hostname
    #[default]
    SelfSigned,
    /// PEM encoded certificate chain and private key held in memory
    Pem {
        cert_chain: String,
        private_key: String,
    },
    /// PEM files on disk
    PemFiles {
        cert_chain: PathBuf,
        private_key: PathBuf,
    },
}

/// What to tell the client when the mail sink fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFailurePolicy {
    /// Answer `451` so the client knows the message was not captured
    #[default]
    Reject,
    /// Answer `250` and only log the failure
    Ignore,
}

/// Immutable configuration shared by every session of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfiguration {
    pub bind_address: IpAddr,
    /// Listening port, 0 picks a free one
    pub port: u16,
    pub hostname: String,
    pub software_name: String,
    pub auth_type: AuthType,
    pub transport_security: TransportSecurity,
    pub login: String,
    pub password: String,
    pub tls_identity: TlsIdentity,
    /// Prepend a `Received:` trace header to captured messages
    pub received_headers: bool,
    pub read_timeout: Option<Duration>,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub sink_failure: SinkFailurePolicy,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            hostname: "localhost".to_string(),
            software_name: env!("CARGO_PKG_NAME").to_string(),
            auth_type: AuthType::Disabled,
            transport_security: TransportSecurity::Plain,
            login: String::new(),
            password: String::new(),
            tls_identity: TlsIdentity::SelfSigned,
            received_headers: false,
            read_timeout: Some(Duration::from_secs(60)),
            max_connections: 1000,
            max_message_size: SmtpLimits::MAX_DATA_SIZE,
            sink_failure: SinkFailurePolicy::Reject,
        }
    }
}

impl ServerConfiguration {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_owned();
        self
    }

    pub fn with_software_name(mut self, name: &str) -> Self {
        self.software_name = name.to_owned();
        self
    }

    /// Set the authentication policy and the only accepted credentials
    pub fn with_auth(mut self, auth_type: AuthType, login: &str, password: &str) -> Self {
        self.auth_type = auth_type;
        self.login = login.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn with_transport_security(mut self, security: TransportSecurity) -> Self {
        self.transport_security = security;
        self
    }

    pub fn with_tls_identity(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = identity;
        self
    }

    pub fn with_received_headers(mut self, enabled: bool) -> Self {
        self.received_headers = enabled;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_sink_failure(mut self, policy: SinkFailurePolicy) -> Self {
        self.sink_failure = policy;
        self
    }
}

/// Unknown policy name
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseConfigError {
    kind: &'static str,
    value: String,
}

impl FromStr for AuthType {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "optional" => Ok(Self::Optional),
            "enforced" => Ok(Self::Enforced),
            _ => Err(ParseConfigError {
                kind: "auth type",
                value: s.to_owned(),
            }),
        }
    }
}

impl FromStr for TransportSecurity {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "plain" => Ok(Self::Plain),
            "starttls" | "starttls-supported" => Ok(Self::StartTlsSupported),
            "starttls-enforced" => Ok(Self::StartTlsEnforced),
            "smtps" | "smtps-only" => Ok(Self::SmtpsOnly),
            _ => Err(ParseConfigError {
                kind: "transport security",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::StartTlsSupported => "starttls-supported",
            Self::StartTlsEnforced => "starttls-enforced",
            Self::SmtpsOnly => "smtps-only",
        };
        f.write_str(name)
    }
}

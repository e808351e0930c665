//! SMTP server implementation

pub mod auth;
pub mod commands;
pub mod config;
pub mod email;
pub mod error;
pub mod response;
pub mod server;
pub mod session;
pub mod sink;
pub mod tls;

pub use auth::CredentialsValidator;
pub use config::{
    AuthType, ParseConfigError, ServerConfiguration, SinkFailurePolicy, TlsIdentity,
    TransportSecurity,
};
pub use email::Email;
pub use error::{DeliveryError, Policy, SmtpError, SmtpLimits};
pub use response::SmtpResponse;
pub use server::SmtpServer;
pub use session::{SmtpSession, SmtpState};
pub use sink::MailSink;
pub use tls::{TlsNegotiator, Transport};

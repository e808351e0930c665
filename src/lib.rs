//! # capmail
//!
//! capmail is an embedded SMTP server that captures outbound e-mail during
//! development and testing.
//!
//! It accepts mail the way a real submission server would, including
//! STARTTLS, implicit TLS and `AUTH`, but never relays anything: every
//! message is handed to a [`MailSink`].
//!
//! ## Quick Start
//!
//! ```rust
//! use capmail::{ServerConfiguration, SmtpServer};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! // Create and start server on an ephemeral port
//! let (tx, rx) = mpsc::channel();
//! let server = SmtpServer::new(ServerConfiguration::new(0), tx);
//! server.start().unwrap();
//!
//! // Application sends email to localhost:server.port()
//! // ...
//!
//! // Check the contents of the sent email
//! if let Ok(email) = rx.recv_timeout(Duration::from_millis(100)) {
//!     println!("Received email from: {}", email.from);
//! }
//!
//! server.stop();
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the client
//! - `STARTTLS` - Upgrade the connection to TLS
//! - `AUTH PLAIN` / `AUTH LOGIN` - Authenticate against the configured login
//! - `MAIL FROM` - Specify the sender's address
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the email body
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! ## Security policies
//!
//! [`TransportSecurity`] selects plaintext only, optional STARTTLS, mandatory
//! STARTTLS or implicit TLS (SMTPS). [`AuthType`] makes `AUTH` unavailable,
//! optional or mandatory before `MAIL FROM`. The TLS certificate comes from
//! [`TlsIdentity`]; by default a self-signed one is generated at start-up.
//!
//! ## Notes
//!
//! - Runs in-memory only. Email persistence is up to the sink.
//! - Credentials are compared as plain strings.
//! - Mail relay is not supported.
//!
//! ## Size Limits
//!
//! The server enforces RFC 5321 size limits:
//! - User names: 64 characters max
//! - Domain names: 255 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Text lines: 1000 characters max
//! - Recipients: 100 max per message
//! - Messages: [`ServerConfiguration::max_message_size`], 10 MiB by default
//!
//! ## Email Handling
//!
//! `std::sync::mpsc` senders implement [`MailSink`], so the simplest sink is a
//! channel. Use `recv_timeout()` on the receiver to wait for emails with a
//! timeout. The sink is called before the client gets its `250`, so once the
//! client's send returns the message is already in the channel.

mod smtp;

pub use smtp::{
    AuthType, CredentialsValidator, DeliveryError, Email, MailSink, ParseConfigError, Policy,
    ServerConfiguration, SinkFailurePolicy, SmtpError, SmtpLimits, SmtpResponse, SmtpServer,
    SmtpSession, SmtpState, TlsIdentity, TlsNegotiator, Transport, TransportSecurity,
};

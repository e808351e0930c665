//! Transport security: STARTTLS upgrades and implicit TLS
//!
//! Sessions talk to a [`Transport`], which is either the raw TCP stream or a
//! rustls server stream layered on top of it. The [`TlsNegotiator`] owns the
//! server TLS context and decides, from the configured policy, when a
//! channel may or must be upgraded.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::{debug, info, warn};

use crate::smtp::config::{ServerConfiguration, TlsIdentity, TransportSecurity};
use crate::smtp::error::SmtpError;

/// A connection that is either plaintext or TLS-encrypted
pub enum Transport {
    Plain(TcpStream),
    /// Boxed to keep the enum small
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.get_ref(),
        }
    }

    /// Upgrade a plaintext channel in place of a STARTTLS command
    pub fn upgrade(self, negotiator: &TlsNegotiator) -> Result<Self, SmtpError> {
        match self {
            Self::Plain(stream) => negotiator.wrap_as_server_tls(stream),
            Self::Tls(_) => Err(SmtpError::InvalidState(
                "TLS is already active".to_string(),
            )),
        }
    }

    /// Send close_notify where applicable and close the socket
    pub fn close(&mut self) {
        if let Self::Tls(stream) = self {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Applies the transport security policy of one server
#[derive(Clone, Debug)]
pub struct TlsNegotiator {
    policy: TransportSecurity,
    server_config: Option<Arc<ServerConfig>>,
}

impl TlsNegotiator {
    /// Build the negotiator, loading or generating the certificate when the
    /// policy can ever encrypt a channel
    pub fn new(config: &ServerConfiguration) -> Result<Self, SmtpError> {
        let server_config = if config.transport_security.uses_tls() {
            Some(build_server_config(&config.tls_identity, &config.hostname)?)
        } else {
            None
        };

        Ok(Self {
            policy: config.transport_security,
            server_config,
        })
    }

    pub fn is_tls_offerable(&self, tls_active: bool) -> bool {
        self.server_config.is_some() && self.policy.is_tls_offerable(tls_active)
    }

    pub fn is_tls_required_before_mail(&self, tls_active: bool) -> bool {
        self.policy.is_tls_required_before_mail(tls_active)
    }

    /// Whether accepted sockets are wrapped before the greeting
    pub fn is_implicit(&self) -> bool {
        self.policy == TransportSecurity::SmtpsOnly
    }

    /// Run a server-side handshake over an established connection.
    ///
    /// On error the socket has to be closed without any further SMTP traffic.
    pub fn wrap_as_server_tls(&self, mut stream: TcpStream) -> Result<Transport, SmtpError> {
        let config = self
            .server_config
            .as_ref()
            .ok_or(SmtpError::TlsNotAvailable)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());

        let mut conn = ServerConnection::new(Arc::clone(config))
            .map_err(|e| SmtpError::TlsHandshake(e.to_string()))?;

        debug!("Starting TLS handshake with {peer}");
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut stream) {
                warn!("TLS handshake with {peer} failed: {e}");
                return Err(SmtpError::TlsHandshake(e.to_string()));
            }
        }
        debug!(
            "TLS established with {peer} ({:?})",
            conn.protocol_version()
        );

        Ok(Transport::Tls(Box::new(StreamOwned::new(conn, stream))))
    }
}

fn build_server_config(
    identity: &TlsIdentity,
    hostname: &str,
) -> Result<Arc<ServerConfig>, SmtpError> {
    let (cert_chain, private_key) = load_identity(identity, hostname)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SmtpError::Tls(format!("Failed to select protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| SmtpError::Tls(format!("Failed to create TLS config: {e}")))?;

    Ok(Arc::new(config))
}

fn load_identity(
    identity: &TlsIdentity,
    hostname: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpError> {
    match identity {
        TlsIdentity::SelfSigned => generate_self_signed(hostname),
        TlsIdentity::Pem {
            cert_chain,
            private_key,
        } => parse_pem(cert_chain.as_bytes(), private_key.as_bytes()),
        TlsIdentity::PemFiles {
            cert_chain,
            private_key,
        } => {
            info!("Loading TLS certificate from {}", cert_chain.display());
            let certs = fs::read(cert_chain).map_err(|e| {
                SmtpError::Tls(format!("Failed to open certificate file: {e}"))
            })?;
            let key = fs::read(private_key)
                .map_err(|e| SmtpError::Tls(format!("Failed to open key file: {e}")))?;
            parse_pem(&certs, &key)
        }
    }
}

fn parse_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SmtpError::Tls(format!("Failed to read certificates: {e}")))?;
    if certs.is_empty() {
        return Err(SmtpError::Tls("No certificates found".to_string()));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| SmtpError::Tls(format!("Failed to read private key: {e}")))?
        .ok_or_else(|| SmtpError::Tls("No private key found".to_string()))?;

    Ok((certs, key))
}

/// Self-signed certificate for development use only
fn generate_self_signed(
    hostname: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpError> {
    info!("Generating self-signed certificate for {hostname}");

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .map_err(|e| SmtpError::Tls(format!("Failed to generate certificate: {e}")))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

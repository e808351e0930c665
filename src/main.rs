//! capmail: run a capturing SMTP server from the command line

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use capmail::{AuthType, Email, ServerConfiguration, SmtpServer, TlsIdentity, TransportSecurity};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "capmail", version)]
#[command(about = "Capture outbound e-mail on a local SMTP server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 2525)]
    port: u16,

    /// Host name announced in the greeting
    #[arg(long, default_value = "capmail.local")]
    hostname: String,

    /// Authentication policy: disabled, optional or enforced
    #[arg(long, default_value = "disabled")]
    auth: AuthType,

    /// Transport security: plain, starttls, starttls-enforced or smtps
    #[arg(long, default_value = "plain")]
    security: TransportSecurity,

    /// Login accepted by AUTH
    #[arg(long, default_value = "")]
    login: String,

    /// Password accepted by AUTH
    #[arg(long, default_value = "")]
    password: String,

    /// PEM certificate chain (a self-signed certificate is generated if omitted)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key matching --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Prepend a Received: header to captured messages
    #[arg(long)]
    received_headers: bool,

    /// Read timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfiguration {
        let timeout = (self.timeout > 0).then(|| Duration::from_secs(self.timeout));
        let mut config = ServerConfiguration::new(self.port)
            .with_bind_address(self.bind)
            .with_hostname(&self.hostname)
            .with_auth(self.auth, &self.login, &self.password)
            .with_transport_security(self.security)
            .with_received_headers(self.received_headers)
            .with_read_timeout(timeout);

        if let (Some(cert_chain), Some(private_key)) = (self.tls_cert, self.tls_key) {
            config = config.with_tls_identity(TlsIdentity::PemFiles {
                cert_chain,
                private_key,
            });
        }
        config
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capmail=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config();
    info!("Starting capmail v{}", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = mpsc::channel::<Email>();
    let server = SmtpServer::new(config, tx);

    if let Err(e) = server.start() {
        error!("Failed to start server: {e}");
        std::process::exit(1);
    }

    let mut count = 0;
    while let Ok(email) = rx.recv() {
        count += 1;
        info!(
            "Received email #{} from: <{}> to: {:?}",
            count, email.from, email.to
        );
        if let Some(user) = &email.authenticated_user {
            info!("  Authenticated as: {user}");
        }
        if let Some(subject) = email.subject() {
            info!("  Subject: {subject}");
        }
    }
}

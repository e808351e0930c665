use capmail::{AuthType, ServerConfiguration, SmtpServer};
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{SmtpTransport, Transport};
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;
use std::time::Duration;

fn start(config: ServerConfiguration) -> (SmtpServer, mpsc::Receiver<capmail::Email>) {
    let (tx, rx) = mpsc::channel();
    let server = SmtpServer::new(
        config.with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        tx,
    );
    server.start().expect("server start failed");
    (server, rx)
}

fn message() -> Result<Message, Box<dyn Error>> {
    Ok(Message::builder()
        .from("花子 <hanako@example.com>".parse::<Mailbox>()?)
        .to("太郎 <tarou@example.com>".parse::<Mailbox>()?)
        .subject("件名")
        .body("本文".to_owned())?)
}

#[test]
fn basic_lettre_send() -> Result<(), Box<dyn Error>> {
    let (server, rx) = start(ServerConfiguration::new(0));

    let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
        .port(server.port())
        .build();

    mailer.send(&message()?)?;

    let email = rx.recv_timeout(Duration::from_secs(1))?;
    assert_eq!(email.from, "hanako@example.com");
    assert_eq!(email.to, vec!["tarou@example.com"]);
    assert!(email.authenticated_user.is_none());

    Ok(())
}

#[test]
fn lettre_send_with_credentials() -> Result<(), Box<dyn Error>> {
    for mechanism in [Mechanism::Plain, Mechanism::Login] {
        let (server, rx) =
            start(ServerConfiguration::new(0).with_auth(AuthType::Enforced, "user", "secret"));

        let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
            .port(server.port())
            .credentials(Credentials::new("user".to_owned(), "secret".to_owned()))
            .authentication(vec![mechanism])
            .build();

        mailer.send(&message()?)?;

        let email = rx.recv_timeout(Duration::from_secs(1))?;
        assert_eq!(email.authenticated_user, Some("user".to_string()));
    }

    Ok(())
}

#[test]
fn lettre_wrong_credentials_rejected() -> Result<(), Box<dyn Error>> {
    let (server, rx) =
        start(ServerConfiguration::new(0).with_auth(AuthType::Enforced, "user", "secret"));

    let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
        .port(server.port())
        .credentials(Credentials::new("user".to_owned(), "nope".to_owned()))
        .authentication(vec![Mechanism::Plain])
        .build();

    assert!(mailer.send(&message()?).is_err());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    Ok(())
}

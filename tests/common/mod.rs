//! Helpers shared by the integration tests

#![allow(dead_code)]

use capmail::{Email, ServerConfiguration, SmtpServer, TlsIdentity};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::{Arc, mpsc};
use std::time::Duration;

/// Start a server on an ephemeral loopback port
pub fn start_test_server(config: ServerConfiguration) -> (SmtpServer, mpsc::Receiver<Email>) {
    let (tx, rx) = mpsc::channel::<Email>();
    let server = SmtpServer::new(
        config
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_hostname("test.local"),
        tx,
    );
    server.start().unwrap();
    (server, rx)
}

/// A certificate for "localhost" and a client configuration trusting it
pub struct TestPki {
    pub identity: TlsIdentity,
    pub client_config: Arc<ClientConfig>,
}

impl TestPki {
    pub fn new() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(cert.der().to_vec())).unwrap();

        let client_config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(roots)
                .with_no_client_auth();

        Self {
            identity: TlsIdentity::Pem {
                cert_chain: cert.pem(),
                private_key: key_pair.serialize_pem(),
            },
            client_config: Arc::new(client_config),
        }
    }
}

pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl ClientStream {
    fn into_tcp(self) -> TcpStream {
        match self {
            Self::Plain(stream) => stream,
            Self::Tls(stream) => stream.sock,
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
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

/// Line-oriented SMTP client speaking over plain TCP or TLS
pub struct Client {
    reader: BufReader<ClientStream>,
}

impl Client {
    pub fn connect(server: &SmtpServer) -> Self {
        Self::connect_port(server.port())
    }

    pub fn connect_port(port: u16) -> Self {
        Self::from_stream(ClientStream::Plain(Self::tcp(port)))
    }

    /// Connect with TLS from the first byte, as an SMTPS client does
    pub fn connect_tls(server: &SmtpServer, config: &Arc<ClientConfig>) -> Self {
        let conn = Self::tls_connection(config);
        let stream = StreamOwned::new(conn, Self::tcp(server.port()));
        Self::from_stream(ClientStream::Tls(Box::new(stream)))
    }

    pub fn tcp(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn from_stream(stream: ClientStream) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn tls_connection(config: &Arc<ClientConfig>) -> ClientConnection {
        let server_name = ServerName::try_from("localhost").unwrap();
        ClientConnection::new(Arc::clone(config), server_name).unwrap()
    }

    /// Switch to TLS after a `220` answer to STARTTLS
    pub fn upgrade(self, config: &Arc<ClientConfig>) -> Self {
        let tcp = self.reader.into_inner().into_tcp();
        let stream = StreamOwned::new(Self::tls_connection(config), tcp);
        Self::from_stream(ClientStream::Tls(Box::new(stream)))
    }

    /// Read a complete reply, following `250-` continuation lines
    pub fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    pub fn send(&mut self, line: &str) {
        let stream = self.reader.get_mut();
        write!(stream, "{line}\r\n").unwrap();
        stream.flush().unwrap();
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        let stream = self.reader.get_mut();
        stream.write_all(bytes).unwrap();
        stream.flush().unwrap();
    }

    pub fn command(&mut self, line: &str) -> String {
        self.send(line);
        self.reply()
    }

    /// Run MAIL/RCPT/DATA and send `body`, returning the final reply
    pub fn send_mail(&mut self, from: &str, to: &[&str], body: &[&str]) -> String {
        let response = self.command(&format!("MAIL FROM:<{from}>"));
        assert!(response.starts_with("250"), "MAIL FROM: {response}");
        for rcpt in to {
            let response = self.command(&format!("RCPT TO:<{rcpt}>"));
            assert!(response.starts_with("250"), "RCPT TO: {response}");
        }
        let response = self.command("DATA");
        assert!(response.starts_with("354"), "DATA: {response}");
        for line in body {
            self.send(line);
        }
        self.command(".")
    }

    /// Everything the server sends until it closes the connection
    pub fn read_until_closed(&mut self) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = self.reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    /// True once the server has closed the connection
    pub fn is_closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.reader.read_line(&mut line), Ok(0) | Err(_))
    }
}

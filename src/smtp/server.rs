//! SMTP server implementation

use crate::smtp::auth::CredentialsValidator;
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::config::{ServerConfiguration, SinkFailurePolicy};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;
use crate::smtp::sink::MailSink;
use crate::smtp::tls::{TlsNegotiator, Transport};

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

/// Longest line read from the socket in one piece, CRLF included
const LINE_READ_LIMIT: usize = SmtpLimits::TEXT_LINE_MAX_LENGTH + 1;

/// How long `stop()` waits for the wake-up connection
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Embedded SMTP server that hands every captured message to a [`MailSink`]
pub struct SmtpServer {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

/// State read by the accept thread and every session thread
struct Shared {
    config: ServerConfiguration,
    validator: CredentialsValidator,
    sink: Box<dyn MailSink>,
    shutdown: AtomicBool,
    connections: Mutex<HashMap<u64, TcpStream>>,
    next_id: AtomicU64,
}

enum Lifecycle {
    Idle,
    Running {
        local_addr: SocketAddr,
        accept_thread: JoinHandle<()>,
    },
    Stopped,
}

/// Outcome of one bounded line read
enum Line {
    Eof,
    Complete,
    TooLong,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(config: ServerConfiguration, sink: impl MailSink + 'static) -> Self {
        let validator = CredentialsValidator::new(&config.login, &config.password);
        Self {
            shared: Arc::new(Shared {
                config,
                validator,
                sink: Box::new(sink),
                shutdown: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.shared.config
    }

    /// Bind the configured address and start accepting in the background
    pub fn start(&self) -> Result<(), SmtpError> {
        self.ensure_idle(&self.lock_lifecycle())?;

        let config = &self.shared.config;
        let listener = TcpListener::bind((config.bind_address, config.port))?;
        self.start_with_listener(listener)
    }

    /// Start accepting on an already bound listener
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<(), SmtpError> {
        let mut lifecycle = self.lock_lifecycle();
        self.ensure_idle(&lifecycle)?;

        // Certificate problems surface here rather than on the first client
        let negotiator = Arc::new(TlsNegotiator::new(&self.shared.config)?);
        let local_addr = listener.local_addr()?;

        info!(
            "SMTP server listening on {local_addr} ({}, auth {:?})",
            self.shared.config.transport_security, self.shared.config.auth_type
        );

        let shared = Arc::clone(&self.shared);
        let accept_thread = thread::Builder::new()
            .name(format!("smtp-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, shared, negotiator))?;

        *lifecycle = Lifecycle::Running {
            local_addr,
            accept_thread,
        };
        Ok(())
    }

    /// Stop accepting, close live sessions and wait for the accept thread.
    ///
    /// A stopped server cannot be started again. Stopping twice is a no-op.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_lifecycle(), Lifecycle::Stopped);
        let Lifecycle::Running {
            local_addr,
            accept_thread,
        } = previous
        else {
            return;
        };

        info!("Stopping SMTP server on {local_addr}");
        self.shared.shutdown.store(true, Ordering::SeqCst);

        // Unblock accept(); the loop sees the flag and drops the listener
        if let Err(e) = TcpStream::connect_timeout(&wake_address(local_addr), WAKE_TIMEOUT) {
            debug!("Wake-up connection to {local_addr} failed: {e}");
        }
        if accept_thread.join().is_err() {
            error!("Accept thread for {local_addr} panicked");
        }

        let connections = self.shared.lock_connections();
        for stream in connections.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        debug!("Closed {} open session(s)", connections.len());
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_lifecycle(), Lifecycle::Running { .. })
    }

    /// Address actually bound, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.lock_lifecycle() {
            Lifecycle::Running { local_addr, .. } => Some(local_addr),
            _ => None,
        }
    }

    /// Bound port while running, the configured port otherwise
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map_or(self.shared.config.port, |addr| addr.port())
    }

    /// Number of sessions currently open
    pub fn connection_count(&self) -> usize {
        self.shared.lock_connections().len()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_idle(&self, lifecycle: &Lifecycle) -> Result<(), SmtpError> {
        match lifecycle {
            Lifecycle::Idle => Ok(()),
            Lifecycle::Running { .. } => Err(SmtpError::AlreadyRunning),
            Lifecycle::Stopped => Err(SmtpError::ServerStopped),
        }
    }
}

impl Drop for SmtpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an accepted socket, or refuse it when the server is full
    fn register(&self, stream: &TcpStream) -> io::Result<Option<u64>> {
        let mut connections = self.lock_connections();
        if connections.len() >= self.config.max_connections {
            return Ok(None);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        connections.insert(id, stream.try_clone()?);
        Ok(Some(id))
    }

    fn unregister(&self, id: u64) {
        self.lock_connections().remove(&id);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, negotiator: Arc<TlsNegotiator>) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        match stream {
            Ok(stream) => {
                if let Err(e) = dispatch(stream, &shared, &negotiator) {
                    warn!("Error setting up connection: {e}");
                }
            }
            Err(e) => {
                error!("Error accepting connection: {e}");
            }
        }
    }

    debug!("Accept loop finished");
}

/// Hand an accepted socket to its own session thread
fn dispatch(
    mut stream: TcpStream,
    shared: &Arc<Shared>,
    negotiator: &Arc<TlsNegotiator>,
) -> Result<(), SmtpError> {
    let Some(id) = shared.register(&stream)? else {
        warn!(
            "Refusing connection from {:?}: {} sessions open",
            stream.peer_addr().ok(),
            shared.config.max_connections
        );
        if !negotiator.is_implicit() {
            let refusal = SmtpResponse::too_many_connections(&shared.config.hostname);
            let _ = send_response(&mut stream, &refusal);
        }
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    };

    stream.set_read_timeout(shared.config.read_timeout)?;

    let session_shared = Arc::clone(shared);
    let session_negotiator = Arc::clone(negotiator);
    let spawned = thread::Builder::new()
        .name(format!("smtp-session-{id}"))
        .spawn(move || {
            let peer = stream.peer_addr().ok();
            debug!("Session {id} opened for {peer:?}");
            if let Err(e) = handle_client(stream, &session_shared, &session_negotiator) {
                debug!("Session {id} with {peer:?} ended with error: {e}");
            }
            session_shared.unregister(id);
            debug!("Session {id} closed");
        });

    if let Err(e) = spawned {
        error!("Failed to spawn session thread: {e}");
        shared.unregister(id);
        return Err(e.into());
    }
    Ok(())
}

/// Run one SMTP session to completion
fn handle_client(
    stream: TcpStream,
    shared: &Shared,
    negotiator: &TlsNegotiator,
) -> Result<(), SmtpError> {
    let config = &shared.config;
    let peer = stream.peer_addr().ok();

    // Implicit TLS: nothing is read or written before the handshake
    let transport = if negotiator.is_implicit() {
        negotiator.wrap_as_server_tls(stream)?
    } else {
        Transport::Plain(stream)
    };

    let mut session = SmtpSession::new()
        .with_tls(transport.is_tls())
        .with_max_message_size(config.max_message_size);
    if let Some(peer) = peer {
        session = session.with_peer(peer);
    }

    let command_handler = SmtpCommandHandler::new(config, &shared.validator, negotiator);
    let mut reader = BufReader::new(transport);

    send_response(
        reader.get_mut(),
        &SmtpResponse::greeting(&config.hostname, &config.software_name),
    )?;

    let mut line_buffer = Vec::new();
    let mut data_error: Option<SmtpError> = None;
    let outcome = loop {
        let line = match read_line(&mut reader, &mut line_buffer) {
            Ok(line) => line,
            Err(e) if is_timeout(&e) => {
                info!("Session with {peer:?} timed out");
                break Ok(());
            }
            Err(e) => break Err(SmtpError::from(e)),
        };

        let result = match line {
            // A transaction or SASL exchange was cut short
            Line::Eof if session.is_in_data_mode() || session.is_authenticating() => {
                Err(SmtpError::ConnectionClosed)
            }
            Line::Eof => break Ok(()),
            Line::TooLong if session.is_in_data_mode() => {
                data_error.get_or_insert(SmtpError::LineTooLong {
                    max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
                });
                continue;
            }
            Line::TooLong => Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            }),
            Line::Complete if session.is_in_data_mode() => {
                if !is_data_terminator(&line_buffer) {
                    if data_error.is_none() {
                        let unstuffed = match line_buffer.first() {
                            Some(b'.') => &line_buffer[1..],
                            _ => &line_buffer[..],
                        };
                        if let Err(e) = session.add_data_line(unstuffed) {
                            // Keep consuming the body, the error is reported after "."
                            data_error = Some(e);
                        }
                    }
                    continue;
                }

                match data_error.take() {
                    Some(e) => {
                        session.reset();
                        Err(e)
                    }
                    None => Ok(complete_message(shared, &command_handler, &mut session)),
                }
            }
            Line::Complete => {
                let text = String::from_utf8_lossy(&line_buffer);
                let command = text.trim();

                if session.is_authenticating() {
                    command_handler.process_auth_response(command, &mut session)
                } else if command.is_empty() {
                    continue;
                } else {
                    // Arguments may carry credentials, log the verb only
                    let verb = command.split_whitespace().next().unwrap_or_default();
                    debug!("{verb} from {peer:?}");
                    command_handler.process_command(command, &mut session)
                }
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => error_response(&e),
        };
        if let Err(e) = send_response(reader.get_mut(), &response) {
            break Err(e);
        }

        if session.take_starttls_request() {
            // Anything pipelined behind STARTTLS is plaintext and is dropped.
            // A failed handshake consumes the socket, nothing more is sent.
            let transport = reader.into_inner().upgrade(negotiator)?;
            reader = BufReader::new(transport);
            session.tls_established();
            debug!("Session with {peer:?} upgraded to TLS");
            continue;
        }

        if session.is_closed() {
            break Ok(());
        }
    };

    reader.into_inner().close();
    outcome
}

/// Finish DATA and hand the message to the sink
fn complete_message(
    shared: &Shared,
    command_handler: &SmtpCommandHandler<'_>,
    session: &mut SmtpSession,
) -> SmtpResponse {
    let recipients = session.recipient_count();
    let size = session.current_data_size();

    let email = match command_handler.finish_message(session) {
        Ok(email) => email,
        Err(e) => {
            session.reset();
            return error_response(&e);
        }
    };

    let from = email.from.clone();

    match shared.sink.deliver(email) {
        Ok(()) => {
            info!("Accepted message from <{from}> for {recipients} recipient(s), {size} bytes");
            SmtpResponse::ok()
        }
        Err(e) => match shared.config.sink_failure {
            SinkFailurePolicy::Reject => {
                warn!("Rejecting message from <{from}>: {e}");
                error_response(&SmtpError::from(e))
            }
            SinkFailurePolicy::Ignore => {
                warn!("Dropping message from <{from}>: {e}");
                SmtpResponse::ok()
            }
        },
    }
}

/// Read one line without letting a client grow the buffer unbounded
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Line> {
    buf.clear();
    let read = reader
        .by_ref()
        .take(LINE_READ_LIMIT as u64)
        .read_until(b'\n', buf)?;

    if read == 0 {
        return Ok(Line::Eof);
    }
    if buf.ends_with(b"\n") || read < LINE_READ_LIMIT {
        return Ok(Line::Complete);
    }

    // Discard the rest of the overlong line
    let mut rest = Vec::new();
    loop {
        rest.clear();
        let read = reader
            .by_ref()
            .take(LINE_READ_LIMIT as u64)
            .read_until(b'\n', &mut rest)?;
        if read == 0 || rest.ends_with(b"\n") {
            return Ok(Line::TooLong);
        }
    }
}

fn is_data_terminator(line: &[u8]) -> bool {
    matches!(line, b".\r\n" | b".\n" | b".")
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Loopback address that reaches a listener bound to `addr`
fn wake_address(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

fn error_response(e: &SmtpError) -> SmtpResponse {
    SmtpResponse::error(e.to_response_code(), &e.to_response_message())
}

/// Send a response to the client
fn send_response<W: Write>(stream: &mut W, response: &SmtpResponse) -> Result<(), SmtpError> {
    let formatted = response.format();
    for line in formatted.split_inclusive("\r\n") {
        stream.write_all(truncate_reply_line(line).as_bytes())?;
    }
    stream.flush()?;
    Ok(())
}

/// Cut one reply line down to the RFC 5321 limit, keeping its CRLF
fn truncate_reply_line(line: &str) -> Cow<'_, str> {
    if line.len() <= SmtpLimits::REPLY_LINE_MAX_LENGTH {
        return Cow::Borrowed(line);
    }

    let mut end = SmtpLimits::REPLY_LINE_MAX_LENGTH - 2;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}\r\n", &line[..end]))
}

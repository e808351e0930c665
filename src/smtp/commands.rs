//! Implementation of SMTP commands
//!
//! The handler is pure protocol logic: it validates a command against the
//! session state and the server policies, updates the session and returns
//! the reply. Socket work (the DATA body, the TLS handshake) is left to the
//! server loop, which inspects the session after each reply.

use tracing::{debug, info};

use crate::smtp::auth::{
    self, CredentialsValidator, Mechanism, PASSWORD_CHALLENGE, SaslExchange, USERNAME_CHALLENGE,
};
use crate::smtp::config::{AuthType, ServerConfiguration};
use crate::smtp::email::Email;
use crate::smtp::error::{Policy, SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;
use crate::smtp::tls::TlsNegotiator;

/// Commands allowed before STARTTLS when TLS is mandatory
const PRE_TLS_COMMANDS: [&str; 6] = ["EHLO", "HELO", "STARTTLS", "NOOP", "RSET", "QUIT"];

/// Handles SMTP commands and returns appropriate responses
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    config: &'a ServerConfiguration,
    validator: &'a CredentialsValidator,
    negotiator: &'a TlsNegotiator,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(
        config: &'a ServerConfiguration,
        validator: &'a CredentialsValidator,
        negotiator: &'a TlsNegotiator,
    ) -> Self {
        Self {
            config,
            validator,
            negotiator,
        }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        // Check command line length
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();
        self.check_tls_policy(&cmd, session)?;

        match cmd.as_str() {
            "HELO" => self.handle_helo(parts, session),
            "EHLO" => self.handle_ehlo(parts, session),
            "STARTTLS" => self.handle_starttls(parts, session),
            "AUTH" => self.handle_auth(parts, session),
            "MAIL" => self.handle_mail(parts, session),
            "RCPT" => self.handle_rcpt(parts, session),
            "DATA" => self.handle_data(parts, session),
            "RSET" => self.handle_rset(session),
            "NOOP" => self.handle_noop(),
            "QUIT" => self.handle_quit(session),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    /// Process the client's answer to an AUTH challenge
    pub fn process_auth_response(
        &self,
        line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let exchange = session.take_auth_exchange().ok_or_else(|| {
            SmtpError::InvalidState("no authentication in progress".to_string())
        })?;

        match exchange {
            SaslExchange::PlainResponse => {
                let payload = auth::decode_response(line)?;
                let (username, password) = auth::parse_plain(&payload)?;
                self.authenticate(username, &password, session)
            }
            SaslExchange::LoginUsername => {
                let username = auth::decode_response(line)?;
                session.begin_auth(SaslExchange::LoginPassword { username });
                Ok(SmtpResponse::auth_challenge(PASSWORD_CHALLENGE))
            }
            SaslExchange::LoginPassword { username } => {
                let password = auth::decode_response(line)?;
                self.authenticate(username, &password, session)
            }
        }
    }

    /// Turn the collected DATA into the message handed to the sink
    pub fn finish_message(&self, session: &mut SmtpSession) -> Result<Email, SmtpError> {
        let received = self
            .config
            .received_headers
            .then(|| self.received_header(session));

        let mut email = session.finish_data_collection()?;
        if let Some(header) = received {
            let mut data = header.into_bytes();
            data.append(&mut email.data);
            email.data = data;
        }
        Ok(email)
    }

    /// Refuse everything but the pre-TLS commands while TLS is still owed
    fn check_tls_policy(&self, cmd: &str, session: &SmtpSession) -> Result<(), SmtpError> {
        let required = self
            .negotiator
            .is_tls_required_before_mail(session.tls_active);

        if required && !session.tls_active && !PRE_TLS_COMMANDS.contains(&cmd) {
            return Err(SmtpError::PolicyViolation(Policy::TlsRequired));
        }
        Ok(())
    }

    fn check_auth_policy(&self, session: &SmtpSession) -> Result<(), SmtpError> {
        if self.config.auth_type == AuthType::Enforced && !session.is_authenticated() {
            return Err(SmtpError::PolicyViolation(Policy::AuthenticationRequired));
        }
        Ok(())
    }

    /// Handle HELO command
    fn handle_helo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "HELO requires domain argument".to_string(),
            ));
        }

        let client_domain = parts[1].to_string();
        session.set_client_domain(client_domain.clone())?;

        Ok(SmtpResponse::helo(&self.config.hostname, &client_domain))
    }

    /// Handle EHLO command
    fn handle_ehlo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "EHLO requires domain argument".to_string(),
            ));
        }

        let client_domain = parts[1].to_string();
        session.set_client_domain(client_domain.clone())?;
        session.extended = true;

        Ok(SmtpResponse::ehlo(
            &self.config.hostname,
            &client_domain,
            self.capabilities(session),
        ))
    }

    fn capabilities(&self, session: &SmtpSession) -> Vec<String> {
        let mut capabilities = vec![
            "PIPELINING".to_owned(),
            "8BITMIME".to_owned(),
            format!("SIZE {}", self.config.max_message_size),
        ];

        if self.negotiator.is_tls_offerable(session.tls_active) {
            capabilities.push("STARTTLS".to_owned());
        }

        let tls_pending = self
            .negotiator
            .is_tls_required_before_mail(session.tls_active)
            && !session.tls_active;
        if self.config.auth_type != AuthType::Disabled && !tls_pending {
            capabilities.push("AUTH PLAIN LOGIN".to_owned());
        }

        capabilities
    }

    /// Handle STARTTLS command
    fn handle_starttls(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "STARTTLS command takes no arguments".to_string(),
            ));
        }

        if session.tls_active {
            return Err(SmtpError::InvalidState("TLS already active".to_string()));
        }

        if !self.negotiator.is_tls_offerable(session.tls_active) {
            return Err(SmtpError::TlsNotAvailable);
        }

        if !session.can_execute_command("STARTTLS") {
            return Err(SmtpError::InvalidState(
                "STARTTLS not permitted during a mail transaction".to_string(),
            ));
        }

        session.request_starttls();
        Ok(SmtpResponse::starttls_ready())
    }

    /// Handle AUTH command
    fn handle_auth(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if self.config.auth_type == AuthType::Disabled {
            return Err(SmtpError::NotImplemented(
                "authentication is disabled".to_string(),
            ));
        }

        if session.is_authenticated() {
            return Err(SmtpError::InvalidState("already authenticated".to_string()));
        }

        if !session.can_execute_command("AUTH") {
            return Err(SmtpError::InvalidState(
                "AUTH requires EHLO first and no open transaction".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "AUTH requires a mechanism".to_string(),
            ));
        }

        let mechanism = Mechanism::parse(parts[1])?;
        let initial_response = parts
            .get(2)
            .map(|response| auth::decode_response(response))
            .transpose()?;

        match (mechanism, initial_response) {
            // An empty PLAIN initial response ("=") still needs the credentials
            (Mechanism::Plain, Some(payload)) if !payload.is_empty() => {
                let (username, password) = auth::parse_plain(&payload)?;
                self.authenticate(username, &password, session)
            }
            (Mechanism::Plain, _) => {
                session.begin_auth(SaslExchange::PlainResponse);
                Ok(SmtpResponse::auth_challenge(""))
            }
            (Mechanism::Login, Some(username)) => {
                session.begin_auth(SaslExchange::LoginPassword { username });
                Ok(SmtpResponse::auth_challenge(PASSWORD_CHALLENGE))
            }
            (Mechanism::Login, None) => {
                session.begin_auth(SaslExchange::LoginUsername);
                Ok(SmtpResponse::auth_challenge(USERNAME_CHALLENGE))
            }
        }
    }

    fn authenticate(
        &self,
        username: String,
        password: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if let Err(e) = self.validator.validate(&username, password) {
            debug!("Authentication failed for '{username}'");
            return Err(e);
        }

        info!("Client authenticated as '{username}'");
        session.set_authenticated(username);
        Ok(SmtpResponse::auth_success())
    }

    /// Handle MAIL command
    fn handle_mail(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        self.check_auth_policy(session)?;

        if !session.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "MAIL requires FROM argument".to_string(),
            ));
        }

        let from_part = parts[1..].join(" ");
        let Some(path) = strip_keyword(&from_part, "FROM:") else {
            return Err(SmtpError::InvalidSyntax(
                "MAIL command must be 'MAIL FROM:<address>'".to_string(),
            ));
        };

        let (addr, params) = parse_path(path, "FROM")?;
        self.check_mail_parameters(&params)?;

        // The null reverse-path is valid
        if !addr.is_empty() {
            self.validate_email_address(&addr)?;
        }

        session.set_sender(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command
    fn handle_rcpt(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        self.check_auth_policy(session)?;

        if !session.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "RCPT requires TO argument".to_string(),
            ));
        }

        let to_part = parts[1..].join(" ");
        let Some(path) = strip_keyword(&to_part, "TO:") else {
            return Err(SmtpError::InvalidSyntax(
                "RCPT command must be 'RCPT TO:<address>'".to_string(),
            ));
        };

        let (addr, _params) = parse_path(path, "TO")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        self.validate_email_address(&addr)?;

        session.add_recipient(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle DATA command
    fn handle_data(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        self.check_auth_policy(session)?;

        if !session.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.start_data_mode()?;

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RSET") {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        session.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle NOOP command
    fn handle_noop(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command
    fn handle_quit(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        session.close();
        Ok(SmtpResponse::quit())
    }

    /// Reject a declared SIZE the server would refuse anyway
    fn check_mail_parameters(&self, params: &[&str]) -> Result<(), SmtpError> {
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.eq_ignore_ascii_case("SIZE") {
                let size: usize = value.parse().map_err(|_| {
                    SmtpError::InvalidSyntax("SIZE parameter must be a number".to_string())
                })?;
                if size > self.config.max_message_size {
                    return Err(SmtpError::TooMuchData {
                        max: self.config.max_message_size,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate email address format and size limits
    fn validate_email_address(&self, addr: &str) -> Result<(), SmtpError> {
        // Bare local parts such as "postmaster" are accepted
        let Some((user_part, domain_part)) = addr.rsplit_once('@') else {
            if addr.len() > SmtpLimits::USER_MAX_LENGTH {
                return Err(SmtpError::UserTooLong {
                    max: SmtpLimits::USER_MAX_LENGTH,
                });
            }
            return Ok(());
        };

        if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
            return Err(SmtpError::UserTooLong {
                max: SmtpLimits::USER_MAX_LENGTH,
            });
        }

        if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        if user_part.is_empty() || domain_part.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "Invalid email address format".to_string(),
            ));
        }

        Ok(())
    }

    /// Trace header in the RFC 5321 / RFC 3848 form
    fn received_header(&self, session: &SmtpSession) -> String {
        let helo = session.client_domain.as_deref().unwrap_or("unknown");
        let peer = session
            .peer
            .map(|addr| format!(" ([{}])", addr.ip()))
            .unwrap_or_default();
        let mut protocol = String::from(if session.extended { "ESMTP" } else { "SMTP" });
        if session.tls_active {
            protocol.push('S');
        }
        if session.is_authenticated() {
            protocol.push('A');
        }

        format!(
            "Received: from {helo}{peer}\r\n        by {} ({}) with {protocol};\r\n        {}\r\n",
            self.config.hostname,
            self.config.software_name,
            chrono::Local::now().to_rfc2822()
        )
    }
}

/// Case-insensitively strip "FROM:" / "TO:" and return the rest
fn strip_keyword<'s>(argument: &'s str, keyword: &str) -> Option<&'s str> {
    let head = argument.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| &argument[keyword.len()..])
}

/// Split `<address> [PARAM=VALUE ...]`
fn parse_path<'s>(rest: &'s str, label: &str) -> Result<(String, Vec<&'s str>), SmtpError> {
    let rest = rest.trim();
    if !rest.starts_with('<') {
        return Err(SmtpError::InvalidSyntax(format!(
            "{label} address must be enclosed in angle brackets"
        )));
    }

    let end = rest.find('>').ok_or_else(|| {
        SmtpError::InvalidSyntax(format!(
            "{label} address must be enclosed in angle brackets"
        ))
    })?;

    let addr = rest[1..end].trim().to_string();
    let params = rest[end + 1..].split_whitespace().collect();
    Ok((addr, params))
}

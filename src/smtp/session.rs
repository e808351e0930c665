//! SMTP session state management

use std::net::SocketAddr;

use crate::smtp::auth::SaslExchange;
use crate::smtp::email::Email;
use crate::smtp::error::{SmtpError, SmtpLimits};

/// Represents the current state of an SMTP session
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO/EHLO
    Initial,
    /// HELO received - ready for MAIL, AUTH or STARTTLS
    GreetingReceived,
    /// An AUTH exchange is waiting for the client's next line
    Authenticating,
    /// MAIL FROM received - ready for RCPT commands
    MailReceived,
    /// At least one RCPT TO received - ready for DATA or more RCPT commands
    RecipientsReceived,
    /// DATA command received - collecting email data
    DataMode,
    /// QUIT received
    Closed,
}

/// Manages the state and data for a single SMTP session
#[derive(Debug)]
pub struct SmtpSession {
    /// Current state of the session
    pub state: SmtpState,
    /// Sender address from MAIL FROM command
    pub from: Option<String>,
    /// List of recipients from RCPT TO commands
    pub to: Vec<String>,
    /// Message bytes collected during DATA mode
    pub data: Vec<u8>,
    /// Client domain from HELO/EHLO command
    pub client_domain: Option<String>,
    /// Whether the client greeted with EHLO
    pub extended: bool,
    /// Login that completed AUTH on this session
    pub authenticated_user: Option<String>,
    /// Whether the channel is encrypted
    pub tls_active: bool,
    /// Remote address, when known
    pub peer: Option<SocketAddr>,
    max_message_size: usize,
    auth_exchange: Option<SaslExchange>,
    starttls_requested: bool,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new() -> Self {
        Self {
            state: SmtpState::Initial,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            client_domain: None,
            extended: false,
            authenticated_user: None,
            tls_active: false,
            peer: None,
            max_message_size: SmtpLimits::MAX_DATA_SIZE,
            auth_exchange: None,
            starttls_requested: false,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_tls(mut self, tls_active: bool) -> Self {
        self.tls_active = tls_active;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Reset the session to post-HELO state (clears transaction data)
    pub fn reset(&mut self) {
        self.state = SmtpState::GreetingReceived;
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.auth_exchange = None;
        // Keep client_domain as it's set by HELO
    }

    /// Complete reset including HELO and authentication state
    pub fn full_reset(&mut self) {
        self.reset();
        self.state = SmtpState::Initial;
        self.client_domain = None;
        self.extended = false;
        self.authenticated_user = None;
        self.starttls_requested = false;
    }

    /// Set the sender address, empty for the null reverse-path
    pub fn set_sender(&mut self, sender: String) -> Result<(), SmtpError> {
        if sender.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.from = Some(sender);
        self.to.clear();
        self.data.clear();
        self.state = SmtpState::MailReceived;
        Ok(())
    }

    /// Add a recipient address
    pub fn add_recipient(&mut self, recipient: String) -> Result<(), SmtpError> {
        if recipient.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        if self.to.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        self.to.push(recipient);
        self.state = SmtpState::RecipientsReceived;
        Ok(())
    }

    /// Start data collection mode
    pub fn start_data_mode(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsReceived {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        self.data.clear();
        self.state = SmtpState::DataMode;
        Ok(())
    }

    pub fn is_in_data_mode(&self) -> bool {
        self.state == SmtpState::DataMode
    }

    /// Append one dot-unstuffed line, including its line ending
    pub fn add_data_line(&mut self, line: &[u8]) -> Result<(), SmtpError> {
        if line.len() > SmtpLimits::TEXT_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
            });
        }

        if self.data.len() + line.len() > self.max_message_size {
            return Err(SmtpError::TooMuchData {
                max: self.max_message_size,
            });
        }

        self.data.extend_from_slice(line);
        Ok(())
    }

    /// Finish data collection and create an email
    pub fn finish_data_collection(&mut self) -> Result<Email, SmtpError> {
        if !self.is_in_data_mode() {
            return Err(SmtpError::InvalidState(
                "Not in data collection mode".to_string(),
            ));
        }

        let from = self
            .from
            .take()
            .ok_or_else(|| SmtpError::InvalidState("No sender specified".to_string()))?;

        if self.to.is_empty() {
            return Err(SmtpError::InvalidState(
                "No recipients specified".to_string(),
            ));
        }

        let email = Email::new(
            from,
            std::mem::take(&mut self.to),
            self.authenticated_user.clone(),
            std::mem::take(&mut self.data),
        );

        self.state = SmtpState::GreetingReceived;
        Ok(email)
    }

    /// Set the client domain from HELO/EHLO command
    pub fn set_client_domain(&mut self, domain: String) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain);
        self.extended = false;
        self.reset(); // Clear any existing transaction
        Ok(())
    }

    /// Park an AUTH exchange until the client answers the challenge
    pub fn begin_auth(&mut self, exchange: SaslExchange) {
        self.auth_exchange = Some(exchange);
        self.state = SmtpState::Authenticating;
    }

    /// Take the pending AUTH exchange, returning to the ready state
    pub fn take_auth_exchange(&mut self) -> Option<SaslExchange> {
        let exchange = self.auth_exchange.take();
        if self.state == SmtpState::Authenticating {
            self.state = SmtpState::GreetingReceived;
        }
        exchange
    }

    pub fn is_authenticating(&self) -> bool {
        self.state == SmtpState::Authenticating
    }

    pub fn set_authenticated(&mut self, user: String) {
        self.authenticated_user = Some(user);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    /// Remember that the client asked for STARTTLS and was told to go ahead
    pub fn request_starttls(&mut self) {
        self.starttls_requested = true;
    }

    pub fn take_starttls_request(&mut self) -> bool {
        std::mem::take(&mut self.starttls_requested)
    }

    /// Forget everything learned over the plaintext channel
    pub fn tls_established(&mut self) {
        self.full_reset();
        self.tls_active = true;
    }

    pub fn close(&mut self) {
        self.state = SmtpState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SmtpState::Closed
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            "EHLO" | "HELO" => true, // can be sent at any time
            "AUTH" => self.state == SmtpState::GreetingReceived && !self.is_authenticated(),
            "STARTTLS" => matches!(
                self.state,
                SmtpState::Initial | SmtpState::GreetingReceived
            ),
            "MAIL" => self.state == SmtpState::GreetingReceived,
            "RCPT" => {
                self.state == SmtpState::MailReceived || self.state == SmtpState::RecipientsReceived
            }
            "DATA" => self.state == SmtpState::RecipientsReceived,
            "RSET" => self.state != SmtpState::Initial,
            "NOOP" => true, // NOOP can be sent at any time
            "QUIT" => true, // QUIT can be sent at any time
            _ => false,
        }
    }

    /// Get the current recipient count
    pub fn recipient_count(&self) -> usize {
        self.to.len()
    }

    /// Get the current data size
    pub fn current_data_size(&self) -> usize {
        self.data.len()
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}

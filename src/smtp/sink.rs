//! Destination for captured mail

use std::sync::mpsc;

use crate::smtp::email::Email;
use crate::smtp::error::DeliveryError;

/// Receives every message a session completes.
///
/// Called once per finished `DATA`, from the session's own thread. Sessions
/// run concurrently, so implementations must tolerate parallel calls.
pub trait MailSink: Send + Sync {
    fn deliver(&self, email: Email) -> Result<(), DeliveryError>;
}

impl MailSink for mpsc::Sender<Email> {
    fn deliver(&self, email: Email) -> Result<(), DeliveryError> {
        self.send(email)
            .map_err(|_| DeliveryError("receiver has been dropped".to_string()))
    }
}

impl MailSink for mpsc::SyncSender<Email> {
    fn deliver(&self, email: Email) -> Result<(), DeliveryError> {
        self.send(email)
            .map_err(|_| DeliveryError("receiver has been dropped".to_string()))
    }
}

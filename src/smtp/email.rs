//! Captured message

use std::borrow::Cow;
use std::time::SystemTime;

/// A message accepted by the server, envelope plus raw content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Reverse-path from `MAIL FROM` (empty for the null sender)
    pub from: String,

    /// Forward-paths from `RCPT TO`, in order
    pub to: Vec<String>,

    /// Login of the session that submitted the message, if it authenticated
    pub authenticated_user: Option<String>,

    /// Message bytes as received after dot-unstuffing, line endings preserved
    pub data: Vec<u8>,

    /// When the message was accepted
    pub timestamp: SystemTime,
}

impl Email {
    pub fn new(
        from: String,
        to: Vec<String>,
        authenticated_user: Option<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            from,
            to,
            authenticated_user,
            data,
            timestamp: SystemTime::now(),
        }
    }

    /// Check if this email was sent to a specific recipient
    pub fn has_recipient(&self, recipient: &str) -> bool {
        self.to.iter().any(|addr| addr == recipient)
    }

    /// Check if this email was sent from a specific sender
    pub fn is_from_sender(&self, sender: &str) -> bool {
        self.from == sender
    }

    /// Get the size of the email data in bytes
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// The content as text, invalid UTF-8 replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Value of the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<String> {
        for line in self.text().lines() {
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                if key.eq_ignore_ascii_case(name) {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }

    pub fn subject(&self) -> Option<String> {
        self.header("Subject")
    }

    /// Content after the blank line ending the header section
    pub fn body(&self) -> Option<String> {
        let text = self.text();
        let start = ["\r\n\r\n", "\n\n"]
            .iter()
            .filter_map(|sep| text.find(sep).map(|pos| pos + sep.len()))
            .min()?;
        if start < text.len() {
            Some(text[start..].to_string())
        } else {
            None
        }
    }

    /// Check if the email contains a specific text in headers or body
    pub fn contains_text(&self, text: &str) -> bool {
        self.text().contains(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(data: &str) -> Email {
        Email::new(
            "sender@example.com".to_string(),
            vec!["recipient@example.com".to_string()],
            None,
            data.as_bytes().to_vec(),
        )
    }

    #[test]
    fn test_email_creation() {
        let email = email("Subject: Test\r\n\r\nHello World\r\n");

        assert_eq!(email.from, "sender@example.com");
        assert_eq!(email.to, vec!["recipient@example.com"]);
        assert_eq!(email.data, b"Subject: Test\r\n\r\nHello World\r\n");
        assert!(email.authenticated_user.is_none());
        assert!(email.timestamp <= SystemTime::now());
    }

    #[test]
    fn test_has_recipient() {
        let email = Email::new(
            "sender@example.com".to_string(),
            vec![
                "user1@example.com".to_string(),
                "user2@example.com".to_string(),
            ],
            Some("user1".to_string()),
            b"Test email".to_vec(),
        );

        assert!(email.has_recipient("user1@example.com"));
        assert!(email.has_recipient("user2@example.com"));
        assert!(!email.has_recipient("user3@example.com"));
        assert!(email.is_from_sender("sender@example.com"));
        assert!(!email.is_from_sender("other@example.com"));
    }

    #[test]
    fn test_subject() {
        let email_with_subject = email("subject: Test Email\r\nFrom: a@b\r\n\r\nHello World");
        assert_eq!(email_with_subject.subject(), Some("Test Email".to_string()));

        let email_no_subject = email("From: sender@example.com\r\n\r\nSubject: not a header");
        assert_eq!(email_no_subject.subject(), None);
    }

    #[test]
    fn test_body() {
        let crlf = email("Subject: Test\r\nFrom: a@b\r\n\r\nHello World\r\nSecond line\r\n");
        assert_eq!(crlf.body(), Some("Hello World\r\nSecond line\r\n".to_string()));

        let lf = email("Subject: Test\n\nHello");
        assert_eq!(lf.body(), Some("Hello".to_string()));

        let no_body = email("Subject: Test\r\nFrom: a@b\r\n");
        assert_eq!(no_body.body(), None);
    }

    #[test]
    fn test_non_utf8_content() {
        let mut email = email("");
        email.data = vec![b'H', b'i', 0xFF];
        assert_eq!(email.data_size(), 3);
        assert!(email.contains_text("Hi"));
    }
}

//! Credential checks and SASL decoding for `AUTH`
//!
//! Credentials are compared with plain string equality. There is no hashing,
//! rate limiting or constant-time comparison: this server captures mail for
//! development and is not a security boundary.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::smtp::error::SmtpError;

/// Base64 of "Username:"
pub const USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of "Password:"
pub const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

/// Checks a login/password pair against the configured credentials
#[derive(Debug, Clone)]
pub struct CredentialsValidator {
    login: String,
    password: String,
}

impl CredentialsValidator {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: login.to_owned(),
            password: password.to_owned(),
        }
    }

    pub fn validate(&self, username: &str, password: &str) -> Result<(), SmtpError> {
        if username == self.login && password == self.password {
            Ok(())
        } else {
            Err(SmtpError::AuthFailed)
        }
    }
}

/// Supported SASL mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
}

impl Mechanism {
    pub fn parse(name: &str) -> Result<Self, SmtpError> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "LOGIN" => Ok(Self::Login),
            _ => Err(SmtpError::UnsupportedMechanism),
        }
    }
}

/// An `AUTH` exchange waiting for the next client line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslExchange {
    /// `AUTH PLAIN` sent without an initial response
    PlainResponse,
    /// `AUTH LOGIN` waiting for the username
    LoginUsername,
    /// `AUTH LOGIN` waiting for the password
    LoginPassword { username: String },
}

/// Decode one base64 client line, honouring the `*` cancel marker
pub fn decode_response(line: &str) -> Result<String, SmtpError> {
    let line = line.trim();
    if line == "*" {
        return Err(SmtpError::AuthCancelled);
    }
    // RFC 4954 zero-length response
    if line == "=" {
        return Ok(String::new());
    }

    let bytes = B64
        .decode(line.as_bytes())
        .map_err(|_| SmtpError::InvalidSyntax("cannot decode AUTH response".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| SmtpError::InvalidSyntax("AUTH response is not UTF-8".to_string()))
}

/// Split a decoded PLAIN payload (`authzid NUL authcid NUL passwd`)
pub fn parse_plain(payload: &str) -> Result<(String, String), SmtpError> {
    let mut fields = payload.split('\0');
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(_authzid), Some(user), Some(pass), None) => Ok((user.to_owned(), pass.to_owned())),
        _ => Err(SmtpError::InvalidSyntax(
            "malformed PLAIN credentials".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_exact_match() {
        let validator = CredentialsValidator::new("user", "secret");
        assert!(validator.validate("user", "secret").is_ok());
    }

    #[test]
    fn test_validate_single_character_mismatch() {
        let validator = CredentialsValidator::new("user", "secret");
        assert!(matches!(
            validator.validate("usr", "secret"),
            Err(SmtpError::AuthFailed)
        ));
        assert!(matches!(
            validator.validate("user", "secreT"),
            Err(SmtpError::AuthFailed)
        ));
        assert!(matches!(
            validator.validate("user ", "secret"),
            Err(SmtpError::AuthFailed)
        ));
        assert!(matches!(
            validator.validate("", ""),
            Err(SmtpError::AuthFailed)
        ));
    }

    #[test]
    fn test_mechanism_parse() {
        assert_eq!(Mechanism::parse("plain").unwrap(), Mechanism::Plain);
        assert_eq!(Mechanism::parse("LOGIN").unwrap(), Mechanism::Login);
        assert!(matches!(
            Mechanism::parse("CRAM-MD5"),
            Err(SmtpError::UnsupportedMechanism)
        ));
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response("dXNlcg==").unwrap(), "user");
        assert_eq!(decode_response("dXNlcg==\r\n").unwrap(), "user");
        assert_eq!(decode_response("=").unwrap(), "");
        assert!(matches!(
            decode_response("*"),
            Err(SmtpError::AuthCancelled)
        ));
        assert!(matches!(
            decode_response("not base64!"),
            Err(SmtpError::InvalidSyntax(_))
        ));
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(
            parse_plain("\0user\0secret").unwrap(),
            ("user".to_string(), "secret".to_string())
        );
        assert_eq!(
            parse_plain("admin\0user\0secret").unwrap(),
            ("user".to_string(), "secret".to_string())
        );
        assert!(parse_plain("user secret").is_err());
        assert!(parse_plain("\0user\0secret\0extra").is_err());
    }
}

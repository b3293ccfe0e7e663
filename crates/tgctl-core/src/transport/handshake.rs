//! Handshake credentials and their verification.
//!
//! Cryptography stays outside this crate: clients encrypt passwords through a
//! [`PasswordEncryptor`], servers verify credentials through an
//! [`Authenticator`]. Both are plain traits so callers can plug in whatever
//! scheme their deployment uses.

use super::protocol::{ClientInfo, Credential, DiagnosticCode};
use crate::error::{Result, TgError};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Encrypts a password under the server's public key.
pub trait PasswordEncryptor: Send + Sync {
    fn encrypt(&self, public_key: &str, password: &str) -> Result<String>;
}

/// Server-side credential check.
pub trait Authenticator: Send + Sync {
    /// Public key handed to clients that need to encrypt a password.
    fn encryption_key(&self) -> Option<String> {
        None
    }

    /// Verify a credential. Returns the authenticated user name, if any.
    fn authenticate(&self, client: &ClientInfo, credential: &Credential) -> Result<Option<String>>;
}

/// Accepts every credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&self, client: &ClientInfo, credential: &Credential) -> Result<Option<String>> {
        Ok(match credential {
            Credential::EncryptedPassword { user, .. } => Some(user.clone()),
            _ => client.user_name.clone(),
        })
    }
}

/// Accepts bearer tokens from a fixed list.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashSet<String>,
}

impl TokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, client: &ClientInfo, credential: &Credential) -> Result<Option<String>> {
        match credential {
            Credential::Token { token } if self.tokens.contains(token) => {
                Ok(client.user_name.clone())
            }
            Credential::Token { .. } => Err(authentication_error("token is not recognized")),
            Credential::None => Err(authentication_error("a credential is required")),
            Credential::EncryptedPassword { .. } => Err(authentication_error(
                "password authentication is not available",
            )),
        }
    }
}

fn authentication_error(message: &str) -> TgError {
    TgError::Handshake {
        code: DiagnosticCode::AuthenticationError,
        message: message.to_string(),
    }
}

/// What a client presents in its handshake.
#[derive(Clone, Default)]
pub enum CredentialSource {
    #[default]
    None,
    Token(String),
    Password {
        user: String,
        password: String,
        encryptor: Arc<dyn PasswordEncryptor>,
    },
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::None => f.write_str("None"),
            CredentialSource::Token(_) => f.write_str("Token(..)"),
            CredentialSource::Password { user, .. } => {
                f.debug_struct("Password").field("user", user).finish()
            }
        }
    }
}

impl CredentialSource {
    /// Whether the server's public key must be fetched first.
    pub fn needs_encryption_key(&self) -> bool {
        matches!(self, CredentialSource::Password { .. })
    }

    /// Produce the wire credential, encrypting with `public_key` if needed.
    pub fn resolve(&self, public_key: Option<&str>) -> Result<Credential> {
        match self {
            CredentialSource::None => Ok(Credential::None),
            CredentialSource::Token(token) => Ok(Credential::Token {
                token: token.clone(),
            }),
            CredentialSource::Password {
                user,
                password,
                encryptor,
            } => {
                let key = public_key.ok_or_else(|| TgError::Handshake {
                    code: DiagnosticCode::AuthenticationError,
                    message: "server did not provide an encryption key".to_string(),
                })?;
                Ok(Credential::EncryptedPassword {
                    user: user.clone(),
                    encrypted_password: encryptor.encrypt(key, password)?,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl PasswordEncryptor for Reverse {
        fn encrypt(&self, public_key: &str, password: &str) -> Result<String> {
            Ok(format!("{}:{}", public_key, password.chars().rev().collect::<String>()))
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            application_name: "tgctl".into(),
            user_name: Some("admin".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_authenticator() {
        let auth = TokenAuthenticator::new(vec!["secret".to_string()]);
        let ok = auth.authenticate(
            &client(),
            &Credential::Token {
                token: "secret".into(),
            },
        );
        assert_eq!(ok.unwrap(), Some("admin".to_string()));

        let err = auth
            .authenticate(&client(), &Credential::Token { token: "x".into() })
            .unwrap_err();
        assert_eq!(err.to_diagnostic_code(), DiagnosticCode::AuthenticationError);
        assert!(auth.authenticate(&client(), &Credential::None).is_err());
    }

    #[test]
    fn test_password_needs_key() {
        let source = CredentialSource::Password {
            user: "admin".into(),
            password: "pw".into(),
            encryptor: Arc::new(Reverse),
        };
        assert!(source.needs_encryption_key());
        assert!(source.resolve(None).is_err());
        assert_eq!(
            source.resolve(Some("k")).unwrap(),
            Credential::EncryptedPassword {
                user: "admin".into(),
                encrypted_password: "k:wp".into(),
            }
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", CredentialSource::Token("secret".into()));
        assert!(!rendered.contains("secret"));
    }
}

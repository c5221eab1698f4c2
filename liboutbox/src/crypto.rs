//! Symmetric encryption for credential material at rest
//!
//! Values are encrypted with a process-wide passphrase (age) and stored
//! as `ENC:` + base64. Values without the tag are legacy plaintext and
//! pass through decryption unchanged, so a database written before
//! encryption was enabled keeps working while rows migrate lazily.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::error::{CryptoError, Result};

/// Tag prefixed to every encrypted value
pub const ENC_PREFIX: &str = "ENC:";

/// How to behave when no encryption key is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    /// Refuse to operate without a key
    Strict,
    /// Fall back to plaintext storage, warning on every operation
    Permissive,
}

impl CryptoMode {
    /// Strict in production, permissive everywhere else.
    ///
    /// Reads `OUTBOX_ENV`; any value other than "production" is treated
    /// as a development environment.
    pub fn from_env() -> Self {
        match std::env::var("OUTBOX_ENV").as_deref() {
            Ok("production") => CryptoMode::Strict,
            _ => CryptoMode::Permissive,
        }
    }
}

/// Process-wide cipher for token values.
///
/// Built once at startup. In strict mode construction fails without a
/// key, so a misconfigured production process never reaches storage.
pub struct TokenCipher {
    passphrase: Option<SecretString>,
}

impl TokenCipher {
    pub fn new(mode: CryptoMode, key: Option<String>) -> Result<Self> {
        match key {
            Some(k) if !k.is_empty() => Ok(Self {
                passphrase: Some(SecretString::from(k)),
            }),
            _ => match mode {
                CryptoMode::Strict => Err(CryptoError::KeyMissing.into()),
                CryptoMode::Permissive => {
                    warn!(
                        "OUTBOX_ENCRYPTION_KEY is not set; credential material \
                         will be stored in PLAINTEXT"
                    );
                    Ok(Self { passphrase: None })
                }
            },
        }
    }

    /// Whether a key is configured and values will actually be encrypted
    pub fn is_active(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Encrypt a value for storage.
    ///
    /// Empty input stays empty. Without a key (permissive mode) the
    /// value passes through unchanged, with a warning.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let passphrase = match &self.passphrase {
            Some(p) => p,
            None => {
                warn!("storing credential value unencrypted (no key configured)");
                return Ok(plaintext.to_string());
            }
        };

        let encrypted = encrypt_bytes(plaintext.as_bytes(), passphrase)?;
        Ok(format!("{}{}", ENC_PREFIX, BASE64.encode(encrypted)))
    }

    /// Decrypt a stored value.
    ///
    /// Untagged values are legacy plaintext and are returned unchanged
    /// without requiring a key. Tagged values always require the key,
    /// in either mode.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        if stored.is_empty() {
            return Ok(String::new());
        }

        let payload = match stored.strip_prefix(ENC_PREFIX) {
            Some(p) => p,
            None => return Ok(stored.to_string()),
        };

        let passphrase = self.passphrase.as_ref().ok_or(CryptoError::KeyMissing)?;

        let encrypted = BASE64
            .decode(payload)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let plaintext = decrypt_bytes(&encrypted, passphrase)?;
        let value =
            String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        Ok(value)
    }

    /// Whether a stored value carries the encryption tag
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    /// Log-safe display form of a token. Counts characters, not bytes,
    /// so multibyte token values never split mid-character.
    pub fn mask(token: &str) -> String {
        if token.chars().count() <= 8 {
            "***".to_string()
        } else {
            let head: String = token.chars().take(4).collect();
            format!("{}...", head)
        }
    }
}

fn encrypt_bytes(data: &[u8], passphrase: &SecretString) -> Result<Vec<u8>> {
    let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
        passphrase.expose_secret().to_owned(),
    ));

    let mut encrypted = vec![];
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    writer
        .write_all(data)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    Ok(encrypted)
}

fn decrypt_bytes(data: &[u8], passphrase: &SecretString) -> Result<Vec<u8>> {
    let decryptor = match age::Decryptor::new(data) {
        Ok(age::Decryptor::Passphrase(d)) => d,
        Ok(_) => {
            return Err(CryptoError::Decrypt(
                "Invalid encryption format (expected passphrase)".to_string(),
            )
            .into())
        }
        Err(e) => return Err(CryptoError::Decrypt(e.to_string()).into()),
    };

    let mut decrypted = vec![];
    let mut reader = decryptor
        .decrypt(
            &age::secrecy::Secret::new(passphrase.expose_secret().to_owned()),
            None,
        )
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    reader
        .read_to_end(&mut decrypted)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

    Ok(decrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cipher_with_key() -> TokenCipher {
        TokenCipher::new(CryptoMode::Strict, Some("test-passphrase".to_string())).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let cipher = cipher_with_key();

        let encrypted = cipher.encrypt("AQXdSP8z-secret-token").unwrap();
        assert!(encrypted.starts_with(ENC_PREFIX));
        assert_ne!(encrypted, "AQXdSP8z-secret-token");

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, "AQXdSP8z-secret-token");
    }

    #[test]
    fn test_legacy_plaintext_passes_through() {
        let cipher = cipher_with_key();
        let decrypted = cipher.decrypt("legacy-plaintext-token").unwrap();
        assert_eq!(decrypted, "legacy-plaintext-token");
    }

    #[test]
    fn test_legacy_plaintext_needs_no_key() {
        let cipher = TokenCipher::new(CryptoMode::Permissive, None).unwrap();
        let decrypted = cipher.decrypt("legacy-plaintext-token").unwrap();
        assert_eq!(decrypted, "legacy-plaintext-token");
    }

    #[test]
    fn test_strict_mode_requires_key() {
        let result = TokenCipher::new(CryptoMode::Strict, None);
        assert!(matches!(
            result,
            Err(crate::OutboxError::Crypto(CryptoError::KeyMissing))
        ));

        let result = TokenCipher::new(CryptoMode::Strict, Some(String::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_permissive_mode_passes_through_without_key() {
        let cipher = TokenCipher::new(CryptoMode::Permissive, None).unwrap();
        assert!(!cipher.is_active());

        let stored = cipher.encrypt("some-token").unwrap();
        assert_eq!(stored, "some-token");
        assert!(!TokenCipher::is_encrypted(&stored));
    }

    #[test]
    fn test_tagged_value_without_key_is_an_error() {
        let with_key = cipher_with_key();
        let encrypted = with_key.encrypt("tok").unwrap();

        let without_key = TokenCipher::new(CryptoMode::Permissive, None).unwrap();
        let result = without_key.decrypt(&encrypted);
        assert!(matches!(
            result,
            Err(crate::OutboxError::Crypto(CryptoError::KeyMissing))
        ));
    }

    #[test]
    fn test_wrong_key_fails_to_decrypt() {
        let cipher = cipher_with_key();
        let encrypted = cipher.encrypt("tok").unwrap();

        let other = TokenCipher::new(CryptoMode::Strict, Some("other-pass".to_string())).unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_empty_string_round_trip() {
        let cipher = cipher_with_key();
        assert_eq!(cipher.encrypt("").unwrap(), "");
        assert_eq!(cipher.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_is_encrypted() {
        assert!(TokenCipher::is_encrypted("ENC:abc"));
        assert!(!TokenCipher::is_encrypted("abc"));
        assert!(!TokenCipher::is_encrypted(""));
        assert!(!TokenCipher::is_encrypted("enc:abc"));
    }

    #[test]
    fn test_mask() {
        assert_eq!(TokenCipher::mask("AQXdSP8zLongTokenValue"), "AQXd...");
        assert_eq!(TokenCipher::mask("short"), "***");
        assert_eq!(TokenCipher::mask(""), "***");
    }

    #[test]
    fn test_mask_multibyte_token() {
        // A 2-byte character straddles the 4-byte mark
        assert_eq!(TokenCipher::mask("aüürest-of-token"), "aüür...");
        assert_eq!(TokenCipher::mask("ünicode!"), "***");
    }

    #[test]
    #[serial]
    fn test_mode_from_env() {
        std::env::set_var("OUTBOX_ENV", "production");
        assert_eq!(CryptoMode::from_env(), CryptoMode::Strict);

        std::env::set_var("OUTBOX_ENV", "development");
        assert_eq!(CryptoMode::from_env(), CryptoMode::Permissive);

        std::env::remove_var("OUTBOX_ENV");
        assert_eq!(CryptoMode::from_env(), CryptoMode::Permissive);
    }
}

use crate::wd::config::ConfigStore;
use crate::wd::logger::Logger;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::Sha256;
use std::fs;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const PBKDF2_ITERATIONS: u32 = 10_000;
const KEY_AND_IV_LEN: usize = 48;
const MIN_PASSWORD_FILE_CHARS: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid base64 ciphertext: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decryption failed (wrong password or corrupted ciphertext)")]
    Decrypt,
    #[error("decrypted data is not valid UTF-8")]
    Utf8,
}

/// AES-256-CBC envelope for passwords held inside the configuration.
///
/// Key material is derived once, with PBKDF2-HMAC-SHA256 over an empty salt
/// (10 000 iterations, 48 bytes: 32 key + 16 IV). The result is bit-for-bit
/// compatible with
/// `openssl enc -base64 -aes-256-cbc -pbkdf2 -nosalt -pass pass:<pwd>`.
///
/// Cipher state is rebuilt per operation; callers must not invoke
/// concurrently (the supervisor uses a single thread for this).
pub struct SecretVault {
    password: String,
    key_and_iv: [u8; KEY_AND_IV_LEN],
}

impl SecretVault {
    /// Reads `<section>.passwordFile` and derives the key material. Only
    /// bytes above 0x20 (and below 0x80) are accepted from the file, which
    /// strips whitespace, line endings and 8-bit bytes by policy. A file
    /// yielding fewer than 12 characters is rejected and `fallback_password`
    /// is used; an empty `section` means the fallback is used unconditionally.
    pub fn configure(
        cfg: &ConfigStore,
        section: &str,
        fallback_password: &str,
        logger: &Logger,
    ) -> SecretVault {
        let mut password = String::new();

        let password_file = if section.is_empty() {
            String::new()
        } else {
            cfg.get_string(section, "passwordFile", "")
        };

        if !password_file.is_empty() {
            match fs::read(&password_file) {
                Ok(bytes) => {
                    password = bytes
                        .iter()
                        .filter(|b| **b > 0x20 && **b < 0x80)
                        .map(|b| *b as char)
                        .collect();
                    if password.len() < MIN_PASSWORD_FILE_CHARS {
                        logger.error(
                            "SecretVault::configure",
                            format!(
                                "password file {password_file} is too short, at least {MIN_PASSWORD_FILE_CHARS} characters are required"
                            ),
                        );
                        password.clear();
                    }
                }
                Err(e) => {
                    logger.error(
                        "SecretVault::configure",
                        format!("unable to load default password from {password_file}: {e}"),
                    );
                }
            }
        }

        if password.is_empty() {
            password = fallback_password.to_string();
        }

        Self::from_password(&password)
    }

    pub fn from_password(password: &str) -> SecretVault {
        let mut key_and_iv = [0u8; KEY_AND_IV_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), b"", PBKDF2_ITERATIONS, &mut key_and_iv);
        SecretVault {
            password: password.to_string(),
            key_and_iv,
        }
    }

    /// The effective vault password; also the HMAC key for config protection.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// AES-256-CBC with PKCS7 padding, Base64 encoded.
    pub fn encrypt(&self, plain_text: &str) -> String {
        let (key, iv) = self.key_and_iv.split_at(32);
        let encryptor =
            Aes256CbcEnc::new_from_slices(key, iv).expect("key and iv sizes are fixed");
        let cipher_text = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain_text.as_bytes());
        BASE64.encode(cipher_text)
    }

    pub fn decrypt(&self, base64_cipher_text: &str) -> Result<String, CryptoError> {
        let cipher_text = BASE64.decode(base64_cipher_text.trim())?;
        let (key, iv) = self.key_and_iv.split_at(32);
        let decryptor =
            Aes256CbcDec::new_from_slices(key, iv).expect("key and iv sizes are fixed");
        let plain = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher_text)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
    }

    /// Reads a configured string that should be encrypted. An empty value
    /// yields the default. A value that fails to decrypt is not fatal: it is
    /// returned as-is, with a warning plus the ciphertext that would encrypt
    /// it, guiding the operator toward an encrypted configuration.
    pub fn get_possibly_encrypted_string(
        &self,
        cfg: &ConfigStore,
        section: &str,
        key: &str,
        default: &str,
        logger: &Logger,
    ) -> String {
        let raw = cfg.get_string(section, key, "");
        if raw.is_empty() {
            return default.to_string();
        }
        match self.decrypt(&raw) {
            Ok(plain) => plain,
            Err(e) => {
                logger.warning(
                    "SecretVault::get_possibly_encrypted_string",
                    format!("unable to decrypt {section}.{key}, using it as plain text ({e})"),
                );
                logger.info(
                    "SecretVault::get_possibly_encrypted_string",
                    format!("encrypted version of the configured value: {}", self.encrypt(&raw)),
                );
                raw
            }
        }
    }
}

use crate::constants::crypto::{KEY_SIZE, NONCE_SIZE};
use crate::constants::permissions::PRIVATE_FILE;
use crate::errors::PersonaError;
use crate::utils::fs_atomic::{atomic_write_text_file, ensure_private_dir};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: String,
    pub nonce: String,
}

fn decode_key(raw: &str) -> Option<Vec<u8>> {
    let decoded = BASE64.decode(raw.trim().as_bytes()).ok()?;
    if decoded.len() == KEY_SIZE {
        Some(decoded)
    } else {
        None
    }
}

/// AES-256-GCM sealing with a key persisted next to the records it protects.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
    key_path: PathBuf,
}

impl TokenCipher {
    pub fn load_or_create(key_path: &Path) -> Result<Self, PersonaError> {
        let secret_key = Self::load_or_create_key(key_path)?;
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&secret_key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            key_path: key_path.to_path_buf(),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn load_or_create_key(path: &Path) -> Result<Vec<u8>, PersonaError> {
        if path.exists() {
            let stored = fs::read_to_string(path).map_err(|err| {
                PersonaError::internal(format!("Failed to read encryption key: {}", err))
            })?;
            return decode_key(&stored).ok_or_else(|| {
                PersonaError::internal("Encryption key file is corrupt").with_hint(format!(
                    "Expected {} base64-encoded bytes in {}. Removing it invalidates every stored token.",
                    KEY_SIZE,
                    path.display()
                ))
            });
        }

        if let Some(parent) = path.parent() {
            ensure_private_dir(parent).map_err(|err| {
                PersonaError::internal(format!("Failed to create key directory: {}", err))
            })?;
        }
        let mut generated = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut generated);
        atomic_write_text_file(path, &BASE64.encode(&generated), PRIVATE_FILE).map_err(
            |err| PersonaError::internal(format!("Failed to persist encryption key: {}", err)),
        )?;
        Ok(generated)
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, PersonaError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| PersonaError::internal("Failed to encrypt token"))?;
        Ok(SealedSecret {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<String, PersonaError> {
        let nonce_bytes = BASE64
            .decode(sealed.nonce.as_bytes())
            .map_err(|_| PersonaError::internal("Stored nonce is not valid base64"))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(PersonaError::internal("Stored nonce has the wrong length"));
        }
        let data = BASE64
            .decode(sealed.ciphertext.as_bytes())
            .map_err(|_| PersonaError::internal("Stored ciphertext is not valid base64"))?;
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);
        let decrypted = self.cipher.decrypt(nonce, data.as_ref()).map_err(|_| {
            PersonaError::internal("Failed to decrypt token")
                .with_hint("The record was tampered with or sealed under a different key.")
        })?;
        String::from_utf8(decrypted)
            .map_err(|_| PersonaError::internal("Decrypted token is not valid UTF-8"))
    }
}

//! AES-256-GCM sealing for secrets at rest.
//!
//! A sealed value is `base64(nonce || ciphertext)` with a fresh 96-bit nonce
//! per seal. The 256-bit key is stored base64-encoded in its own file,
//! readable only by the owner on Unix.

use crate::error::{FalconError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::info;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Symmetric cipher for session material.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(<key redacted>)")
    }
}

impl SecretBox {
    pub fn from_key(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| FalconError::Crypto {
            message: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        })?;
        Ok(Self { cipher })
    }

    /// A box with a fresh random key that is never persisted.
    pub fn ephemeral() -> Result<Self> {
        Self::from_key(&generate_key())
    }

    /// Load the key at `path`, creating it on first use.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(encoded) => {
                let key = STANDARD.decode(encoded.trim()).map_err(|e| FalconError::Crypto {
                    message: format!("unreadable key file {}: {}", path.display(), e),
                })?;
                Self::from_key(&key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = generate_key();
                write_key_file(path, &STANDARD.encode(key))?;
                info!("Created session key at {}", path.display());
                Self::from_key(&key)
            }
            Err(e) => Err(FalconError::io_with_path(e, path)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| FalconError::Crypto {
                message: format!("encryption failed: {}", e),
            })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let combined = STANDARD.decode(sealed).map_err(|e| FalconError::Crypto {
            message: format!("sealed value is not base64: {}", e),
        })?;
        if combined.len() < NONCE_LEN {
            return Err(FalconError::Crypto {
                message: "sealed value too short".to_string(),
            });
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FalconError::Crypto {
                message: "decryption failed (wrong key or tampered data)".to_string(),
            })
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<String> {
        self.seal(&serde_json::to_vec(value)?)
    }

    pub fn open_json<T: DeserializeOwned>(&self, sealed: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.open(sealed)?)?)
    }
}

fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill(&mut key);
    key
}

fn write_key_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| FalconError::io_with_path(e, parent))?;
    }
    std::fs::write(path, contents).map_err(|e| FalconError::io_with_path(e, path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| FalconError::io_with_path(e, path))?;
    }

    Ok(())
}

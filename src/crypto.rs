//! Secret encryption at rest: AES-256-GCM under a process key.
//!
//! The repository calls [`SecretCipher`] opaquely; nothing else in the crate
//! knows the wire format. Stored values are `base64(nonce || ciphertext)`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use std::path::Path;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Capability for encrypting and decrypting secret values.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String>;
    fn decrypt(&self, stored: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM cipher bound to a single process key.
pub struct ProcessKeyCipher {
    cipher: Aes256Gcm,
}

impl ProcessKeyCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Load the process key from a file, creating one on first use.
    ///
    /// The key file holds 32 base64-encoded random bytes, mode 0600.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let bytes = BASE64
                .decode(raw.trim())
                .map_err(|err| Error::Crypto(format!("invalid key file: {}", err)))?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| Error::Crypto("key file must hold 32 bytes".to_string()))?;
            return Ok(Self::new(&key));
        }
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, BASE64.encode(key))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self::new(&key))
    }
}

impl SecretCipher for ProcessKeyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, stored: &str) -> Result<Vec<u8>> {
        let sealed = BASE64
            .decode(stored)
            .map_err(|err| Error::Crypto(format!("invalid stored secret: {}", err)))?;
        if sealed.len() < NONCE_LEN {
            return Err(Error::Crypto("stored secret too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed; wrong process key?".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ProcessKeyCipher {
        ProcessKeyCipher::new(&[7u8; KEY_LEN])
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"postgres://user:pass@db/app")?;
        assert_eq!(cipher.decrypt(&sealed)?, b"postgres://user:pass@db/app");
        Ok(())
    }

    #[test]
    fn nonces_differ_between_calls() -> Result<()> {
        let cipher = cipher();
        let a = cipher.encrypt(b"same")?;
        let b = cipher.encrypt(b"same")?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn tampered_value_is_rejected() -> Result<()> {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"value")?;
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
        Ok(())
    }

    #[test]
    fn load_or_create_persists_key() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("secret.key");
        let first = ProcessKeyCipher::load_or_create(&path)?;
        let sealed = first.encrypt(b"v")?;
        let second = ProcessKeyCipher::load_or_create(&path)?;
        assert_eq!(second.decrypt(&sealed)?, b"v");
        Ok(())
    }
}

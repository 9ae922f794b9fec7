//! Credential Vault (component #1): AES-256-GCM encrypted at-rest storage
//! of API secrets, looked up by provider id. Generalizes the teacher's
//! Shadow_KB `SecretVault` (which encrypted one kind of sensitive record)
//! into a provider-keyed credential store.
//!
//! ## Wire format
//! Each encrypted blob is `[12-byte nonce][ciphertext+tag]`, nonce generated
//! per write via `OsRng`.
//!
//! ## Key derivation
//! The master key comes from `NOESIS_VAULT_KEY` (64 hex chars = 32 bytes).
//! Missing or malformed ⇒ the vault stays locked; all operations return
//! [`VaultError::Locked`].

use crate::error::VaultError;
use crate::secure_memory::LockedVec;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use std::collections::HashMap;
use std::sync::RwLock;

const NONCE_LEN: usize = 12;
const ENV_VAULT_KEY: &str = "NOESIS_VAULT_KEY";

/// Encrypted credential storage keyed by provider id. Single-writer critical
/// section per §5 ("budgets, performance rings, and consent ledgers are not
/// high-throughput") — a credential vault is lower-throughput still.
pub struct CredentialVault {
    cipher: Option<Aes256Gcm>,
    store: std::sync::Arc<crate::persistence::Store>,
    cache: RwLock<HashMap<String, ()>>,
}

const KEY_PREFIX: &str = "credentials";

impl CredentialVault {
    pub fn new(master_key: Option<&[u8; 32]>, store: std::sync::Arc<crate::persistence::Store>) -> Self {
        let cipher = master_key.map(|k| Aes256Gcm::new_from_slice(k).expect("key length is 32"));
        Self {
            cipher,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_env(store: std::sync::Arc<crate::persistence::Store>) -> Self {
        let key_bytes = std::env::var(ENV_VAULT_KEY).ok().and_then(|hex| {
            let hex = hex.trim().replace([' ', '\n'], "");
            if hex.len() != 64 {
                tracing::warn!(
                    target: "noesis::vault",
                    "NOESIS_VAULT_KEY must be 64 hex chars (32 bytes); credential vault will be LOCKED"
                );
                return None;
            }
            (0..32)
                .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
                .collect::<Option<Vec<u8>>>()
        });
        let cipher = key_bytes.and_then(|k| {
            let arr: [u8; 32] = k.try_into().ok()?;
            Some(Aes256Gcm::new_from_slice(&arr).expect("key length is 32"))
        });
        if cipher.is_some() {
            tracing::info!(target: "noesis::vault", "credential vault unlocked");
        } else {
            tracing::info!(target: "noesis::vault", "credential vault locked (no valid NOESIS_VAULT_KEY)");
        }
        Self {
            cipher,
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn is_unlocked(&self) -> bool {
        self.cipher.is_some()
    }

    fn encrypt_blob(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::Locked)?;
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_blob(&self, encrypted: &[u8]) -> Result<LockedVec, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::Locked)?;
        if encrypted.len() < NONCE_LEN {
            return Err(VaultError::CorruptBlob);
        }
        let (nonce_bytes, ct) = encrypted.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ct)
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;
        Ok(LockedVec::new(plaintext))
    }

    /// Stores the secret for `provider_id`, encrypted at rest under
    /// `credentials/<provider_id>`.
    pub fn store_secret(&self, provider_id: &str, secret: &str) -> Result<(), VaultError> {
        let blob = self.encrypt_blob(secret.as_bytes())?;
        self.store
            .put_raw(&format!("{KEY_PREFIX}/{provider_id}"), &blob)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        self.cache.write().unwrap().insert(provider_id.to_string(), ());
        Ok(())
    }

    /// Looks up and decrypts the secret for `provider_id`.
    pub fn get_secret(&self, provider_id: &str) -> Result<String, VaultError> {
        let blob = self
            .store
            .get_raw(&format!("{KEY_PREFIX}/{provider_id}"))
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?
            .ok_or_else(|| VaultError::NotFound(provider_id.to_string()))?;
        let locked = self.decrypt_blob(&blob)?;
        String::from_utf8(locked.as_slice().to_vec())
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))
    }

    pub fn has_secret(&self, provider_id: &str) -> bool {
        self.store
            .get_raw(&format!("{KEY_PREFIX}/{provider_id}"))
            .ok()
            .flatten()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(42);
        }
        key
    }

    #[test]
    fn store_and_retrieve_secret() {
        let store = Arc::new(crate::persistence::Store::temporary());
        let vault = CredentialVault::new(Some(&test_key()), store);
        vault.store_secret("openai", "sk-test-123").unwrap();
        assert_eq!(vault.get_secret("openai").unwrap(), "sk-test-123");
    }

    #[test]
    fn locked_vault_rejects_operations() {
        let store = Arc::new(crate::persistence::Store::temporary());
        let vault = CredentialVault::new(None, store);
        assert!(!vault.is_unlocked());
        assert!(matches!(vault.store_secret("openai", "x"), Err(VaultError::Locked)));
    }

    #[test]
    fn missing_provider_errors() {
        let store = Arc::new(crate::persistence::Store::temporary());
        let vault = CredentialVault::new(Some(&test_key()), store);
        assert!(matches!(vault.get_secret("nope"), Err(VaultError::NotFound(_))));
    }
}

// [[AXON]]/apps/kernel-server/src/cache/crypto.rs
// Purpose: Tenant-scoped AES-256-GCM for sensitive cache payloads.
// Architecture: Security Layer
// Dependencies: aes-gcm, sha2, rand

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::KernelError;

const NONCE_LEN: usize = 12;

/// Derives one key per tenant from the master key so a leaked tenant key
/// cannot decrypt any other tenant's payloads.
pub struct PayloadCipher {
    master: [u8; 32],
}

impl PayloadCipher {
    pub fn new(master_key: &str) -> Self {
        // Arbitrary-length operator secret folded to 32 bytes.
        let mut hasher = Sha256::new();
        hasher.update(master_key.as_bytes());
        let digest = hasher.finalize();
        let mut master = [0u8; 32];
        master.copy_from_slice(&digest);
        PayloadCipher { master }
    }

    fn tenant_key(&self, tenant_id: Uuid) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.master);
        hasher.update(tenant_id.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    pub fn encrypt(&self, tenant_id: Uuid, plaintext: &[u8]) -> Result<String, KernelError> {
        let key = self.tenant_key(tenant_id);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KernelError::Internal(format!("cipher init: {}", e)))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| KernelError::Internal("payload encryption failed".into()))?;
        Ok(format!("v1:{}:{}", hex::encode(nonce_bytes), hex::encode(ciphertext)))
    }

    pub fn decrypt(&self, tenant_id: Uuid, envelope: &str) -> Result<Vec<u8>, KernelError> {
        let mut parts = envelope.splitn(3, ':');
        let (version, nonce_hex, ct_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(n), Some(c)) => (v, n, c),
            _ => return Err(KernelError::Internal("malformed encrypted payload".into())),
        };
        if version != "v1" {
            return Err(KernelError::Internal(format!(
                "unknown payload envelope version '{}'",
                version
            )));
        }
        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|_| KernelError::Internal("malformed payload nonce".into()))?;
        let ciphertext = hex::decode(ct_hex)
            .map_err(|_| KernelError::Internal("malformed payload ciphertext".into()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(KernelError::Internal("bad payload nonce length".into()));
        }

        let key = self.tenant_key(tenant_id);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KernelError::Internal(format!("cipher init: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| KernelError::Internal("payload decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = PayloadCipher::new("master-secret");
        let tenant = Uuid::new_v4();
        let envelope = cipher.encrypt(tenant, b"hello sensitive world").unwrap();
        assert!(envelope.starts_with("v1:"));
        let plain = cipher.decrypt(tenant, &envelope).unwrap();
        assert_eq!(plain, b"hello sensitive world");
    }

    #[test]
    fn tenant_keys_are_isolated() {
        let cipher = PayloadCipher::new("master-secret");
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let envelope = cipher.encrypt(t1, b"secret").unwrap();
        assert!(cipher.decrypt(t2, &envelope).is_err());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cipher = PayloadCipher::new("master-secret");
        let tenant = Uuid::new_v4();
        let a = cipher.encrypt(tenant, b"same").unwrap();
        let b = cipher.encrypt(tenant, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = PayloadCipher::new("master-secret");
        let tenant = Uuid::new_v4();
        let envelope = cipher.encrypt(tenant, b"data").unwrap();
        let mut tampered = envelope.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        assert!(cipher.decrypt(tenant, &tampered).is_err());
    }
}

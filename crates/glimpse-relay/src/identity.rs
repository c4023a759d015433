//! Public-key identity store and challenge-response authentication.
//!
//! A stable client identity (`client_guid`) registers an Ed25519
//! public key once; later sessions prove possession of the private key
//! by signing a short-lived random nonce.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use thiserror::Error;

/// Key format accepted by the store.
pub const KEY_FORMAT_ED25519: &str = "Ed25519";

/// A challenge nonce is valid this long.
pub const NONCE_TTL: Duration = Duration::from_secs(120);

const NONCE_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unsupported key format: {0}")]
    UnsupportedFormat(String),
    #[error("public key failed to import")]
    InvalidKey,
    #[error("identity already registered with a different key")]
    Conflict,
}

struct StoredKey {
    public_key: Vec<u8>,
    format: String,
}

/// client_guid -> public key.
#[derive(Default)]
pub struct IdentityStore {
    keys: Mutex<HashMap<String, StoredKey>>,
}

impl IdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key. Idempotent on an exact `(key, format)` match;
    /// a different key for a known identity is a conflict.
    pub fn register(
        &self,
        client_guid: &str,
        public_key: &[u8],
        format: &str,
    ) -> Result<(), IdentityError> {
        if format != KEY_FORMAT_ED25519 {
            return Err(IdentityError::UnsupportedFormat(format.to_string()));
        }
        // Validate by importing.
        let bytes: [u8; 32] = public_key.try_into().map_err(|_| IdentityError::InvalidKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| IdentityError::InvalidKey)?;

        let mut keys = self
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match keys.get(client_guid) {
            Some(existing) if existing.public_key == public_key && existing.format == format => {
                Ok(())
            }
            Some(_) => Err(IdentityError::Conflict),
            None => {
                keys.insert(
                    client_guid.to_string(),
                    StoredKey {
                        public_key: public_key.to_vec(),
                        format: format.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Verify `signature` over `message` with the stored key.
    #[must_use]
    pub fn verify(&self, client_guid: &str, message: &[u8], signature: &[u8]) -> bool {
        let keys = self
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(stored) = keys.get(client_guid) else {
            return false;
        };
        let Ok(bytes) = <&[u8; 32]>::try_from(stored.public_key.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

struct AuthSession {
    client_guid: String,
    nonce: [u8; NONCE_LEN],
    issued_at: Instant,
    authenticated: bool,
}

/// Challenge-response sessions keyed by caller-chosen session id.
#[derive(Default)]
pub struct AuthSessionStore {
    sessions: Mutex<HashMap<String, AuthSession>>,
}

impl AuthSessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh 32-byte nonce for `client_guid`, base64-encoded.
    /// Reissuing for the same session id restarts the challenge.
    pub fn issue_nonce(&self, session_id: &str, client_guid: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let encoded = base64::engine::general_purpose::STANDARD.encode(nonce);

        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                session_id.to_string(),
                AuthSession {
                    client_guid: client_guid.to_string(),
                    nonce,
                    issued_at: Instant::now(),
                    authenticated: false,
                },
            );
        encoded
    }

    /// Verify the signed nonce. The first success records the
    /// authenticated state; identical repeats stay true. Expired
    /// challenges and foreign identities fail.
    pub fn try_complete(
        &self,
        session_id: &str,
        client_guid: &str,
        signature_base64: &str,
        identities: &IdentityStore,
    ) -> bool {
        let Ok(signature) =
            base64::engine::general_purpose::STANDARD.decode(signature_base64)
        else {
            return false;
        };

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        if session.client_guid != client_guid {
            tracing::warn!(session_id, "Auth attempt by foreign identity");
            return false;
        }
        if !identities.verify(client_guid, &session.nonce, &signature) {
            tracing::warn!(session_id, "Auth signature verification failed");
            return false;
        }
        if !session.authenticated {
            if session.issued_at.elapsed() > NONCE_TTL {
                tracing::warn!(session_id, "Auth nonce expired");
                return false;
            }
            session.authenticated = true;
        }
        true
    }

    /// Whether the challenge completed.
    #[must_use]
    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|s| s.authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    #[test]
    fn register_is_idempotent_on_exact_match() {
        let store = IdentityStore::new();
        let key = keypair().verifying_key();
        let bytes = key.to_bytes();
        assert_eq!(store.register("g1", &bytes, KEY_FORMAT_ED25519), Ok(()));
        assert_eq!(store.register("g1", &bytes, KEY_FORMAT_ED25519), Ok(()));
    }

    #[test]
    fn register_conflicts_on_different_key() {
        let store = IdentityStore::new();
        let first = keypair().verifying_key().to_bytes();
        let second = keypair().verifying_key().to_bytes();
        store.register("g1", &first, KEY_FORMAT_ED25519).unwrap();
        assert_eq!(
            store.register("g1", &second, KEY_FORMAT_ED25519),
            Err(IdentityError::Conflict)
        );
    }

    #[test]
    fn register_rejects_garbage_keys() {
        let store = IdentityStore::new();
        assert_eq!(
            store.register("g1", &[1, 2, 3], KEY_FORMAT_ED25519),
            Err(IdentityError::InvalidKey)
        );
        assert!(matches!(
            store.register("g1", &[0; 32], "RSA"),
            Err(IdentityError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn challenge_completes_and_repeats_idempotently() {
        let identities = IdentityStore::new();
        let auth = AuthSessionStore::new();
        let signing = keypair();
        identities
            .register("g1", &signing.verifying_key().to_bytes(), KEY_FORMAT_ED25519)
            .unwrap();

        let nonce_b64 = auth.issue_nonce("sess", "g1");
        let nonce = STANDARD.decode(&nonce_b64).unwrap();
        let signature = STANDARD.encode(signing.sign(&nonce).to_bytes());

        assert!(auth.try_complete("sess", "g1", &signature, &identities));
        assert!(auth.is_authenticated("sess"));
        // Identical repeat stays true.
        assert!(auth.try_complete("sess", "g1", &signature, &identities));
    }

    #[test]
    fn foreign_identity_and_bad_signature_fail() {
        let identities = IdentityStore::new();
        let auth = AuthSessionStore::new();
        let signing = keypair();
        let intruder = keypair();
        identities
            .register("g1", &signing.verifying_key().to_bytes(), KEY_FORMAT_ED25519)
            .unwrap();
        identities
            .register("g2", &intruder.verifying_key().to_bytes(), KEY_FORMAT_ED25519)
            .unwrap();

        let nonce_b64 = auth.issue_nonce("sess", "g1");
        let nonce = STANDARD.decode(&nonce_b64).unwrap();

        // Wrong client_guid.
        let sig = STANDARD.encode(signing.sign(&nonce).to_bytes());
        assert!(!auth.try_complete("sess", "g2", &sig, &identities));

        // Signature from the wrong key.
        let forged = STANDARD.encode(intruder.sign(&nonce).to_bytes());
        assert!(!auth.try_complete("sess", "g1", &forged, &identities));

        assert!(!auth.is_authenticated("sess"));
    }
}

//! Username ownership registry.
//!
//! Each published username is owned by at most one stable client
//! identity. Claims race-freely through one lock; releases verify
//! ownership so a reconnecting client cannot free someone else's name.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct UsernameRegistry {
    owners: Mutex<HashMap<String, String>>,
}

impl UsernameRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `username` for `client_guid`. Succeeds when unowned or
    /// already owned by the same identity.
    pub fn try_claim(&self, username: &str, client_guid: &str) -> bool {
        let mut owners = self
            .owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match owners.get(username) {
            Some(owner) => owner == client_guid,
            None => {
                owners.insert(username.to_string(), client_guid.to_string());
                true
            }
        }
    }

    /// Release `username`; a no-op unless `client_guid` owns it.
    pub fn release(&self, username: &str, client_guid: &str) -> bool {
        let mut owners = self
            .owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if owners.get(username).is_some_and(|owner| owner == client_guid) {
            owners.remove(username);
            return true;
        }
        false
    }

    #[must_use]
    pub fn owner(&self, username: &str) -> Option<String> {
        self.owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(username)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_succeeds_only_when_unowned() {
        let registry = UsernameRegistry::new();
        assert!(registry.try_claim("1234567890", "guid-a"));
        assert!(!registry.try_claim("1234567890", "guid-b"));
        // Re-claim by the owner is fine (reconnect).
        assert!(registry.try_claim("1234567890", "guid-a"));
    }

    #[test]
    fn release_checks_ownership() {
        let registry = UsernameRegistry::new();
        registry.try_claim("42", "guid-a");
        assert!(!registry.release("42", "guid-b"));
        assert_eq!(registry.owner("42").as_deref(), Some("guid-a"));
        assert!(registry.release("42", "guid-a"));
        assert!(registry.owner("42").is_none());
        // The name is claimable again.
        assert!(registry.try_claim("42", "guid-b"));
    }
}

//! Connected-client records and credential issuance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::distributions::{Alphanumeric, Distribution, Uniform};
use rand::Rng;

use glimpse_protocol::messages::{ClientId, ConnectionId};

use crate::send::ClientSender;
use crate::username::UsernameRegistry;

/// Length of generated numeric usernames.
const USERNAME_DIGITS: usize = 10;

/// Length of generated passwords.
const PASSWORD_LEN: usize = 8;

/// One connected transport client.
pub struct ClientState {
    /// Runtime handle used for routing; new on every connection.
    pub client_id: ClientId,
    /// Stable identity the username is claimed under.
    pub client_guid: String,
    pub sender: Arc<ClientSender>,
    pub username: Mutex<String>,
    pub password: Mutex<String>,
    pub display_name: Mutex<String>,
    /// The session this client currently participates in.
    pub session: Mutex<Option<ConnectionId>>,
}

impl ClientState {
    #[must_use]
    pub fn username(&self) -> String {
        self.username
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.display_name
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn session(&self) -> Option<ConnectionId> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn set_session(&self, session: Option<ConnectionId>) {
        *self
            .session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = session;
    }

    /// Case-insensitive password check.
    #[must_use]
    pub fn password_matches(&self, candidate: &str) -> bool {
        self.password
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .eq_ignore_ascii_case(candidate)
    }

    /// Replace the password with a fresh one and return it.
    pub fn regenerate_password(&self) -> String {
        let fresh = generate_password(&mut rand::thread_rng());
        *self
            .password
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh.clone();
        fresh
    }
}

/// Live clients, addressable by runtime id and by username.
#[derive(Default)]
pub struct ClientDirectory {
    by_id: Mutex<HashMap<ClientId, Arc<ClientState>>>,
}

impl ClientDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record for a fresh connection, claiming a generated
    /// username.
    pub fn register(
        &self,
        sender: Arc<ClientSender>,
        usernames: &UsernameRegistry,
    ) -> Arc<ClientState> {
        let mut rng = rand::thread_rng();
        let client_id = format!("c-{}", random_hex(&mut rng, 12));
        let client_guid = random_hex(&mut rng, 32);

        // Ten random digits collide rarely; retry until claimed.
        let username = loop {
            let candidate = generate_username(&mut rng);
            if usernames.try_claim(&candidate, &client_guid) {
                break candidate;
            }
            tracing::debug!(candidate, "Username collision, regenerating");
        };

        let state = Arc::new(ClientState {
            client_id: client_id.clone(),
            client_guid,
            sender,
            username: Mutex::new(username),
            password: Mutex::new(generate_password(&mut rng)),
            display_name: Mutex::new(String::new()),
            session: Mutex::new(None),
        });
        self.by_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(client_id, Arc::clone(&state));
        state
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<ClientState>> {
        self.by_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    /// Find the client publishing `username`.
    #[must_use]
    pub fn find_by_username(&self, username: &str) -> Option<Arc<ClientState>> {
        self.by_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .find(|c| c.username() == username)
            .cloned()
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientState>> {
        self.by_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(client_id)
    }
}

fn generate_username(rng: &mut impl Rng) -> String {
    let digit = Uniform::from(0..10u8);
    (0..USERNAME_DIGITS)
        .map(|_| char::from(b'0' + digit.sample(rng)))
        .collect()
}

fn generate_password(rng: &mut impl Rng) -> String {
    // Lowercase alphanumeric only; passwords compare case-insensitively.
    std::iter::repeat_with(|| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .take(PASSWORD_LEN)
        .collect()
}

fn random_hex(rng: &mut impl Rng, len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    (0..len)
        .map(|_| char::from(HEX[rng.gen_range(0..HEX.len())]))
        .collect()
}

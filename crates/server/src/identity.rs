//! Durable canvas accounts and password credentials.
//!
//! Usernames are unique case-insensitively: the store is keyed by the
//! trimmed, lower-cased name while the record keeps the spelling used at
//! registration for display. Passwords are stored as salted
//! PBKDF2-HMAC-SHA256 digests; verification goes through
//! [`ring::pbkdf2::verify`], which compares in constant time.

use crate::config::AuthConfig;
use crate::error::WorldError;
use rand::RngCore;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use tracing::warn;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Salted one-way password digest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
    pub iterations: NonZeroU32,
    #[serde(with = "b64")]
    salt: Vec<u8>,
    #[serde(with = "b64")]
    hash: Vec<u8>,
}

impl PasswordHash {
    /// Hash `password` with a fresh random salt. CPU heavy; keep it off the
    /// world lock.
    pub fn new(password: &str, iterations: NonZeroU32) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let mut hash = vec![0u8; HASH_LEN];
        pbkdf2::derive(PBKDF2_ALG, iterations, &salt, password.as_bytes(), &mut hash);
        Self {
            iterations,
            salt,
            hash,
        }
    }

    /// Constant-time check of `password` against this digest.
    pub fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            PBKDF2_ALG,
            self.iterations,
            &self.salt,
            password.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHash")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// A stored account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Name as typed at registration.
    pub username: String,
    pub credential: PasswordHash,
    pub pixel_credits: u32,
}

/// A username held while its password is being hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: String,
    pub username: String,
}

/// All accounts of one canvas world.
#[derive(Debug)]
pub struct IdentityStore {
    records: HashMap<String, IdentityRecord>,
    pending: HashSet<String>,
    policy: AuthConfig,
    dirty: bool,
}

impl IdentityStore {
    pub fn new(policy: AuthConfig) -> Self {
        Self {
            records: HashMap::new(),
            pending: HashSet::new(),
            policy,
            dirty: false,
        }
    }

    /// Rebuild a store from persisted records. Later duplicates are dropped.
    pub fn from_records(policy: AuthConfig, records: Vec<IdentityRecord>) -> Self {
        let mut store = Self::new(policy);
        for record in records {
            let key = normalize_key(&record.username);
            if store.records.contains_key(&key) {
                warn!("Skipping duplicate persisted account {:?}", record.username);
                continue;
            }
            store.records.insert(key, record);
        }
        store
    }

    /// Rounds used for new hashes.
    pub fn iterations(&self) -> NonZeroU32 {
        NonZeroU32::new(self.policy.pbkdf2_iterations).unwrap_or(NonZeroU32::MIN)
    }

    /// Validate a username, returning its lookup key and display form.
    pub fn normalize(&self, username: &str) -> Result<(String, String), WorldError> {
        let display = username.trim();
        if display.is_empty() {
            return Err(WorldError::InvalidInput("Username cannot be empty".into()));
        }
        if display.chars().count() > self.policy.max_username_length {
            return Err(WorldError::InvalidInput(format!(
                "Username must be at most {} characters",
                self.policy.max_username_length
            )));
        }
        if display.chars().any(char::is_control) {
            return Err(WorldError::InvalidInput(
                "Username contains invalid characters".into(),
            ));
        }
        Ok((normalize_key(display), display.to_string()))
    }

    /// First half of registration: validate and hold the username so a
    /// concurrent registration of the same name fails fast.
    pub fn reserve(&mut self, username: &str, password: &str) -> Result<Reservation, WorldError> {
        let (key, username) = self.normalize(username)?;
        if password.is_empty() || password.chars().count() < self.policy.min_password_length {
            return Err(WorldError::InvalidInput(format!(
                "Password must be at least {} characters",
                self.policy.min_password_length.max(1)
            )));
        }
        if self.records.contains_key(&key) || !self.pending.insert(key.clone()) {
            return Err(WorldError::UsernameTaken);
        }
        Ok(Reservation { key, username })
    }

    /// Second half of registration: store the account with its seed balance.
    pub fn commit(
        &mut self,
        reservation: Reservation,
        credential: PasswordHash,
        starting_credits: u32,
    ) -> Result<&IdentityRecord, WorldError> {
        self.pending.remove(&reservation.key);
        if self.records.contains_key(&reservation.key) {
            return Err(WorldError::UsernameTaken);
        }
        self.dirty = true;
        let record = IdentityRecord {
            username: reservation.username,
            credential,
            pixel_credits: starting_credits,
        };
        Ok(&*self.records.entry(reservation.key).or_insert(record))
    }

    /// Drop a reservation whose registration failed.
    pub fn release(&mut self, reservation: &Reservation) {
        self.pending.remove(&reservation.key);
    }

    /// Look up the stored credential for a login attempt.
    pub fn credential(&self, username: &str) -> Result<(String, PasswordHash), WorldError> {
        let (key, _) = self.normalize(username)?;
        let record = self.records.get(&key).ok_or(WorldError::UnknownUser)?;
        Ok((key, record.credential.clone()))
    }

    /// Register in one step, hashing inline.
    pub fn register(
        &mut self,
        username: &str,
        password: &str,
        starting_credits: u32,
    ) -> Result<&IdentityRecord, WorldError> {
        let reservation = self.reserve(username, password)?;
        let credential = PasswordHash::new(password, self.iterations());
        self.commit(reservation, credential, starting_credits)
    }

    /// Check a username/password pair, hashing inline.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<&IdentityRecord, WorldError> {
        let (key, credential) = self.credential(username)?;
        if !credential.verify(password) {
            return Err(WorldError::BadCredential);
        }
        self.records.get(&key).ok_or(WorldError::UnknownUser)
    }

    pub fn get(&self, key: &str) -> Option<&IdentityRecord> {
        self.records.get(key)
    }

    pub fn credits(&self, key: &str) -> Option<u32> {
        self.records.get(key).map(|r| r.pixel_credits)
    }

    /// Take `cost` credits, failing without change when the balance is short.
    pub fn charge(&mut self, key: &str, cost: u32) -> Result<u32, WorldError> {
        let record = self
            .records
            .get_mut(key)
            .ok_or(WorldError::NotAuthenticated)?;
        if record.pixel_credits < cost {
            return Err(WorldError::InsufficientCredits);
        }
        record.pixel_credits -= cost;
        if cost > 0 {
            self.dirty = true;
        }
        Ok(record.pixel_credits)
    }

    /// Add credits without exceeding `cap`. A balance already above the cap
    /// is left alone. Returns the new balance.
    pub fn grant(&mut self, key: &str, amount: u32, cap: u32) -> Option<u32> {
        let record = self.records.get_mut(key)?;
        let before = record.pixel_credits;
        if before < cap {
            record.pixel_credits = before.saturating_add(amount).min(cap);
        }
        if record.pixel_credits != before {
            self.dirty = true;
        }
        Some(record.pixel_credits)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in a stable order for persistence.
    pub fn records(&self) -> Vec<&IdentityRecord> {
        let mut records: Vec<&IdentityRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

fn normalize_key(username: &str) -> String {
    username.trim().to_lowercase()
}

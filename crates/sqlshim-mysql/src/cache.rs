//! caching_sha2_password digest cache.
//!
//! Shared by every connection of a server. Successful caching_sha2 logins
//! record `SHA256(SHA256(password))` under `user@host`; lookups always miss,
//! so every login takes the full-auth path.

use dashmap::DashMap;

/// Concurrent map from `user@host` to a double-SHA256 password digest.
#[derive(Debug, Default)]
pub struct Sha2PasswordCache {
    entries: DashMap<String, [u8; 32]>,
}

impl Sha2PasswordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a user connecting through `host`.
    pub fn key(user: &str, host: &str) -> String {
        format!("{}@{}", user, host)
    }

    /// Record a digest after a successful full authentication.
    pub fn insert(&self, key: impl Into<String>, digest: [u8; 32]) {
        self.entries.insert(key.into(), digest);
    }

    /// Fast-auth lookup. Always a miss.
    pub fn lookup(&self, _key: &str) -> Option<[u8; 32]> {
        None
    }

    /// Drop the entry for `key`; returns whether one was present.
    ///
    /// Atomic with respect to concurrent `insert`s of the same key: the
    /// removal either precedes or follows each write, never tears it.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

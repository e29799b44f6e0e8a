//! Credential lookup and verification.

use std::collections::HashMap;

use crate::error::Result;

/// Source of truth for client credentials.
///
/// `get_credential` serves plugins that need the stored password to verify a
/// scramble. `check_password` receives a cleartext password and may validate
/// it any way it likes, including by logging in to a real database.
pub trait CredentialProvider {
    /// Look up the password for `username`; `None` if the user is unknown.
    fn get_credential(&mut self, username: &str) -> Result<Option<String>>;

    /// Validate a cleartext password. `capability` is the client's
    /// negotiated capability bitset.
    fn check_password(&mut self, username: &str, password: &str, capability: u32)
    -> Result<bool>;
}

/// Fixed username/password table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialProvider {
    users: HashMap<String, String>,
}

impl InMemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl CredentialProvider for InMemoryCredentialProvider {
    fn get_credential(&mut self, username: &str) -> Result<Option<String>> {
        Ok(self.users.get(username).cloned())
    }

    fn check_password(
        &mut self,
        username: &str,
        password: &str,
        _capability: u32,
    ) -> Result<bool> {
        let ok = self.users.get(username).is_some_and(|p| p == password);
        if !ok {
            tracing::debug!(user = username, "password mismatch");
        }
        Ok(ok)
    }
}

//! Token authentication.
//!
//! Issuing tokens is out of scope; the server only maps a presented token
//! to the user it was issued for.

use anyhow::{Context, Result};
use marksync_types::{DeviceId, UserId};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// An authenticated `(user, device)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

/// Resolves bearer tokens to identities.
pub trait IdentityResolver: Send + Sync {
    /// Returns the identity for `token` connecting as `device_id`, or
    /// `None` if the token is unknown or the device id is empty.
    fn resolve(&self, token: &str, device_id: &DeviceId) -> Option<Identity>;
}

/// Fixed token table, loaded from a JSON file of the form
/// `{ "<token>": "<userId>", ... }`.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityResolver {
    tokens: HashMap<String, UserId>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for a user.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }

    /// Loads the token table from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let tokens: HashMap<String, UserId> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse token file {}", path.display()))?;
        info!(path = %path.display(), tokens = tokens.len(), "loaded token table");
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, token: &str, device_id: &DeviceId) -> Option<Identity> {
        if device_id.is_empty() {
            return None;
        }
        let user_id = self.tokens.get(token)?;
        Some(Identity {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        })
    }
}

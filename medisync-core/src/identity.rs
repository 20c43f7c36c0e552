//! Caller identity for scoping remote reads and writes.
//!
//! The identity provider itself is an external collaborator; the core only
//! needs [`IdentityProvider::current_identity`]. [`Session`] is the provider
//! used by the binaries and tests: it publishes sign-in and sign-out over a
//! watch channel so the lifecycle coordinator can react to them.
//!
//! # Identity States
//!
//! 1. **Unauthenticated** - no caller identity; every gateway call fails fast
//! 2. **Authenticated** - a stable owner id scopes every query and write

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Stable identifier of the caller that owns a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Supplies the current caller identity, if any.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<OwnerId>;
}

/// Identity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Nobody is signed in
    Unauthenticated,
    /// A caller identity is available
    Authenticated,
}

/// An observable authentication session.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct Session {
    tx: Arc<watch::Sender<Option<OwnerId>>>,
}

impl Session {
    /// Creates a signed-out session.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Creates a session already signed in as `owner`.
    pub fn signed_in(owner: impl Into<OwnerId>) -> Self {
        let session = Self::new();
        session.sign_in(owner);
        session
    }

    /// Signs in as `owner`. Observers are only notified when the identity changes.
    pub fn sign_in(&self, owner: impl Into<OwnerId>) {
        let owner = owner.into();
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&owner) {
                false
            } else {
                *current = Some(owner);
                true
            }
        });
    }

    /// Signs out. Observers are only notified if someone was signed in.
    pub fn sign_out(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn state(&self) -> IdentityState {
        if self.tx.borrow().is_some() {
            IdentityState::Authenticated
        } else {
            IdentityState::Unauthenticated
        }
    }

    /// Returns a receiver that observes identity changes.
    pub fn watch(&self) -> watch::Receiver<Option<OwnerId>> {
        self.tx.subscribe()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for Session {
    fn current_identity(&self) -> Option<OwnerId> {
        self.tx.borrow().clone()
    }
}

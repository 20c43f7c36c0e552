//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::gateway::CollectionGateway;
use crate::identity::Session;
use crate::remote::{AccessPolicy, Fields, MemoryStore};

pub(crate) const OWNER: &str = "clinic-a";

/// A memory store and a gateway signed in as [`OWNER`].
pub(crate) struct Fixture {
    pub remote: MemoryStore,
    pub session: Session,
    pub gateway: CollectionGateway,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_policy(AccessPolicy::Open)
    }

    pub fn with_policy(policy: AccessPolicy) -> Self {
        let remote = MemoryStore::with_policy(policy);
        let session = Session::signed_in(OWNER);
        let gateway = CollectionGateway::new(Arc::new(remote.clone()), Arc::new(session.clone()));
        Self {
            remote,
            session,
            gateway,
        }
    }
}

pub(crate) fn fields(value: Value) -> Fields {
    value
        .as_object()
        .cloned()
        .unwrap_or_else(|| panic!("expected a JSON object, got {}", value))
}

/// Polls `cond` until it holds, for up to a second.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

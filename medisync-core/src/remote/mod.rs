//! Remote document store abstraction.
//!
//! A remote store keeps documents in named collections. Each document is a
//! server-assigned id plus a JSON object of fields. Stores support one-shot
//! reads, writes, and live queries that push a full snapshot of the matching
//! documents every time the collection changes.
//!
//! ## Backends
//!
//! - [`MemoryStore`] - in-process store with access policy and fault switches
//! - [`HttpStore`] - client for the `medisync-server` REST + WebSocket API

mod http;
mod memory;
pub mod protocol;

pub use http::HttpStore;
pub use memory::{AccessPolicy, MemoryStore};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// Field holding the identity that owns a document.
pub const OWNER_FIELD: &str = "owner_id";
/// Server-assigned creation timestamp.
pub const CREATED_AT_FIELD: &str = "created_at";
/// Server-assigned update timestamp.
pub const UPDATED_AT_FIELD: &str = "updated_at";
/// Sentinel value a store replaces with its own clock when writing.
pub const SERVER_TIMESTAMP: &str = "$serverTimestamp";

/// Document fields as a JSON object.
pub type Fields = serde_json::Map<String, Value>;

/// A document as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.fields.get(OWNER_FIELD).and_then(Value::as_str)
    }
}

/// Equality filter on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

/// A query over one collection, optionally filtered by field equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filter: Option<FieldFilter>,
}

impl Query {
    /// Every document in the collection.
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
        }
    }

    /// Documents whose `field` equals `value`.
    pub fn where_eq(
        collection: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            collection: collection.into(),
            filter: Some(FieldFilter {
                field: field.into(),
                value: value.into(),
            }),
        }
    }

    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match &self.filter {
            Some(filter) => doc.get(&filter.field) == Some(&filter.value),
            None => true,
        }
    }
}

/// Sending half of a live query, held by the backend.
pub type SnapshotSender = mpsc::UnboundedSender<Result<Vec<Document>, RemoteError>>;

/// Receiving half of a live query.
///
/// Dropping it cancels the query; the backend notices the closed channel.
#[derive(Debug)]
pub struct LiveQuery {
    rx: mpsc::UnboundedReceiver<Result<Vec<Document>, RemoteError>>,
}

impl LiveQuery {
    /// Creates a connected sender/query pair.
    pub fn channel() -> (SnapshotSender, LiveQuery) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, LiveQuery { rx })
    }

    /// Waits for the next snapshot, or `None` once the backend closed the feed.
    pub async fn next(&mut self) -> Option<Result<Vec<Document>, RemoteError>> {
        self.rx.recv().await
    }
}

/// A remote, multi-tenant document store.
///
/// Writes replace [`SERVER_TIMESTAMP`] sentinels with the store's clock.
pub trait RemoteStore: Send + Sync {
    /// Adds a document and returns its server-assigned id.
    fn add<'a>(
        &'a self,
        collection: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<String, RemoteError>>;

    /// Merges `fields` into an existing document.
    fn update<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<(), RemoteError>>;

    fn delete<'a>(&'a self, collection: &'a str, id: &'a str)
        -> BoxFuture<'a, Result<(), RemoteError>>;

    fn get<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Document>, RemoteError>>;

    fn query<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Document>, RemoteError>>;

    /// Opens a live query. The first snapshot is delivered immediately.
    ///
    /// A rejected query may fail here or deliver an error on the feed.
    fn listen<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<LiveQuery, RemoteError>>;
}

/// Replaces server timestamp sentinels in `fields` with `now`.
pub fn resolve_server_timestamps(fields: &mut Fields, now: DateTime<Utc>) {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    for value in fields.values_mut() {
        if value.as_str() == Some(SERVER_TIMESTAMP) {
            *value = Value::String(stamp.clone());
        }
    }
}

/// Merges `patch` into `target`; keys in `patch` win.
pub fn merge_fields(target: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

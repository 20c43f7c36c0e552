//! In-process document store.
//!
//! Keeps collections in memory and pushes a fresh snapshot to every live
//! listener of a collection after each write. The access policy emulates a
//! deployment whose security rules reject owner-filtered queries, and the
//! offline switch and latency knob emulate an unreachable or slow backend.
//!
//! The server binary hosts one of these behind its HTTP API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    merge_fields, resolve_server_timestamps, Document, Fields, LiveQuery, Query, RemoteStore,
    SnapshotSender,
};
use crate::error::RemoteError;

const PERMISSION_DENIED: &str = "Missing or insufficient permissions.";

/// Which queries the store's access rules accept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPolicy {
    /// Every query is allowed
    #[default]
    Open,
    /// Filtered queries fail when they are opened
    RejectFilteredAtSetup,
    /// Filtered live queries open, then deliver a permission error on the feed
    RejectFilteredOnStream,
}

impl AccessPolicy {
    fn rejects(&self, query: &Query) -> bool {
        query.is_filtered() && *self != AccessPolicy::Open
    }
}

struct Listener {
    query: Query,
    tx: SnapshotSender,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Document>>,
    listeners: Vec<Listener>,
    policy: AccessPolicy,
    offline: bool,
    latency: Duration,
}

impl Inner {
    fn snapshot(&self, query: &Query) -> Vec<Document> {
        self.collections
            .get(&query.collection)
            .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default()
    }

    /// Pushes a snapshot to every listener on `collection`, dropping closed ones.
    fn notify(&mut self, collection: &str) {
        let mut listeners = std::mem::take(&mut self.listeners);
        listeners.retain(|listener| {
            if listener.tx.is_closed() {
                return false;
            }
            if listener.query.collection != collection {
                return true;
            }
            listener.tx.send(Ok(self.snapshot(&listener.query))).is_ok()
        });
        self.listeners = listeners;
    }
}

/// In-memory multi-tenant document store.
///
/// Clones share the same documents and listeners.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: AccessPolicy) -> Self {
        let store = Self::new();
        store.set_policy(policy);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: AccessPolicy) {
        self.lock().policy = policy;
    }

    pub fn policy(&self) -> AccessPolicy {
        self.lock().policy
    }

    /// While offline, writes and one-shot reads fail with `Unavailable`.
    /// Open live queries stay connected.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delays every call. Online state is checked after the delay.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Inserts or replaces a document as-is, bypassing timestamps and rules.
    pub fn insert_document(&self, collection: &str, doc: Document) {
        let mut inner = self.lock();
        let docs = inner.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        inner.notify(collection);
    }

    /// Replaces a whole collection, e.g. when loading persisted state.
    pub fn load_collection(&self, collection: &str, docs: Vec<Document>) {
        let mut inner = self.lock();
        inner.collections.insert(collection.to_string(), docs);
        inner.notify(collection);
    }

    /// Returns every document in `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Owner of a document, if it exists.
    pub fn owner_of(&self, collection: &str, id: &str) -> Option<String> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .and_then(|d| d.owner_id().map(str::to_string))
    }

    /// Number of open live queries on `collection`.
    pub fn active_listeners(&self, collection: &str) -> usize {
        self.lock()
            .listeners
            .iter()
            .filter(|l| l.query.collection == collection && !l.tx.is_closed())
            .count()
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_online(inner: &Inner) -> Result<(), RemoteError> {
        if inner.offline {
            Err(RemoteError::Unavailable("remote store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    async fn add_document(
        &self,
        collection: &str,
        mut fields: Fields,
    ) -> Result<String, RemoteError> {
        self.delay().await;
        let mut inner = self.lock();
        Self::ensure_online(&inner)?;

        let id = Uuid::new_v4().simple().to_string();
        resolve_server_timestamps(&mut fields, Utc::now());
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(Document::new(id.clone(), fields));
        inner.notify(collection);

        tracing::debug!("Added {}/{}", collection, id);
        Ok(id)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        mut fields: Fields,
    ) -> Result<(), RemoteError> {
        self.delay().await;
        let mut inner = self.lock();
        Self::ensure_online(&inner)?;

        resolve_server_timestamps(&mut fields, Utc::now());
        let doc = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
        merge_fields(&mut doc.fields, fields);
        inner.notify(collection);

        tracing::debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.delay().await;
        let mut inner = self.lock();
        Self::ensure_online(&inner)?;

        let docs = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| RemoteError::NotFound(format!("{}/{}", collection, id)))?;
        let before = docs.len();
        docs.retain(|d| d.id != id);
        if docs.len() == before {
            return Err(RemoteError::NotFound(format!("{}/{}", collection, id)));
        }
        inner.notify(collection);

        tracing::debug!("Deleted {}/{}", collection, id);
        Ok(())
    }

    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, RemoteError> {
        self.delay().await;
        let inner = self.lock();
        Self::ensure_online(&inner)?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        self.delay().await;
        let inner = self.lock();
        Self::ensure_online(&inner)?;
        if inner.policy.rejects(query) {
            return Err(RemoteError::PermissionDenied(PERMISSION_DENIED.to_string()));
        }
        Ok(inner.snapshot(query))
    }

    async fn open_listener(&self, query: &Query) -> Result<LiveQuery, RemoteError> {
        self.delay().await;
        let mut inner = self.lock();
        let (tx, live) = LiveQuery::channel();

        match inner.policy {
            AccessPolicy::RejectFilteredAtSetup if query.is_filtered() => {
                return Err(RemoteError::PermissionDenied(PERMISSION_DENIED.to_string()));
            }
            AccessPolicy::RejectFilteredOnStream if query.is_filtered() => {
                // The feed ends right after the error, like a listener torn down by the rules
                let _ = tx.send(Err(RemoteError::PermissionDenied(
                    PERMISSION_DENIED.to_string(),
                )));
                return Ok(live);
            }
            _ => {}
        }

        let _ = tx.send(Ok(inner.snapshot(query)));
        inner.listeners.push(Listener {
            query: query.clone(),
            tx,
        });
        tracing::debug!(
            "Opened listener on {} (filtered: {})",
            query.collection,
            query.is_filtered()
        );
        Ok(live)
    }
}

impl RemoteStore for MemoryStore {
    fn add<'a>(
        &'a self,
        collection: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<String, RemoteError>> {
        self.add_document(collection, fields).boxed()
    }

    fn update<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        self.update_document(collection, id, fields).boxed()
    }

    fn delete<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        self.delete_document(collection, id).boxed()
    }

    fn get<'a>(
        &'a self,
        collection: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Document>, RemoteError>> {
        self.get_document(collection, id).boxed()
    }

    fn query<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Document>, RemoteError>> {
        self.run_query(query).boxed()
    }

    fn listen<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<LiveQuery, RemoteError>> {
        self.open_listener(query).boxed()
    }
}

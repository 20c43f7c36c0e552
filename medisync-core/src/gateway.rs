//! Owner-scoped access to remote collections.
//!
//! The gateway attaches the caller's identity to every write and scopes every
//! read to documents owned by the caller. Live queries are opened filtered by
//! `owner_id`. Deployments whose rules reject that filter get a permanent
//! fallback: an unfiltered live query whose documents are filtered by owner in
//! memory. Either way the caller only ever sees its own documents, sorted by
//! the collection's order field.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, RemoteError};
use crate::identity::{IdentityProvider, OwnerId};
use crate::order::{sort_documents, OrderBy};
use crate::remote::{
    Document, Fields, LiveQuery, Query, RemoteStore, CREATED_AT_FIELD, OWNER_FIELD,
    SERVER_TIMESTAMP, UPDATED_AT_FIELD,
};

/// Cancels a live query when disposed or dropped.
pub struct Disposer {
    task: Option<JoinHandle<()>>,
}

impl Disposer {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A disposer with nothing to cancel.
    pub fn noop() -> Self {
        Self { task: None }
    }

    /// Whether a live query is attached.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancels the live query.
    pub fn dispose(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Result of [`CollectionGateway::subscribe`].
///
/// `error` is set when no live query could be opened; the disposer is then a
/// no-op.
#[derive(Debug)]
pub struct Subscription {
    pub disposer: Disposer,
    pub error: Option<GatewayError>,
}

impl Subscription {
    fn failed(error: GatewayError) -> Self {
        Self {
            disposer: Disposer::noop(),
            error: Some(error),
        }
    }
}

/// Stateless wrapper over a [`RemoteStore`] scoped to the current identity.
#[derive(Clone)]
pub struct CollectionGateway {
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
}

impl CollectionGateway {
    pub fn new(remote: Arc<dyn RemoteStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { remote, identity }
    }

    /// The identity currently scoping calls, if any.
    pub fn identity(&self) -> Option<OwnerId> {
        self.identity.current_identity()
    }

    fn require_identity(&self) -> Result<OwnerId, GatewayError> {
        self.identity
            .current_identity()
            .ok_or(GatewayError::Unauthenticated)
    }

    /// Opens an owner-scoped live query on `collection`.
    ///
    /// Every snapshot, sorted by `order`, fully replaces what `on_update`
    /// received before.
    pub async fn subscribe<F>(
        &self,
        collection: &'static str,
        order: OrderBy,
        on_update: F,
    ) -> Subscription
    where
        F: Fn(Vec<Document>) + Send + 'static,
    {
        let owner = match self.require_identity() {
            Ok(owner) => owner,
            Err(err) => {
                tracing::warn!("Not subscribing to {}: {}", collection, err);
                return Subscription::failed(err);
            }
        };

        let filtered = Query::where_eq(collection, OWNER_FIELD, owner.as_str());
        let (live, degraded) = match self.remote.listen(&filtered).await {
            Ok(live) => (live, false),
            Err(source) => {
                let rejected = GatewayError::FilteredQueryRejected {
                    collection: collection.to_string(),
                    source,
                };
                tracing::warn!("{}; falling back to unfiltered listener", rejected);
                match self.remote.listen(&Query::all(collection)).await {
                    Ok(live) => (live, true),
                    Err(source) => {
                        let err = GatewayError::RemoteRead {
                            collection: collection.to_string(),
                            source,
                        };
                        tracing::warn!("{}", err);
                        return Subscription::failed(err);
                    }
                }
            }
        };

        let feed = SnapshotFeed {
            remote: Arc::clone(&self.remote),
            collection,
            owner,
            order,
            degraded,
        };
        let task = tokio::spawn(feed.run(live, on_update));

        Subscription {
            disposer: Disposer::new(task),
            error: None,
        }
    }

    /// Creates a document owned by the caller and returns its server id.
    pub async fn create(
        &self,
        collection: &str,
        mut fields: Fields,
    ) -> Result<String, GatewayError> {
        let owner = self.require_identity()?;
        fields.insert(OWNER_FIELD.to_string(), Value::String(owner.to_string()));
        fields.insert(CREATED_AT_FIELD.to_string(), SERVER_TIMESTAMP.into());
        fields.insert(UPDATED_AT_FIELD.to_string(), SERVER_TIMESTAMP.into());

        self.remote
            .add(collection, fields)
            .await
            .map_err(|source| write_error(collection, source))
    }

    /// Merges `partial` into a document and stamps `updated_at`.
    ///
    /// Ownership and creation time can't be changed through an update.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        mut partial: Fields,
    ) -> Result<(), GatewayError> {
        self.require_identity()?;
        partial.remove(OWNER_FIELD);
        partial.remove(CREATED_AT_FIELD);
        partial.insert(UPDATED_AT_FIELD.to_string(), SERVER_TIMESTAMP.into());

        self.remote
            .update(collection, id, partial)
            .await
            .map_err(|source| write_error(collection, source))
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), GatewayError> {
        self.require_identity()?;
        self.remote
            .delete(collection, id)
            .await
            .map_err(|source| write_error(collection, source))
    }

    /// Reads one document. Documents owned by someone else read as absent,
    /// and read failures are logged and read as absent.
    pub async fn get_one(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, GatewayError> {
        let owner = self.require_identity()?;
        match self.remote.get(collection, id).await {
            Ok(doc) => Ok(doc.filter(|d| d.owner_id() == Some(owner.as_str()))),
            Err(source) => {
                tracing::warn!("{}", read_error(collection, source));
                Ok(None)
            }
        }
    }

    /// Reads every document owned by the caller, sorted by `order`.
    ///
    /// Uses the same fallback as [`subscribe`](Self::subscribe). An empty
    /// result is returned when both queries fail.
    pub async fn get_many(
        &self,
        collection: &str,
        order: OrderBy,
    ) -> Result<Vec<Document>, GatewayError> {
        let owner = self.require_identity()?;
        let filtered = Query::where_eq(collection, OWNER_FIELD, owner.as_str());

        let mut docs = match self.remote.query(&filtered).await {
            Ok(docs) => docs,
            Err(source) => {
                let rejected = GatewayError::FilteredQueryRejected {
                    collection: collection.to_string(),
                    source,
                };
                tracing::warn!("{}; falling back to unfiltered query", rejected);
                match self.remote.query(&Query::all(collection)).await {
                    Ok(docs) => docs,
                    Err(source) => {
                        tracing::warn!("{}", read_error(collection, source));
                        return Ok(Vec::new());
                    }
                }
            }
        };

        docs.retain(|d| d.owner_id() == Some(owner.as_str()));
        sort_documents(&mut docs, &order);
        Ok(docs)
    }
}

fn write_error(collection: &str, source: RemoteError) -> GatewayError {
    GatewayError::RemoteWrite {
        collection: collection.to_string(),
        source,
    }
}

fn read_error(collection: &str, source: RemoteError) -> GatewayError {
    GatewayError::RemoteRead {
        collection: collection.to_string(),
        source,
    }
}

/// Pumps one live query into a snapshot callback.
struct SnapshotFeed {
    remote: Arc<dyn RemoteStore>,
    collection: &'static str,
    owner: OwnerId,
    order: OrderBy,
    /// Set once the filtered query was rejected
    degraded: bool,
}

impl SnapshotFeed {
    async fn run<F>(mut self, mut live: LiveQuery, on_update: F)
    where
        F: Fn(Vec<Document>) + Send + 'static,
    {
        loop {
            match live.next().await {
                Some(Ok(mut docs)) => {
                    docs.retain(|d| d.owner_id() == Some(self.owner.as_str()));
                    sort_documents(&mut docs, &self.order);
                    tracing::debug!(
                        "Snapshot for {}: {} document(s){}",
                        self.collection,
                        docs.len(),
                        if self.degraded { " (fallback)" } else { "" }
                    );
                    on_update(docs);
                }
                Some(Err(source)) if !self.degraded => {
                    let rejected = GatewayError::FilteredQueryRejected {
                        collection: self.collection.to_string(),
                        source,
                    };
                    tracing::warn!("{}; falling back to unfiltered listener", rejected);
                    match self.remote.listen(&Query::all(self.collection)).await {
                        Ok(fallback) => {
                            live = fallback;
                            self.degraded = true;
                        }
                        Err(source) => {
                            tracing::warn!("{}", read_error(self.collection, source));
                            return;
                        }
                    }
                }
                Some(Err(source)) => {
                    tracing::warn!("{}", read_error(self.collection, source));
                    return;
                }
                None => {
                    tracing::debug!("Live query on {} ended", self.collection);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{AccessPolicy, MemoryStore};
    use crate::testing::{fields, wait_until, Fixture};
    use serde_json::json;
    use std::sync::Mutex;

    fn collect() -> (Arc<Mutex<Vec<Vec<Document>>>>, impl Fn(Vec<Document>) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |docs| sink.lock().unwrap().push(docs))
    }

    fn patient(id: &str, owner: &str, name: &str, created_at: &str) -> Document {
        Document::new(
            id,
            fields(json!({"owner_id": owner, "name": name, "created_at": created_at})),
        )
    }

    fn seed(remote: &MemoryStore) {
        remote.insert_document(
            "patients",
            patient("a1", "clinic-a", "Ada", "2025-01-01T00:00:00Z"),
        );
        remote.insert_document(
            "patients",
            patient("b1", "clinic-b", "Bob", "2025-01-02T00:00:00Z"),
        );
        remote.insert_document("patients", patient("a2", "clinic-a", "Cy", "2025-01-03T00:00:00Z"));
    }

    fn last_ids(seen: &Mutex<Vec<Vec<Document>>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .last()
            .map(|docs| docs.iter().map(|d| d.id.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_subscribe_unauthenticated_returns_noop() {
        let fx = Fixture::new();
        fx.session.sign_out();
        let (seen, on_update) = collect();

        let sub = fx
            .gateway
            .subscribe("patients", OrderBy::desc("created_at"), on_update)
            .await;
        assert_eq!(sub.error, Some(GatewayError::Unauthenticated));
        assert!(!sub.disposer.is_active());
        assert_eq!(fx.remote.active_listeners("patients"), 0);
        sub.disposer.dispose();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_scopes_and_sorts() {
        let fx = Fixture::new();
        seed(&fx.remote);
        let (seen, on_update) = collect();

        let sub = fx
            .gateway
            .subscribe("patients", OrderBy::desc("created_at"), on_update)
            .await;
        assert!(sub.error.is_none());
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(last_ids(&seen), vec!["a2", "a1"]);
    }

    #[tokio::test]
    async fn test_fallback_at_setup_still_scopes_by_owner() {
        let fx = Fixture::with_policy(AccessPolicy::RejectFilteredAtSetup);
        seed(&fx.remote);
        let (seen, on_update) = collect();

        let sub = fx
            .gateway
            .subscribe("patients", OrderBy::desc("created_at"), on_update)
            .await;
        assert!(sub.error.is_none());
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(last_ids(&seen), vec!["a2", "a1"]);
        assert_eq!(fx.remote.active_listeners("patients"), 1);
    }

    #[tokio::test]
    async fn test_fallback_on_stream_error_still_scopes_by_owner() {
        let fx = Fixture::with_policy(AccessPolicy::RejectFilteredOnStream);
        seed(&fx.remote);
        let (seen, on_update) = collect();

        let sub = fx
            .gateway
            .subscribe("patients", OrderBy::desc("created_at"), on_update)
            .await;
        assert!(sub.error.is_none());
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(last_ids(&seen), vec!["a2", "a1"]);

        // Later writes keep flowing through the fallback listener
        fx.remote.insert_document(
            "patients",
            patient("a3", "clinic-a", "Di", "2025-01-04T00:00:00Z"),
        );
        assert!(wait_until(|| last_ids(&seen).len() == 3).await);
        assert_eq!(last_ids(&seen), vec!["a3", "a2", "a1"]);
    }

    #[tokio::test]
    async fn test_dispose_closes_listener() {
        let fx = Fixture::new();
        let (_seen, on_update) = collect();
        let sub = fx
            .gateway
            .subscribe("patients", OrderBy::desc("created_at"), on_update)
            .await;
        assert_eq!(fx.remote.active_listeners("patients"), 1);

        sub.disposer.dispose();
        assert!(wait_until(|| fx.remote.active_listeners("patients") == 0).await);
    }

    #[tokio::test]
    async fn test_create_attaches_owner_and_timestamps() {
        let fx = Fixture::new();
        let id = fx
            .gateway
            .create("patients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();

        let docs = fx.remote.documents("patients");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);
        assert_eq!(docs[0].owner_id(), Some("clinic-a"));
        assert!(docs[0].get(CREATED_AT_FIELD).is_some());
        assert_ne!(docs[0].get(CREATED_AT_FIELD), Some(&json!(SERVER_TIMESTAMP)));
    }

    #[tokio::test]
    async fn test_update_cannot_change_owner() {
        let fx = Fixture::new();
        let id = fx
            .gateway
            .create("patients", fields(json!({"name": "Ada"})))
            .await
            .unwrap();
        fx.gateway
            .update(
                "patients",
                &id,
                fields(json!({"name": "Ada L.", "owner_id": "clinic-b"})),
            )
            .await
            .unwrap();

        let doc = fx.remote.documents("patients").remove(0);
        assert_eq!(doc.owner_id(), Some("clinic-a"));
        assert_eq!(doc.get("name"), Some(&json!("Ada L.")));
    }

    #[tokio::test]
    async fn test_write_failures_are_remote_write_errors() {
        let fx = Fixture::new();
        fx.remote.set_offline(true);
        let err = fx
            .gateway
            .create("patients", Fields::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RemoteWrite {
                source: RemoteError::Unavailable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unauthenticated_write_fails_fast() {
        let fx = Fixture::new();
        fx.session.sign_out();
        let err = fx
            .gateway
            .create("patients", Fields::new())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated);
        assert!(fx.remote.documents("patients").is_empty());
    }

    #[tokio::test]
    async fn test_get_one_hides_foreign_documents() {
        let fx = Fixture::new();
        seed(&fx.remote);
        assert!(fx.gateway.get_one("patients", "a1").await.unwrap().is_some());
        assert!(fx.gateway.get_one("patients", "b1").await.unwrap().is_none());
        assert!(fx.gateway.get_one("patients", "zz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_many_falls_back_and_filters() {
        let fx = Fixture::with_policy(AccessPolicy::RejectFilteredAtSetup);
        seed(&fx.remote);
        let docs = fx
            .gateway
            .get_many("patients", OrderBy::desc("created_at"))
            .await
            .unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[tokio::test]
    async fn test_reads_fail_soft() {
        let fx = Fixture::new();
        seed(&fx.remote);
        fx.remote.set_offline(true);
        assert!(fx
            .gateway
            .get_many("patients", OrderBy::desc("created_at"))
            .await
            .unwrap()
            .is_empty());
        assert!(fx.gateway.get_one("patients", "a1").await.unwrap().is_none());
    }
}

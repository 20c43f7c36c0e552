//! Ties the stores to the session.
//!
//! A [`Coordinator`] builds one [`Stores`] per session and follows the
//! session's identity: every store is initialized on sign-in, cleaned up on
//! sign-out, and both on a switch between identities. Dropping the
//! coordinator cleans everything up.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::gateway::CollectionGateway;
use crate::identity::{OwnerId, Session};
use crate::registry::{InitReport, StoreRegistry, Stores};
use crate::remote::RemoteStore;
use crate::store::StoreConfig;

pub struct Coordinator {
    session: Session,
    stores: Stores,
    registry: StoreRegistry,
    watcher: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, session: Session, config: StoreConfig) -> Self {
        let gateway = CollectionGateway::new(remote, Arc::new(session.clone()));
        let stores = Stores::new(&gateway, config);
        let registry = stores.registry();
        Self {
            session,
            stores,
            registry,
            watcher: None,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Starts following the session. Stores are initialized right away if
    /// someone is already signed in. Calling this again restarts the watcher.
    pub fn start(&mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
        let registry = self.registry.clone();
        let identity = self.session.watch();
        self.watcher = Some(tokio::spawn(follow_identity(registry, identity)));
    }

    /// Signs in and initializes every store, returning once all of them
    /// have attempted their subscription. For one-shot callers that do not
    /// need [`Coordinator::start`].
    pub async fn open(&self, owner: impl Into<OwnerId>) -> InitReport {
        self.session.sign_in(owner);
        self.registry.initialize_all().await
    }

    /// Replays every store's queued writes, typically after the connection
    /// comes back. Returns how many reached the server.
    pub async fn reconnected(&self) -> usize {
        let synced = self.registry.retry_all().await;
        tracing::info!("Reconnected: {} queued write(s) synced", synced);
        synced
    }

    /// Stops following the session and cleans up every store.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
        self.registry.cleanup_all();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn follow_identity(registry: StoreRegistry, mut identity: watch::Receiver<Option<OwnerId>>) {
    let mut current = identity.borrow_and_update().clone();
    if let Some(owner) = &current {
        tracing::info!("Signed in as {}, initializing stores", owner);
        registry.initialize_all().await;
    }

    while identity.changed().await.is_ok() {
        let next = identity.borrow_and_update().clone();
        if next == current {
            continue;
        }
        if current.is_some() {
            tracing::info!("Identity changed, cleaning up stores");
            registry.cleanup_all();
        }
        if let Some(owner) = &next {
            tracing::info!("Signed in as {}, initializing stores", owner);
            registry.initialize_all().await;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Patient;
    use crate::remote::{Document, MemoryStore};
    use crate::testing::{fields, wait_until, OWNER};
    use serde_json::json;

    fn seeded() -> MemoryStore {
        let remote = MemoryStore::new();
        remote.insert_document(
            "patients",
            Document::new("a1", fields(json!({"owner_id": OWNER, "name": "Ada"}))),
        );
        remote.insert_document(
            "patients",
            Document::new("b1", fields(json!({"owner_id": "clinic-b", "name": "Bob"}))),
        );
        remote
    }

    fn names(coordinator: &Coordinator) -> Vec<String> {
        coordinator
            .stores()
            .patients
            .records()
            .into_iter()
            .map(|r| r.data.name)
            .collect()
    }

    #[tokio::test]
    async fn test_identity_switch_reinitializes_stores() {
        let remote = seeded();
        let session = Session::signed_in(OWNER);
        let mut coordinator =
            Coordinator::new(Arc::new(remote.clone()), session.clone(), StoreConfig::default());
        coordinator.start();

        assert!(wait_until(|| names(&coordinator) == vec!["Ada".to_string()]).await);

        session.sign_in("clinic-b");
        assert!(wait_until(|| names(&coordinator) == vec!["Bob".to_string()]).await);
        assert!(wait_until(|| remote.active_listeners("patients") == 1).await);

        session.sign_out();
        assert!(wait_until(|| !coordinator.stores().patients.is_initialized()).await);
        assert!(coordinator.stores().patients.is_empty());
    }

    #[tokio::test]
    async fn test_start_while_signed_out_waits_for_sign_in() {
        let remote = seeded();
        let session = Session::new();
        let mut coordinator =
            Coordinator::new(Arc::new(remote.clone()), session.clone(), StoreConfig::default());
        coordinator.start();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!coordinator.stores().patients.is_initialized());

        session.sign_in(OWNER);
        assert!(wait_until(|| names(&coordinator) == vec!["Ada".to_string()]).await);
    }

    #[tokio::test]
    async fn test_reconnected_replays_failed_writes() {
        let remote = MemoryStore::new();
        let coordinator = Coordinator::new(
            Arc::new(remote.clone()),
            Session::new(),
            StoreConfig::default(),
        );
        assert!(coordinator.open(OWNER).await.is_complete());
        let patients = coordinator.stores().patients.clone();
        patients.ready().await;

        remote.set_offline(true);
        let id = patients.add(Patient::new("Ada")).await.unwrap();
        assert!(id.is_pending());
        assert!(patients.records()[0].sync.is_flagged());

        remote.set_offline(false);
        assert_eq!(coordinator.reconnected().await, 1);
        assert!(wait_until(|| {
            let records = patients.records();
            records.len() == 1 && !records[0].is_pending() && !records[0].sync.is_flagged()
        })
        .await);
        assert_eq!(remote.documents("patients").len(), 1);
    }

    #[tokio::test]
    async fn test_drop_cleans_up_stores() {
        let remote = seeded();
        let coordinator = Coordinator::new(
            Arc::new(remote.clone()),
            Session::new(),
            StoreConfig::default(),
        );
        coordinator.open(OWNER).await;
        let patients = coordinator.stores().patients.clone();
        patients.ready().await;
        assert_eq!(patients.len(), 1);

        drop(coordinator);
        assert!(patients.is_empty());
        assert!(wait_until(|| remote.active_listeners("patients") == 0).await);
    }
}

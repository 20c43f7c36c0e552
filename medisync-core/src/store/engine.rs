use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, watch};

use super::merge::MergePolicy;
use super::pending::{PendingOp, PendingQueue};
use super::{NoticeKind, StoreConfig, SyncNotice};
use crate::error::{GatewayError, RemoteError, StoreError};
use crate::gateway::{CollectionGateway, Disposer};
use crate::models::{apply_patch, to_fields, Entity, Record, RecordId, SyncStatus};
use crate::order::Direction;
use crate::remote::{merge_fields, Document, Fields};

struct StoreState<E> {
    records: Vec<Record<E>>,
    is_loading: bool,
    is_initialized: bool,
    subscription: Option<Disposer>,
    /// Bumped by every cleanup; completions from an older epoch are dropped
    epoch: u64,
    pending: PendingQueue,
}

impl<E> StoreState<E> {
    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id.as_str() == id)
    }
}

struct Shared<E> {
    state: Mutex<StoreState<E>>,
    revision: watch::Sender<u64>,
    notices: broadcast::Sender<SyncNotice>,
}

impl<E: Entity> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, StoreState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn notify(&self, record_id: &str, kind: NoticeKind) {
        // No receivers is fine
        let _ = self.notices.send(SyncNotice {
            collection: E::COLLECTION,
            record_id: record_id.to_string(),
            kind,
        });
    }

    fn apply_snapshot(&self, epoch: u64, policy: MergePolicy, docs: Vec<Document>) {
        let incoming: Vec<Record<E>> = docs
            .into_iter()
            .filter_map(|doc| {
                let id = doc.id.clone();
                match Record::from_document(doc) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::warn!(
                            "Skipping malformed {} document {}: {}",
                            E::COLLECTION,
                            id,
                            e
                        );
                        None
                    }
                }
            })
            .collect();

        let count = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }
            let local = std::mem::take(&mut state.records);
            state.records = policy.merge(local, incoming);
            state.is_initialized = true;
            state.is_loading = false;
            state.records.len()
        };
        self.changed();
        tracing::debug!("Applied {} snapshot: {} record(s)", E::COLLECTION, count);
    }
}

/// Optimistic, reconciling store for one entity type.
///
/// Clones share the same state. The mutex guarding it is never held across
/// an await, so the local effect of each operation lands before its remote
/// call suspends.
pub struct EntityStore<E: Entity> {
    gateway: CollectionGateway,
    config: StoreConfig,
    shared: Arc<Shared<E>>,
}

impl<E: Entity> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            config: self.config,
            shared: Arc::clone(&self.shared),
        }
    }
}

fn invalid<E: Entity>(err: serde_json::Error) -> StoreError {
    StoreError::InvalidPatch {
        collection: E::COLLECTION.to_string(),
        reason: err.to_string(),
    }
}

/// Builds a retry patch from the current local values of the failed keys.
fn refresh_patch<E: Entity>(record: &Record<E>, failed: &Fields) -> Fields {
    let current = to_fields(&record.data).unwrap_or_default();
    failed
        .iter()
        .map(|(key, value)| {
            let value = current.get(key).cloned().unwrap_or_else(|| value.clone());
            (key.clone(), value)
        })
        .collect()
}

impl<E: Entity> EntityStore<E> {
    pub fn new(gateway: CollectionGateway, config: StoreConfig) -> Self {
        let (revision, _) = watch::channel(0);
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            gateway,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    records: Vec::new(),
                    is_loading: false,
                    is_initialized: false,
                    subscription: None,
                    epoch: 0,
                    pending: PendingQueue::new(),
                }),
                revision,
                notices,
            }),
        }
    }

    pub fn collection(&self) -> &'static str {
        E::COLLECTION
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribes to the owner's documents.
    ///
    /// Does nothing while the store is loading, initialized or subscribed.
    /// When no live query can be opened the store is still marked
    /// initialized (empty) and the error is returned for logging.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let epoch = {
            let mut state = self.shared.lock();
            if state.is_initialized || state.is_loading || state.subscription.is_some() {
                return Ok(());
            }
            state.is_loading = true;
            state.epoch
        };
        self.shared.changed();

        let weak = Arc::downgrade(&self.shared);
        let policy = self.config.merge_policy;
        let subscription = self
            .gateway
            .subscribe(E::COLLECTION, E::ORDER, move |docs| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_snapshot(epoch, policy, docs);
                }
            })
            .await;

        let error = {
            let mut state = self.shared.lock();
            if state.epoch != epoch {
                // Cleaned up while subscribing
                drop(state);
                subscription.disposer.dispose();
                return Ok(());
            }
            state.subscription = Some(subscription.disposer);
            match subscription.error {
                Some(err) => {
                    state.is_initialized = true;
                    state.is_loading = false;
                    err
                }
                None => return Ok(()),
            }
        };
        self.shared.changed();
        tracing::warn!("Initializing {} failed: {}", E::COLLECTION, error);
        Err(StoreError::Subscribe(error))
    }

    /// Waits until the first snapshot arrived or initialization failed.
    pub async fn ready(&self) {
        let mut rx = self.watch();
        while !self.is_initialized() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Adds a record.
    ///
    /// The record is visible immediately under a temporary id. Returns the
    /// confirmed id, or the temporary id when the create failed and was
    /// queued for retry.
    pub async fn add(&self, data: E) -> Result<RecordId, StoreError> {
        let fields = to_fields(&data).map_err(invalid::<E>)?;
        let temp_id = RecordId::temporary();
        let temp = temp_id.as_str().to_string();

        let epoch = {
            let mut state = self.shared.lock();
            let record = Record::pending(temp_id.clone(), self.gateway.identity(), data);
            match E::ORDER.direction {
                Direction::Descending => state.records.insert(0, record),
                Direction::Ascending => state.records.push(record),
            }
            state.epoch
        };
        self.shared.changed();

        let result = self.gateway.create(E::COLLECTION, fields.clone()).await;
        let confirmed = self.settle_create(epoch, &temp, fields, result, false).await;
        Ok(confirmed.unwrap_or(temp_id))
    }

    /// Reconciles a finished create. Returns the confirmed id on success.
    async fn settle_create(
        &self,
        epoch: u64,
        temp: &str,
        fields: Fields,
        result: Result<String, GatewayError>,
        retry: bool,
    ) -> Option<RecordId> {
        let id = match result {
            Ok(id) => id,
            Err(err) => {
                {
                    let mut state = self.shared.lock();
                    if state.epoch != epoch {
                        tracing::debug!(
                            "Discarding failed create of {} from an earlier session",
                            temp
                        );
                        return None;
                    }
                    state.pending.record_create(temp, fields);
                    if let Some(pos) = state.position(temp) {
                        state.records[pos].sync = SyncStatus::failed();
                    }
                }
                self.shared.changed();
                tracing::warn!(
                    "Create in {} failed, kept {} locally: {}",
                    E::COLLECTION,
                    temp,
                    err
                );
                if !retry {
                    self.shared.notify(temp, NoticeKind::SavedOffline);
                }
                return None;
            }
        };

        let deferred = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                tracing::debug!("Discarding create of {} from an earlier session", id);
                return Some(RecordId::Confirmed(id));
            }
            let deferred = state.pending.take(temp);
            let already_listed = state.position(&id).is_some();
            if let Some(pos) = state.position(temp) {
                if already_listed {
                    state.records.remove(pos);
                } else {
                    let record = &mut state.records[pos];
                    record.id = RecordId::Confirmed(id.clone());
                    record.sync = SyncStatus::default();
                }
            }
            deferred
        };
        self.shared.changed();
        tracing::debug!("Confirmed {} as {}/{}", temp, E::COLLECTION, id);
        if retry {
            self.shared.notify(&id, NoticeKind::Retried);
        }

        match deferred {
            Some(PendingOp::Update { fields }) => {
                self.send_deferred_update(epoch, &id, fields).await
            }
            Some(PendingOp::Delete) => {
                let result = self.gateway.delete(E::COLLECTION, &id).await;
                self.finish_delete(epoch, &id, None, result, false);
            }
            Some(PendingOp::Create { .. }) | None => {}
        }
        Some(RecordId::Confirmed(id))
    }

    async fn send_deferred_update(&self, epoch: u64, id: &str, patch: Fields) {
        let version = {
            let state = self.shared.lock();
            match state.position(id) {
                Some(pos) => state.records[pos].version,
                None => return,
            }
        };
        let result = self.gateway.update(E::COLLECTION, id, patch.clone()).await;
        self.finish_update(epoch, id, version, None, patch, result);
    }

    /// Applies a partial update.
    ///
    /// Unknown ids are ignored. A patch that doesn't produce a valid entity
    /// is rejected before anything changes.
    pub async fn update(&self, id: &str, patch: Fields) -> Result<(), StoreError> {
        let (epoch, previous, version, outgoing) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let Some(pos) = state.position(id) else {
                tracing::debug!("Ignoring update of unknown {}/{}", E::COLLECTION, id);
                return Ok(());
            };
            let data = apply_patch(&state.records[pos].data, patch.clone()).map_err(invalid::<E>)?;
            let queued_create = state.pending.has_create(id);
            let previous = state.records[pos].clone();

            let record = &mut state.records[pos];
            record.data = data;
            record.version += 1;
            if !queued_create {
                record.sync = SyncStatus::default();
            }
            let version = record.version;

            if previous.is_pending() {
                // Folded into the queued create, or sent once the create lands
                state.pending.record_update(id, patch);
                drop(guard);
                self.shared.changed();
                return Ok(());
            }

            // Editing a record whose delete failed keeps it
            if matches!(state.pending.get(id), Some(PendingOp::Delete)) {
                tracing::debug!("Edit of {}/{} cancels its queued delete", E::COLLECTION, id);
                state.pending.take(id);
            }

            let outgoing = match state.pending.take_update(id) {
                Some(mut queued) => {
                    merge_fields(&mut queued, patch);
                    queued
                }
                None => patch,
            };
            (state.epoch, previous, version, outgoing)
        };
        self.shared.changed();

        let result = self.gateway.update(E::COLLECTION, id, outgoing.clone()).await;
        self.finish_update(epoch, id, version, Some(previous), outgoing, result);
        Ok(())
    }

    fn finish_update(
        &self,
        epoch: u64,
        id: &str,
        version: u64,
        previous: Option<Record<E>>,
        outgoing: Fields,
        result: Result<(), GatewayError>,
    ) {
        let err = match result {
            Ok(()) => {
                let state = self.shared.lock();
                if state.epoch == epoch {
                    if let Some(pos) = state.position(id) {
                        if state.records[pos].version != version {
                            tracing::debug!(
                                "Update of {}/{} confirmed after newer local edits",
                                E::COLLECTION,
                                id
                            );
                        }
                    }
                }
                return;
            }
            Err(err) => err,
        };

        let kind = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                tracing::debug!("Discarding failed update of {} from an earlier session", id);
                return;
            }
            let Some(pos) = state.position(id) else {
                tracing::warn!(
                    "Update of {}/{} failed after it was removed: {}",
                    E::COLLECTION,
                    id,
                    err
                );
                return;
            };

            let current = &mut state.records[pos];
            if current.version == version {
                let kind = match previous {
                    Some(mut restored) => {
                        restored.sync = SyncStatus::failed();
                        restored.version = version + 1;
                        *current = restored;
                        NoticeKind::UpdateReverted
                    }
                    None => {
                        current.sync = SyncStatus::failed();
                        NoticeKind::SavedOffline
                    }
                };
                state.pending.record_update(id, outgoing);
                kind
            } else {
                let conflict = GatewayError::StaleWriteConflict {
                    collection: E::COLLECTION.to_string(),
                    record_id: id.to_string(),
                    expected: version,
                    current: current.version,
                };
                tracing::warn!("{}", conflict);
                current.sync = SyncStatus::failed();
                let refreshed = refresh_patch(current, &outgoing);
                state.pending.record_update(id, refreshed);
                NoticeKind::StaleCompletion
            }
        };
        self.shared.changed();
        tracing::warn!("Update of {}/{} failed: {}", E::COLLECTION, id, err);
        self.shared.notify(id, kind);
    }

    /// Deletes a record. Unknown ids are ignored.
    pub async fn delete(&self, id: &str) {
        let (epoch, removed) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let Some(pos) = state.position(id) else {
                tracing::debug!("Ignoring delete of unknown {}/{}", E::COLLECTION, id);
                return;
            };
            let removed = state.records.remove(pos);

            if removed.is_pending() {
                let cancelled = state.pending.record_delete(id);
                drop(guard);
                self.shared.changed();
                if cancelled {
                    tracing::debug!("Dropped unsynced {}/{}", E::COLLECTION, id);
                }
                return;
            }

            // The delete supersedes any queued update
            state.pending.take(id);
            (state.epoch, removed)
        };
        self.shared.changed();

        let result = self.gateway.delete(E::COLLECTION, id).await;
        self.finish_delete(epoch, id, Some(removed), result, false);
    }

    /// Returns true when the record is gone from the server.
    fn finish_delete(
        &self,
        epoch: u64,
        id: &str,
        removed: Option<Record<E>>,
        result: Result<(), GatewayError>,
        retry: bool,
    ) -> bool {
        let err = match result {
            Ok(())
            | Err(GatewayError::RemoteWrite {
                source: RemoteError::NotFound(_),
                ..
            }) => {
                {
                    let mut state = self.shared.lock();
                    if state.epoch != epoch {
                        return true;
                    }
                    state.records.retain(|r| r.id.as_str() != id);
                }
                self.shared.changed();
                if retry {
                    self.shared.notify(id, NoticeKind::Retried);
                }
                return true;
            }
            Err(err) => err,
        };

        {
            let mut state = self.shared.lock();
            if state.epoch != epoch {
                tracing::debug!("Discarding failed delete of {} from an earlier session", id);
                return false;
            }
            match (state.position(id), removed) {
                (Some(pos), _) => state.records[pos].sync = SyncStatus::failed(),
                (None, Some(mut record)) => {
                    record.sync = SyncStatus::failed();
                    state.records.push(record);
                }
                (None, None) => {}
            }
            state.pending.record_delete(id);
        }
        self.shared.changed();
        tracing::warn!("Delete of {}/{} failed: {}", E::COLLECTION, id, err);
        if !retry {
            self.shared.notify(id, NoticeKind::DeleteRestored);
        }
        false
    }

    /// Replays every queued write. Returns how many reached the server.
    ///
    /// Writes that fail again go back into the queue.
    pub async fn retry_pending(&self) -> usize {
        let (epoch, ops) = {
            let mut state = self.shared.lock();
            (state.epoch, state.pending.drain())
        };
        if ops.is_empty() {
            return 0;
        }
        tracing::info!("Retrying {} queued write(s) in {}", ops.len(), E::COLLECTION);

        let mut synced = 0;
        for (id, op) in ops {
            let stale = self.shared.lock().epoch != epoch;
            if stale {
                break;
            }
            let done = match op {
                PendingOp::Create { fields } => {
                    let result = self.gateway.create(E::COLLECTION, fields.clone()).await;
                    self.settle_create(epoch, &id, fields, result, true)
                        .await
                        .is_some()
                }
                PendingOp::Update { fields } => {
                    let result = self.gateway.update(E::COLLECTION, &id, fields.clone()).await;
                    self.finish_retried_update(epoch, &id, fields, result)
                }
                PendingOp::Delete => {
                    let result = self.gateway.delete(E::COLLECTION, &id).await;
                    self.finish_delete(epoch, &id, None, result, true)
                }
            };
            if done {
                synced += 1;
            }
        }
        synced
    }

    fn finish_retried_update(
        &self,
        epoch: u64,
        id: &str,
        patch: Fields,
        result: Result<(), GatewayError>,
    ) -> bool {
        let synced = result.is_ok();
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.epoch != epoch {
                return synced;
            }
            if let Err(err) = &result {
                tracing::warn!("Retry of {}/{} failed: {}", E::COLLECTION, id, err);
                state.pending.record_update(id, patch);
                if let Some(pos) = state.position(id) {
                    state.records[pos].sync = SyncStatus::failed();
                }
            } else if let Some(pos) = state.position(id) {
                let record = &mut state.records[pos];
                match apply_patch(&record.data, patch) {
                    Ok(data) => record.data = data,
                    Err(e) => {
                        tracing::warn!("Could not reapply {}/{} locally: {}", E::COLLECTION, id, e)
                    }
                }
                record.version += 1;
                record.sync = SyncStatus::default();
            }
        }
        self.shared.changed();
        if synced {
            self.shared.notify(id, NoticeKind::Retried);
        }
        synced
    }

    /// Disposes the subscription and resets the store to empty.
    ///
    /// Writes still in flight complete remotely but are not applied.
    pub fn cleanup(&self) {
        let disposer = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.records.clear();
            state.is_initialized = false;
            state.is_loading = false;
            state.pending.clear();
            state.subscription.take()
        };
        if let Some(disposer) = disposer {
            disposer.dispose();
        }
        self.shared.changed();
        tracing::debug!("Cleaned up {}", E::COLLECTION);
    }

    /// Snapshot of the current records, in display order.
    pub fn records(&self) -> Vec<Record<E>> {
        self.shared.lock().records.clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Record<E>> {
        let state = self.shared.lock();
        state.position(id).map(|pos| state.records[pos].clone())
    }

    /// Records whose domain field `field` equals `value`.
    pub fn filter_by(&self, field: &str, value: &Value) -> Vec<Record<E>> {
        self.select(|record| record.field(field).as_ref() == Some(value))
    }

    /// Records matching `predicate`, in display order.
    pub fn select(&self, predicate: impl Fn(&Record<E>) -> bool) -> Vec<Record<E>> {
        self.shared
            .lock()
            .records
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect()
    }

    /// Runs `f` over the current records without cloning them.
    pub fn with_records<R>(&self, f: impl FnOnce(&[Record<E>]) -> R) -> R {
        f(&self.shared.lock().records)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().records.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().is_initialized
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().is_loading
    }

    /// Number of queued writes awaiting retry.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Revision counter bumped on every state change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.shared.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Patient;
    use crate::remote::{AccessPolicy, MemoryStore};
    use crate::testing::{fields, wait_until, Fixture, OWNER};
    use serde_json::json;
    use std::time::Duration;

    fn store(fx: &Fixture) -> EntityStore<Patient> {
        EntityStore::new(fx.gateway.clone(), StoreConfig::default())
    }

    fn store_with(fx: &Fixture, merge_policy: MergePolicy) -> EntityStore<Patient> {
        EntityStore::new(
            fx.gateway.clone(),
            StoreConfig {
                merge_policy,
                ..StoreConfig::default()
            },
        )
    }

    fn seed(remote: &MemoryStore, id: &str, owner: &str, name: &str, created_at: &str) {
        remote.insert_document(
            "patients",
            Document::new(
                id,
                fields(json!({"owner_id": owner, "name": name, "created_at": created_at})),
            ),
        );
    }

    fn names(store: &EntityStore<Patient>) -> Vec<String> {
        store.records().into_iter().map(|r| r.data.name).collect()
    }

    async fn ready_store(fx: &Fixture) -> EntityStore<Patient> {
        let store = store(fx);
        store.initialize().await.unwrap();
        store.ready().await;
        store
    }

    /// Adds a patient online and waits until it is confirmed.
    async fn confirmed_patient(store: &EntityStore<Patient>, name: &str) -> String {
        let id = store.add(Patient::new(name)).await.unwrap();
        assert!(!id.is_pending());
        let id = id.as_str().to_string();
        assert!(wait_until(|| store.get_by_id(&id).is_some() && store.len() == 1).await);
        id
    }

    #[tokio::test]
    async fn test_initialize_loads_owned_records() {
        let fx = Fixture::new();
        seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
        seed(&fx.remote, "b1", "clinic-b", "Bob", "2025-01-02T00:00:00Z");
        seed(&fx.remote, "a2", OWNER, "Cy", "2025-01-03T00:00:00Z");

        let store = store(&fx);
        assert!(!store.is_initialized());
        store.initialize().await.unwrap();
        store.ready().await;

        assert!(store.is_initialized());
        assert!(!store.is_loading());
        assert_eq!(names(&store), vec!["Cy", "Ada"]);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let fx = Fixture::new();
        let store = store(&fx);

        let (first, second) = tokio::join!(store.initialize(), store.initialize());
        first.unwrap();
        second.unwrap();
        store.initialize().await.unwrap();
        store.ready().await;

        assert_eq!(fx.remote.active_listeners("patients"), 1);
    }

    #[tokio::test]
    async fn test_initialize_unauthenticated_marks_initialized() {
        let fx = Fixture::new();
        fx.session.sign_out();
        let store = store(&fx);

        let err = store.initialize().await.unwrap_err();
        assert_eq!(err, StoreError::Subscribe(GatewayError::Unauthenticated));
        assert!(store.is_initialized());
        assert!(!store.is_loading());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_add_confirms_with_server_id() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;

        let id = store.add(Patient::new("Ada")).await.unwrap();
        assert!(matches!(id, RecordId::Confirmed(_)));
        assert!(wait_until(|| store.len() == 1 && store.records()[0].id == id).await);

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert!(!records.iter().any(|r| r.is_pending()));
        assert!(!records[0].sync.is_flagged());
        assert_eq!(fx.remote.documents("patients")[0].id, id.as_str());
    }

    #[tokio::test]
    async fn test_add_is_visible_before_confirmation() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_latency(Duration::from_millis(50));

        let task = tokio::spawn({
            let store = store.clone();
            async move { store.add(Patient::new("Ada")).await }
        });
        assert!(wait_until(|| store.len() == 1).await);
        assert!(store.records()[0].is_pending());

        let id = task.await.unwrap().unwrap();
        assert!(
            wait_until(|| store.records().first().map(|r| r.id.clone()) == Some(id.clone())).await
        );
    }

    #[tokio::test]
    async fn test_add_failure_keeps_record_flagged() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let mut notices = store.notices();
        fx.remote.set_offline(true);

        let id = store.add(Patient::new("Ada")).await.unwrap();
        assert!(id.is_pending());

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].data.name, "Ada");
        assert!(records[0].sync.sync_error);
        assert!(records[0].sync.is_offline);
        assert_eq!(store.pending_len(), 1);

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.kind, NoticeKind::SavedOffline);
        assert_eq!(notice.record_id, id.as_str());
        assert_eq!(notice.message(), "Saved locally. Will retry when online.");
    }

    #[tokio::test]
    async fn test_add_order_follows_direction() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_offline(true);

        store.add(Patient::new("First")).await.unwrap();
        store.add(Patient::new("Second")).await.unwrap();
        assert_eq!(names(&store), vec!["Second", "First"]);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_noop() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let mut rx = store.watch();
        rx.borrow_and_update();

        store
            .update("missing", fields(json!({"name": "X"})))
            .await
            .unwrap();
        assert!(store.is_empty());
        assert!(!rx.has_changed().unwrap());
        assert!(fx.remote.documents("patients").is_empty());
    }

    #[tokio::test]
    async fn test_update_applies_and_syncs() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;

        store
            .update(&id, fields(json!({"phone": "555-0100"})))
            .await
            .unwrap();

        let record = store.get_by_id(&id).unwrap();
        assert_eq!(record.data.phone.as_deref(), Some("555-0100"));
        assert!(!record.sync.is_flagged());
        assert_eq!(
            fx.remote.documents("patients")[0].get("phone"),
            Some(&json!("555-0100"))
        );
    }

    #[tokio::test]
    async fn test_invalid_patch_is_rejected_without_effect() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;

        let err = store
            .update(&id, fields(json!({"name": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPatch { .. }));
        assert_eq!(names(&store), vec!["Ada"]);
    }

    #[tokio::test]
    async fn test_failed_update_reverts() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;
        let mut notices = store.notices();
        fx.remote.set_offline(true);

        store
            .update(&id, fields(json!({"name": "Ada Lovelace"})))
            .await
            .unwrap();

        let record = store.get_by_id(&id).unwrap();
        assert_eq!(record.data.name, "Ada");
        assert!(record.sync.sync_error && record.sync.is_offline);
        assert_eq!(store.pending_len(), 1);
        assert_eq!(notices.recv().await.unwrap().kind, NoticeKind::UpdateReverted);
    }

    #[tokio::test]
    async fn test_stale_failure_keeps_newer_edit() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;
        let mut notices = store.notices();

        // First edit stalls and then fails
        fx.remote.set_offline(true);
        fx.remote.set_latency(Duration::from_millis(100));
        let slow = tokio::spawn({
            let store = store.clone();
            let id = id.clone();
            async move { store.update(&id, fields(json!({"name": "B"}))).await }
        });
        assert!(wait_until(|| store.get_by_id(&id).unwrap().data.name == "B").await);

        // Second edit goes through while the first is in flight
        fx.remote.set_latency(Duration::ZERO);
        fx.remote.set_offline(false);
        store.update(&id, fields(json!({"name": "C"}))).await.unwrap();
        fx.remote.set_offline(true);

        slow.await.unwrap().unwrap();
        let kind = notices.recv().await.unwrap().kind;
        assert_eq!(kind, NoticeKind::StaleCompletion);

        let record = store.get_by_id(&id).unwrap();
        assert_eq!(record.data.name, "C");
        assert!(record.sync.is_flagged());

        // The retry carries the newest value, not the stale one
        fx.remote.set_offline(false);
        assert_eq!(store.retry_pending().await, 1);
        assert_eq!(fx.remote.documents("patients")[0].get("name"), Some(&json!("C")));
        assert!(!store.get_by_id(&id).unwrap().sync.is_flagged());
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;

        store.delete(&id).await;
        assert!(store.get_by_id(&id).is_none());
        assert!(fx.remote.documents("patients").is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_restores_flagged() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;
        let mut notices = store.notices();
        fx.remote.set_offline(true);

        store.delete(&id).await;

        let record = store.get_by_id(&id).unwrap();
        assert_eq!(record.data.name, "Ada");
        assert!(record.sync.sync_error);
        assert_eq!(notices.recv().await.unwrap().kind, NoticeKind::DeleteRestored);
    }

    #[tokio::test]
    async fn test_edit_after_failed_delete_keeps_record() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let id = confirmed_patient(&store, "Ada").await;

        fx.remote.set_offline(true);
        store.delete(&id).await;
        assert_eq!(store.pending_len(), 1);

        fx.remote.set_offline(false);
        store
            .update(&id, fields(json!({"phone": "555-0100"})))
            .await
            .unwrap();
        assert_eq!(store.pending_len(), 0);
        assert!(!store.get_by_id(&id).unwrap().sync.is_flagged());

        assert_eq!(store.retry_pending().await, 0);
        let record = store.get_by_id(&id).unwrap();
        assert_eq!(record.data.phone.as_deref(), Some("555-0100"));

        let docs = fx.remote.documents("patients");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("phone"), Some(&json!("555-0100")));
    }

    #[tokio::test]
    async fn test_delete_of_unsynced_record_stays_local() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_offline(true);
        let id = store.add(Patient::new("Ada")).await.unwrap();

        fx.remote.set_offline(false);
        store.delete(id.as_str()).await;

        assert!(store.is_empty());
        assert_eq!(store.pending_len(), 0);
        assert!(fx.remote.documents("patients").is_empty());
    }

    #[tokio::test]
    async fn test_update_of_unsynced_record_folds_into_create() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_offline(true);
        let id = store.add(Patient::new("Ada")).await.unwrap();

        store
            .update(id.as_str(), fields(json!({"phone": "555-0100"})))
            .await
            .unwrap();
        assert_eq!(store.pending_len(), 1);
        assert!(store.get_by_id(id.as_str()).unwrap().sync.is_flagged());

        fx.remote.set_offline(false);
        assert_eq!(store.retry_pending().await, 1);
        let docs = fx.remote.documents("patients");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("phone"), Some(&json!("555-0100")));
    }

    #[tokio::test]
    async fn test_update_during_inflight_create_is_sent_after_confirmation() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_latency(Duration::from_millis(50));

        let task = tokio::spawn({
            let store = store.clone();
            async move { store.add(Patient::new("Ada")).await }
        });
        assert!(wait_until(|| store.len() == 1).await);
        let temp = store.records()[0].id.as_str().to_string();
        store
            .update(&temp, fields(json!({"phone": "555-0100"})))
            .await
            .unwrap();

        let id = task.await.unwrap().unwrap();
        assert!(!id.is_pending());
        assert!(wait_until(|| {
            fx.remote
                .documents("patients")
                .first()
                .and_then(|d| d.get("phone").cloned())
                == Some(json!("555-0100"))
        })
        .await);
    }

    #[tokio::test]
    async fn test_snapshot_replaces_records() {
        let fx = Fixture::new();
        seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
        seed(&fx.remote, "a2", OWNER, "Cy", "2025-01-03T00:00:00Z");
        let store = ready_store(&fx).await;
        assert_eq!(store.len(), 2);

        let keep = fx
            .remote
            .documents("patients")
            .into_iter()
            .filter(|d| d.id == "a2")
            .collect();
        fx.remote.load_collection("patients", keep);

        assert!(wait_until(|| store.len() == 1).await);
        assert!(store.get_by_id("a1").is_none());
        assert_eq!(names(&store), vec!["Cy"]);
    }

    #[tokio::test]
    async fn test_server_wins_snapshot_erases_unsynced_record() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_offline(true);
        store.add(Patient::new("Offline")).await.unwrap();

        seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
        assert!(wait_until(|| store.get_by_id("a1").is_some()).await);
        assert_eq!(names(&store), vec!["Ada"]);
    }

    #[tokio::test]
    async fn test_retain_unsynced_keeps_flagged_record() {
        let fx = Fixture::new();
        let store = store_with(&fx, MergePolicy::RetainUnsynced);
        store.initialize().await.unwrap();
        store.ready().await;
        fx.remote.set_offline(true);
        store.add(Patient::new("Offline")).await.unwrap();

        seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
        assert!(wait_until(|| store.get_by_id("a1").is_some()).await);
        assert_eq!(names(&store), vec!["Ada", "Offline"]);
        assert!(store.records()[1].sync.is_flagged());
    }

    #[tokio::test]
    async fn test_fallback_store_scopes_by_owner() {
        for policy in [
            AccessPolicy::RejectFilteredAtSetup,
            AccessPolicy::RejectFilteredOnStream,
        ] {
            let fx = Fixture::with_policy(policy);
            seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
            seed(&fx.remote, "b1", "clinic-b", "Bob", "2025-01-02T00:00:00Z");

            let store = ready_store(&fx).await;
            assert_eq!(names(&store), vec!["Ada"]);

            store.add(Patient::new("Cy")).await.unwrap();
            assert!(wait_until(|| store.len() == 2).await);
            assert!(store
                .records()
                .iter()
                .all(|r| r.owner_id.as_ref().map(|o| o.as_str()) == Some(OWNER)));
        }
    }

    #[tokio::test]
    async fn test_cleanup_discards_inflight_add() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        fx.remote.set_latency(Duration::from_millis(50));

        let task = tokio::spawn({
            let store = store.clone();
            async move { store.add(Patient::new("Ada")).await }
        });
        assert!(wait_until(|| store.len() == 1).await);

        store.cleanup();
        task.await.unwrap().unwrap();

        assert!(store.is_empty());
        assert!(!store.is_initialized());
        assert!(wait_until(|| fx.remote.active_listeners("patients") == 0).await);
    }

    #[tokio::test]
    async fn test_cleanup_then_reinitialize() {
        let fx = Fixture::new();
        seed(&fx.remote, "a1", OWNER, "Ada", "2025-01-01T00:00:00Z");
        let store = ready_store(&fx).await;
        fx.remote.set_offline(true);
        store.add(Patient::new("Offline")).await.unwrap();

        store.cleanup();
        assert!(store.is_empty());
        assert_eq!(store.pending_len(), 0);
        assert!(wait_until(|| fx.remote.active_listeners("patients") == 0).await);

        store.initialize().await.unwrap();
        store.ready().await;
        assert_eq!(names(&store), vec!["Ada"]);
        assert_eq!(fx.remote.active_listeners("patients"), 1);
    }

    #[tokio::test]
    async fn test_retry_pending_replays_and_clears_flags() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let existing = confirmed_patient(&store, "Ada").await;
        let mut notices = store.notices();

        fx.remote.set_offline(true);
        let temp = store.add(Patient::new("Bob")).await.unwrap();
        store.delete(&existing).await;
        assert_eq!(store.pending_len(), 2);
        assert!(store.records().iter().all(|r| r.sync.is_flagged()));

        // Still offline: everything goes back in the queue
        assert_eq!(store.retry_pending().await, 0);
        assert_eq!(store.pending_len(), 2);

        fx.remote.set_offline(false);
        assert_eq!(store.retry_pending().await, 2);
        assert_eq!(store.pending_len(), 0);
        assert!(wait_until(|| store.len() == 1).await);

        let record = &store.records()[0];
        assert_eq!(record.data.name, "Bob");
        assert!(!record.is_pending());
        assert_ne!(record.id, temp);
        assert!(!record.sync.is_flagged());

        let docs = fx.remote.documents("patients");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("name"), Some(&json!("Bob")));

        let mut kinds = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            kinds.push(notice.kind);
        }
        assert_eq!(kinds.iter().filter(|k| **k == NoticeKind::Retried).count(), 2);
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let fx = Fixture::new();
        let store = ready_store(&fx).await;
        let mut rx = store.watch();
        rx.borrow_and_update();

        fx.remote.set_offline(true);
        store.add(Patient::new("Ada")).await.unwrap();
        assert!(rx.has_changed().unwrap());
    }
}

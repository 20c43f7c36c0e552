//! Fan-out over every entity store.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

use crate::error::StoreError;
use crate::gateway::CollectionGateway;
use crate::models::{
    Appointment, Attendance, Entity, Feedback, InventoryItem, Invoice, Patient, Report, Salary,
    Settings, Staff, UsageRecord,
};
use crate::store::{EntityStore, StoreConfig};

/// Lifecycle operations every store supports, independent of its entity type.
pub trait ManagedStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    fn cleanup(&self);

    /// Replays queued writes; resolves to how many reached the server.
    fn retry_pending(&self) -> BoxFuture<'_, usize>;

    fn is_initialized(&self) -> bool;
}

impl<E: Entity> ManagedStore for EntityStore<E> {
    fn name(&self) -> &'static str {
        E::COLLECTION
    }

    fn initialize(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        EntityStore::initialize(self).boxed()
    }

    fn cleanup(&self) {
        EntityStore::cleanup(self)
    }

    fn retry_pending(&self) -> BoxFuture<'_, usize> {
        EntityStore::retry_pending(self).boxed()
    }

    fn is_initialized(&self) -> bool {
        EntityStore::is_initialized(self)
    }
}

/// Outcome of [`StoreRegistry::initialize_all`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub initialized: Vec<&'static str>,
    pub failed: Vec<(&'static str, StoreError)>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Type-erased collection of stores.
#[derive(Default, Clone)]
pub struct StoreRegistry {
    stores: Vec<Arc<dyn ManagedStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: Arc<dyn ManagedStore>) {
        self.stores.push(store);
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stores.iter().map(|s| s.name()).collect()
    }

    /// Initializes every store concurrently. A failing store is logged and
    /// does not stop the others.
    pub async fn initialize_all(&self) -> InitReport {
        let results = join_all(self.stores.iter().map(|store| store.initialize())).await;

        let mut report = InitReport::default();
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(()) => report.initialized.push(store.name()),
                Err(e) => {
                    tracing::warn!("Failed to initialize {}: {}", store.name(), e);
                    report.failed.push((store.name(), e));
                }
            }
        }
        tracing::info!(
            "Initialized {} store(s), {} failed",
            report.initialized.len(),
            report.failed.len()
        );
        report
    }

    /// Cleans up every store.
    pub fn cleanup_all(&self) {
        for store in &self.stores {
            store.cleanup();
        }
        tracing::info!("Cleaned up {} store(s)", self.stores.len());
    }

    /// Replays queued writes in every store. Returns the total synced.
    pub async fn retry_all(&self) -> usize {
        join_all(self.stores.iter().map(|store| store.retry_pending()))
            .await
            .into_iter()
            .sum()
    }
}

/// One store per entity type, all sharing a gateway.
#[derive(Clone)]
pub struct Stores {
    pub patients: Arc<EntityStore<Patient>>,
    pub appointments: Arc<EntityStore<Appointment>>,
    pub invoices: Arc<EntityStore<Invoice>>,
    pub staff: Arc<EntityStore<Staff>>,
    pub inventory: Arc<EntityStore<InventoryItem>>,
    pub usage_records: Arc<EntityStore<UsageRecord>>,
    pub feedback: Arc<EntityStore<Feedback>>,
    pub attendance: Arc<EntityStore<Attendance>>,
    pub salaries: Arc<EntityStore<Salary>>,
    pub reports: Arc<EntityStore<Report>>,
    pub settings: Arc<EntityStore<Settings>>,
}

impl Stores {
    pub fn new(gateway: &CollectionGateway, config: StoreConfig) -> Self {
        fn store<E: Entity>(
            gateway: &CollectionGateway,
            config: StoreConfig,
        ) -> Arc<EntityStore<E>> {
            Arc::new(EntityStore::new(gateway.clone(), config))
        }

        Self {
            patients: store(gateway, config),
            appointments: store(gateway, config),
            invoices: store(gateway, config),
            staff: store(gateway, config),
            inventory: store(gateway, config),
            usage_records: store(gateway, config),
            feedback: store(gateway, config),
            attendance: store(gateway, config),
            salaries: store(gateway, config),
            reports: store(gateway, config),
            settings: store(gateway, config),
        }
    }

    /// A registry over every store.
    pub fn registry(&self) -> StoreRegistry {
        let stores: Vec<Arc<dyn ManagedStore>> = vec![
            self.patients.clone(),
            self.appointments.clone(),
            self.invoices.clone(),
            self.staff.clone(),
            self.inventory.clone(),
            self.usage_records.clone(),
            self.feedback.clone(),
            self.attendance.clone(),
            self.salaries.clone(),
            self.reports.clone(),
            self.settings.clone(),
        ];
        StoreRegistry { stores }
    }
}

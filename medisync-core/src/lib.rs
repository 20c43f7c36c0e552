//! MediSync Core Library
//!
//! Clinic entity models, an owner-scoped gateway over a remote document
//! store, and optimistic entity stores that keep user edits across failed
//! writes.

pub mod error;
pub mod gateway;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod order;
pub mod registry;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{GatewayError, RemoteError, StoreError};
pub use gateway::{CollectionGateway, Disposer, Subscription};
pub use identity::{IdentityProvider, IdentityState, OwnerId, Session};
pub use lifecycle::Coordinator;
pub use models::{
    Appointment, AppointmentStatus, Attendance, AttendanceStatus, Entity, Feedback, InventoryItem,
    Invoice, InvoiceItem, InvoiceStatus, Patient, Record, RecordId, Report, Salary, Settings,
    Staff, SyncStatus, UsageRecord,
};
pub use order::{Direction, OrderBy};
pub use registry::{InitReport, ManagedStore, StoreRegistry, Stores};
pub use remote::{AccessPolicy, Document, Fields, HttpStore, MemoryStore, Query, RemoteStore};
pub use store::{EntityStore, MergePolicy, NoticeKind, StoreConfig, SyncNotice};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}

use std::sync::Arc;

use clap::ValueEnum;
use medisync_core::{Coordinator, HttpStore, OwnerId, Session};

use crate::config::Config;

/// Runs `$body` with `$store` bound to the store of the given entity kind.
macro_rules! with_store {
    ($stores:expr, $kind:expr, |$store:ident| $body:expr) => {
        match $kind {
            EntityKind::Patients => {
                let $store = $stores.patients.clone();
                $body
            }
            EntityKind::Appointments => {
                let $store = $stores.appointments.clone();
                $body
            }
            EntityKind::Invoices => {
                let $store = $stores.invoices.clone();
                $body
            }
            EntityKind::Staff => {
                let $store = $stores.staff.clone();
                $body
            }
            EntityKind::Inventory => {
                let $store = $stores.inventory.clone();
                $body
            }
            EntityKind::UsageRecords => {
                let $store = $stores.usage_records.clone();
                $body
            }
            EntityKind::Feedback => {
                let $store = $stores.feedback.clone();
                $body
            }
            EntityKind::Attendance => {
                let $store = $stores.attendance.clone();
                $body
            }
            EntityKind::Salaries => {
                let $store = $stores.salaries.clone();
                $body
            }
            EntityKind::Reports => {
                let $store = $stores.reports.clone();
                $body
            }
            EntityKind::Settings => {
                let $store = $stores.settings.clone();
                $body
            }
        }
    };
}

mod config_cmd;
mod records;
mod watch;
mod whoami;

pub use config_cmd::ConfigCommand;
pub use records::RecordsCommand;
pub use watch::WatchCommand;
pub use whoami::WhoamiCommand;

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Entity collections reachable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EntityKind {
    Patients,
    Appointments,
    Invoices,
    Staff,
    Inventory,
    UsageRecords,
    Feedback,
    Attendance,
    Salaries,
    Reports,
    Settings,
}

/// Connects to the server and resolves the caller's owner id.
pub async fn connect(config: &Config) -> Result<(HttpStore, OwnerId), Box<dyn std::error::Error>> {
    let api_key = config.require_api_key()?;
    let remote = HttpStore::new(config.server_url.value.clone(), api_key)
        .with_snapshot_timeout(config.snapshot_timeout());
    let owner = remote
        .fetch_identity()
        .await
        .map_err(|e| format!("Cannot reach {}: {}", remote.server_url(), e))?;
    Ok((remote, owner))
}

/// Signs in and initializes every store.
pub async fn open_coordinator(config: &Config) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let (remote, owner) = connect(config).await?;
    tracing::debug!("Signed in as {}", owner);

    let coordinator = Coordinator::new(Arc::new(remote), Session::new(), config.store_config());
    let report = coordinator.open(owner).await;
    if !report.is_complete() {
        eprintln!(
            "Warning: {} collection(s) could not be loaded",
            report.failed.len()
        );
    }
    Ok(coordinator)
}

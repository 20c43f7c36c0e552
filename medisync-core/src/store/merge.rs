//! How a store combines its local records with an incoming snapshot.

use serde::{Deserialize, Serialize};

use crate::models::{Entity, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// The snapshot replaces local state outright, including records that
    /// are still pending or flagged
    #[default]
    ServerWins,
    /// Pending and flagged local records survive snapshots until they sync
    RetainUnsynced,
}

impl MergePolicy {
    /// Merges `snapshot` over `local`. The result is in snapshot order, with
    /// surviving local-only records appended in their previous order.
    pub fn merge<E: Entity>(
        &self,
        local: Vec<Record<E>>,
        snapshot: Vec<Record<E>>,
    ) -> Vec<Record<E>> {
        match self {
            MergePolicy::ServerWins => server_wins(&local, snapshot),
            MergePolicy::RetainUnsynced => retain_unsynced(local, snapshot),
        }
    }
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::ServerWins => write!(f, "server-wins"),
            MergePolicy::RetainUnsynced => write!(f, "retain-unsynced"),
        }
    }
}

impl std::str::FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "server-wins" => Ok(MergePolicy::ServerWins),
            "retain-unsynced" => Ok(MergePolicy::RetainUnsynced),
            _ => Err(format!(
                "Invalid merge policy '{}'. Valid options: server-wins, retain-unsynced",
                s
            )),
        }
    }
}

fn server_wins<E: Entity>(local: &[Record<E>], mut snapshot: Vec<Record<E>>) -> Vec<Record<E>> {
    // Versions are local bookkeeping and carry over to the replacement
    for record in &mut snapshot {
        if let Some(previous) = local.iter().find(|r| r.id == record.id) {
            record.version = previous.version;
        }
    }
    snapshot
}

fn retain_unsynced<E: Entity>(local: Vec<Record<E>>, snapshot: Vec<Record<E>>) -> Vec<Record<E>> {
    let mut merged: Vec<Record<E>> = snapshot
        .into_iter()
        .map(|incoming| match local.iter().find(|r| r.id == incoming.id) {
            Some(previous) if previous.sync.is_flagged() => previous.clone(),
            Some(previous) => Record {
                version: previous.version,
                ..incoming
            },
            None => incoming,
        })
        .collect();

    for record in local {
        let unsynced = record.is_pending() || record.sync.is_flagged();
        if unsynced && !merged.iter().any(|r| r.id == record.id) {
            merged.push(record);
        }
    }
    merged
}

use clap::Args;
use medisync_core::{Coordinator, Entity, EntityStore};
use tokio::sync::broadcast::error::RecvError;

use super::records::print_records;
use super::{EntityKind, OutputFormat};

/// Follow a collection live and reprint it on every change
#[derive(Args)]
pub struct WatchCommand {
    /// Collection to watch
    #[arg(value_enum)]
    pub entity: EntityKind,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl WatchCommand {
    pub async fn run(&self, coordinator: &Coordinator) -> Result<(), Box<dyn std::error::Error>> {
        let stores = coordinator.stores();
        with_store!(stores, self.entity, |store| watch_store(&store, self.format).await)
    }
}

async fn watch_store<E: Entity>(
    store: &EntityStore<E>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    store.ready().await;
    let mut changes = store.watch();
    changes.borrow_and_update();
    let mut notices = store.notices();

    print_records(&store.records(), format)?;
    eprintln!("Watching {} (Ctrl-C to stop)", E::COLLECTION);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                changes.borrow_and_update();
                println!();
                print_records(&store.records(), format)?;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => eprintln!("{}", notice),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} notice(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => break,
        }
    }
    Ok(())
}

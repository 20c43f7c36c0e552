//! MediSync Server
//!
//! Hosts the clinic's document collections behind a small REST and WebSocket
//! API for the `medisync` client.
//!
//! # Configuration
//!
//! Environment variables:
//! - `MEDISYNC_PORT`: Port to listen on (default: 8080)
//! - `MEDISYNC_DATA_DIR`: Directory to persist collections
//!   (default: ~/.local/share/medisync-server)
//! - `MEDISYNC_CONFIG`: Path to config file (default: ~/.config/medisync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     owner_id: "clinic-a"
//! rules:
//!   reject_filtered_queries: false
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /me`: Returns the caller's owner id
//! - `POST /collections/{c}/documents`: Create a document
//! - `GET|PATCH|DELETE /collections/{c}/documents/{id}`: Read, merge or delete a document
//! - `POST /collections/{c}/query`: One-shot query
//! - `GET /collections/{c}/listen`: WebSocket live query

mod config;
mod routes;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use medisync_core::MemoryStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{ApiKeyStore, Config, ConfigFile};
use routes::AppState;
use storage::CollectionStorage;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "medisync_server=info,medisync_core=info,tower_http=info".into()
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let file = ConfigFile::load(&config.config_path);
    let store = MemoryStore::with_policy(file.rules.access_policy());
    if file.rules.reject_filtered_queries {
        tracing::info!("Filtered queries are rejected by the rules");
    }

    let storage = CollectionStorage::new(&config.data_dir);
    match storage.load_all() {
        Ok(collections) => {
            for (name, docs) in collections {
                tracing::info!("Loaded {} document(s) into {}", docs.len(), name);
                store.load_collection(&name, docs);
            }
        }
        Err(e) => {
            tracing::error!("Failed to load persisted collections: {}", e);
            std::process::exit(1);
        }
    }

    let state = AppState {
        api_keys: Arc::new(ApiKeyStore::from_entries(file.api_keys)),
        store,
        storage: Some(storage),
    };
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

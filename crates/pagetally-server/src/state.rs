use std::sync::Arc;

use tracing::{info, warn};

use pagetally_core::clock::{Clock, SystemClock};
use pagetally_core::config::Config;
use pagetally_core::durable::DurableStore;
use pagetally_core::store::{MemoryStore, SharedStore};
use pagetally_duckdb::DuckDbBackend;

use crate::engine::Aggregator;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// The DuckDB backend, also the aggregator's durable store.
    pub db: Arc<DuckDbBackend>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,

    /// The aggregation engine. Owns the ingestion queue and the in-memory
    /// tables; handlers only submit events and read.
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    /// Wire the aggregator to DuckDB and an in-process shared store.
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        Self::with_parts(Arc::new(db), config, store, clock)
    }

    /// Build state around an explicit shared store and clock.
    pub fn with_parts(
        db: Arc<DuckDbBackend>,
        config: Config,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = Arc::new(config);
        let durable: Arc<dyn DurableStore> = db.clone();
        let aggregator = Aggregator::new(Arc::clone(&config), store, durable, clock);
        Self {
            db,
            config,
            aggregator,
        }
    }

    /// Make sure every domain listed in the configuration is registered for
    /// realtime snapshots.
    pub async fn register_configured_domains(&self) {
        for domain in &self.config.registered_domains {
            match self.db.register_domain(domain).await {
                Ok(()) => info!(domain = %domain, "Domain registered"),
                Err(e) => warn!(domain = %domain, error = %e, "Failed to register domain"),
            }
        }
    }
}

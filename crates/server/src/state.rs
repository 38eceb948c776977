//! Application state shared across handlers.

use crate::bus::Bus;
use crate::fleet::Fleet;
use crate::jobs::JobQueue;
use crate::notify::Notifier;
use otter_core::config::AppConfig;
use otter_metadata::MetadataStore;
use otter_signer::{ManifestSigner, Signer};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Registry, orchestrator and tracker.
    pub fleet: Fleet,
    /// Gateway command and progress bus.
    pub bus: Arc<dyn Bus>,
    /// Worker pool that runs rollout and tracking jobs.
    pub jobs: JobQueue,
}

impl AppState {
    /// Create the application state and start the job workers.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        signer: Option<ManifestSigner>,
        bus: Arc<dyn Bus>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("Invalid configuration: {}", error);
        }
        if signer.is_none() {
            tracing::warn!("No signing key configured; manifests cannot be published");
        }

        let signer = signer.map(|s| Arc::new(s) as Arc<dyn Signer>);
        let fleet = Fleet::new(&config, metadata.clone(), signer, bus.clone(), notifier);
        let jobs = JobQueue::start(fleet.clone(), &config.rollout);

        Self {
            config: Arc::new(config),
            metadata,
            fleet,
            bus,
            jobs,
        }
    }
}

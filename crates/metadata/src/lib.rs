//! Metadata store for the otter control plane.
//!
//! This crate persists:
//! - Release manifests, their signatures and rollout aggregates
//! - Per-gateway update rows and their state machine
//! - Gateway backup references and retention
//! - Tokens and the bootstrap admin marker
//! - CRITICAL escalations awaiting acknowledgement

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SqliteStore};

use otter_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    tracing::info!(path = %config.path.display(), "Opening SQLite metadata store");
    let store = SqliteStore::new(&config.path, config.query_timeout_secs).await?;
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}

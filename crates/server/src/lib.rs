//! Fleet update control plane.
//!
//! This crate provides:
//! - The manifest registry (authoring, signing, publication)
//! - The rollout orchestrator (target selection, dispatch, rollback)
//! - The progress tracker (state machine, escalation)
//! - The command/progress bus and the gateway REST mirror
//! - Operator endpoints (tokens, escalations)

pub mod auth;
pub mod background;
pub mod bootstrap;
pub mod bus;
pub mod context;
pub mod error;
pub mod fleet;
pub mod handlers;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tracker;

pub use auth::TraceId;
pub use bus::{Bus, MemoryBus};
pub use context::RequestContext;
pub use error::{ApiError, FleetError};
pub use fleet::Fleet;
pub use routes::create_router;
pub use state::AppState;

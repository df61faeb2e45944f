//! HTTP surface for the depot caching proxy.
//!
//! This crate wires the core subsystems to their external interfaces:
//! - resource read path with range support and live serving of in-progress
//!   downloads,
//! - the published registries index and the registry tracker behind it,
//! - operator endpoints (health, metrics, forget-failures),
//! - the `depotd` binary.

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod serve;
pub mod state;
pub mod tracker;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
pub use tracker::RegistryTracker;

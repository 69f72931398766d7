//! Vigil monitoring engine
//!
//! Probes a set of network endpoints on a fixed cycle, folds the results into
//! per-target state machines and publishes status changes on an event bus.

pub mod bus;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod limiter;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;
pub mod service;
pub mod shutdown;

pub use bus::{Event, EventBus, EventConsumer, EventKind, Subscription};
pub use config::Config;
pub use error::{EngineError, Result};
pub use orchestrator::{CategoryStats, CycleSummary, Orchestrator, OrchestratorStatus};
pub use service::{Store, VigilService};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReason, ShutdownReport};

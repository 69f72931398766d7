/// Monitoring engine module - probing targets and tracking their state
///
/// This module is responsible for:
/// - Executing HTTP/HTTPS/TCP/ICMP probes
/// - Retrying transient failures with backoff
/// - Folding probe results into per-target state machines
pub mod checker;
pub mod executor;
pub mod state;
pub mod types;
pub mod validation;

pub use checker::{NetworkProbe, Probe, ProbeError};
pub use executor::{ProbeRunner, RetryPolicy};
pub use state::{StatusChange, TargetMonitor, TargetState, TransitionPolicy};
pub use types::{ProbeResult, TargetStatus};

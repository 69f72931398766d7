use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use super::checker::{Probe, ProbeError};
use super::types::ProbeResult;

/// Exponential backoff between probe attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Randomize each delay into `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(63) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        let delay = Duration::from_millis(millis as u64);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            half + rand::thread_rng().gen_range(Duration::ZERO..=half)
        } else {
            delay
        }
    }
}

/// Runs probes with a per-attempt timeout and bounded retries
///
/// Never fails: every outcome, including a panicking probe, ends up in the
/// returned [`ProbeResult`].
#[derive(Clone)]
pub struct ProbeRunner {
    probe: Arc<dyn Probe>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ProbeRunner {
    pub fn new(probe: Arc<dyn Probe>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self { probe, timeout, retry }
    }

    pub async fn run(&self, key: &str, address: &str) -> ProbeResult {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.attempt(address).await {
                Ok(latency) => return ProbeResult::reachable(key, latency, Utc::now()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    debug!(target = %key, attempt, ?delay, error = %e, "Probe attempt failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => {
                    if e.is_fault() {
                        error!(target = %key, error = %e, "Probe faulted");
                    } else {
                        debug!(target = %key, attempt, error = %e, "Probe failed");
                    }
                    return ProbeResult::failed(key, e, Utc::now());
                }
            }
        }
    }

    async fn attempt(&self, address: &str) -> Result<Duration, ProbeError> {
        let call = AssertUnwindSafe(self.probe.probe(address, self.timeout)).catch_unwind();

        match timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(address, %message, "Probe panicked");
                Err(ProbeError::Fault(format!("probe panicked: {message}")))
            }
            Err(_) => Err(ProbeError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

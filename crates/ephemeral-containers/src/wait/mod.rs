//! Readiness strategies and the polling engine that drives them.
//!
//! A [`WaitStrategy`] looks at a [`WaitTarget`] once and returns a
//! [`Verdict`]. [`wait_until_ready`] repeats the check at the strategy's poll
//! interval until it is ready, fails for good, times out, or is cancelled.

mod composite;
mod http;
mod log;
mod port;

pub use composite::{AllOf, AnyOf, all_of, any_of};
pub use http::{HttpStrategy, for_http};
pub use log::{LogStrategy, for_log, for_log_regex};
pub use port::{PortStrategy, for_listening_port};

use crate::error::{Error, Result};
use async_trait::async_trait;
use container_runtime::{ContainerStatus, Port};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Poll interval used when a strategy does not set one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Startup timeout used when a strategy does not set one
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a single readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The condition holds
    Ready,
    /// Not yet; worth checking again
    Pending(String),
    /// The condition can never hold
    Failed(String),
}

/// What a strategy can observe about a container
#[async_trait]
pub trait WaitTarget: Send + Sync {
    /// Container id
    fn id(&self) -> &str;

    /// Host name the container's published ports are reachable on
    async fn host(&self) -> Result<String>;

    /// Host port bound to a container port such as `"80"` or `"80/tcp"`
    async fn mapped_port(&self, port: &str) -> Result<u16>;

    /// Container ports bound to a host port, lowest first
    async fn exposed_ports(&self) -> Result<Vec<Port>>;

    /// Current lifecycle status
    async fn status(&self) -> Result<ContainerStatus>;

    /// Everything the container logged so far
    async fn logs(&self) -> Result<Vec<u8>>;

    /// Drop cached state so the next call observes the runtime afresh
    fn reset_cache(&self);
}

/// A readiness condition
#[async_trait]
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Evaluate the condition once
    async fn check(&self, target: &dyn WaitTarget) -> Verdict;

    /// Delay between two checks
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Total time allowed before giving up
    fn startup_timeout(&self) -> Duration {
        DEFAULT_STARTUP_TIMEOUT
    }
}

/// Poll `strategy` against `target` until it is ready.
///
/// The first check runs immediately and every check sees fresh container
/// state. A check still running at the deadline is abandoned and counts as
/// pending. Errors:
/// - [`Error::Strategy`] as soon as a check reports [`Verdict::Failed`];
/// - [`Error::Timeout`] with the last pending reason once the startup timeout
///   has elapsed;
/// - [`Error::Cancelled`] when `cancel` fires, whether checking or sleeping.
pub async fn wait_until_ready(
    strategy: &dyn WaitStrategy,
    target: &dyn WaitTarget,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let interval = strategy.poll_interval();
    let deadline = started + strategy.startup_timeout();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        target.reset_cache();

        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            checked = timeout_at(deadline, strategy.check(target)) => match checked {
                Ok(verdict) => verdict,
                Err(_) => Verdict::Pending("check still running at the deadline".to_string()),
            },
        };

        match verdict {
            Verdict::Ready => {
                debug!(
                    container_id = %target.id(),
                    attempts,
                    elapsed = ?started.elapsed(),
                    "Container ready"
                );
                return Ok(());
            }
            Verdict::Failed(reason) => {
                debug!(
                    container_id = %target.id(),
                    attempts,
                    reason = %reason,
                    "Readiness check failed"
                );
                return Err(Error::Strategy(reason));
            }
            Verdict::Pending(reason) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout {
                        waited: now - started,
                        last: reason,
                    });
                }
                debug!(
                    container_id = %target.id(),
                    attempts,
                    reason = %reason,
                    "Container not ready yet"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep_until((now + interval).min(deadline)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hand-driven target for strategy tests
    #[derive(Debug)]
    pub struct FakeTarget {
        pub host: String,
        pub ports: Mutex<BTreeMap<Port, u16>>,
        pub status: Mutex<ContainerStatus>,
        pub logs: Mutex<String>,
        pub resets: AtomicUsize,
    }

    impl FakeTarget {
        pub fn running() -> Self {
            Self {
                host: "127.0.0.1".to_string(),
                ports: Mutex::new(BTreeMap::new()),
                status: Mutex::new(ContainerStatus::Running),
                logs: Mutex::new(String::new()),
                resets: AtomicUsize::new(0),
            }
        }

        pub fn map_port(&self, port: &str, host_port: u16) {
            self.ports
                .lock()
                .unwrap()
                .insert(port.parse().unwrap(), host_port);
        }

        pub fn set_status(&self, status: ContainerStatus) {
            *self.status.lock().unwrap() = status;
        }

        pub fn log(&self, line: &str) {
            self.logs.lock().unwrap().push_str(line);
        }
    }

    #[async_trait]
    impl WaitTarget for FakeTarget {
        fn id(&self) -> &str {
            "fake"
        }

        async fn host(&self) -> Result<String> {
            Ok(self.host.clone())
        }

        async fn mapped_port(&self, port: &str) -> Result<u16> {
            let query: container_runtime::PortQuery = port
                .parse()
                .map_err(|e: container_runtime::Error| Error::Configuration(e.to_string()))?;
            self.ports
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| query.matches(p))
                .map(|(_, host_port)| *host_port)
                .ok_or_else(|| Error::NotFound(format!("port {}", port)))
        }

        async fn exposed_ports(&self) -> Result<Vec<Port>> {
            Ok(self.ports.lock().unwrap().keys().copied().collect())
        }

        async fn status(&self) -> Result<ContainerStatus> {
            Ok(*self.status.lock().unwrap())
        }

        async fn logs(&self) -> Result<Vec<u8>> {
            Ok(self.logs.lock().unwrap().clone().into_bytes())
        }

        fn reset_cache(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }
}

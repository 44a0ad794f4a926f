//! Strategies built from other strategies

use super::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, Verdict, WaitStrategy, WaitTarget};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

fn min_interval(strategies: &[Arc<dyn WaitStrategy>]) -> Duration {
    strategies
        .iter()
        .map(|s| s.poll_interval())
        .min()
        .unwrap_or(DEFAULT_POLL_INTERVAL)
}

fn max_timeout(strategies: &[Arc<dyn WaitStrategy>]) -> Duration {
    strategies
        .iter()
        .map(|s| s.startup_timeout())
        .max()
        .unwrap_or(DEFAULT_STARTUP_TIMEOUT)
}

/// Ready when every strategy is ready, checked in order
#[derive(Debug, Clone)]
pub struct AllOf {
    strategies: Vec<Arc<dyn WaitStrategy>>,
    startup_timeout: Option<Duration>,
}

/// Combine strategies that must all hold
pub fn all_of(strategies: Vec<Arc<dyn WaitStrategy>>) -> AllOf {
    AllOf {
        strategies,
        startup_timeout: None,
    }
}

impl AllOf {
    /// Replace the combined timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl WaitStrategy for AllOf {
    async fn check(&self, target: &dyn WaitTarget) -> Verdict {
        for strategy in &self.strategies {
            match strategy.check(target).await {
                Verdict::Ready => continue,
                other => return other,
            }
        }
        Verdict::Ready
    }

    fn poll_interval(&self) -> Duration {
        min_interval(&self.strategies)
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or_else(|| max_timeout(&self.strategies))
    }
}

/// Ready when at least one strategy is ready
#[derive(Debug, Clone)]
pub struct AnyOf {
    strategies: Vec<Arc<dyn WaitStrategy>>,
    startup_timeout: Option<Duration>,
}

/// Combine strategies of which one is enough
pub fn any_of(strategies: Vec<Arc<dyn WaitStrategy>>) -> AnyOf {
    AnyOf {
        strategies,
        startup_timeout: None,
    }
}

impl AnyOf {
    /// Replace the combined timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl WaitStrategy for AnyOf {
    async fn check(&self, target: &dyn WaitTarget) -> Verdict {
        if self.strategies.is_empty() {
            return Verdict::Failed("any_of needs at least one strategy".to_string());
        }

        let mut reasons = Vec::with_capacity(self.strategies.len());
        let mut all_failed = true;
        for strategy in &self.strategies {
            match strategy.check(target).await {
                Verdict::Ready => return Verdict::Ready,
                Verdict::Pending(reason) => {
                    all_failed = false;
                    reasons.push(reason);
                }
                Verdict::Failed(reason) => reasons.push(reason),
            }
        }

        let reason = reasons.join("; ");
        if all_failed {
            Verdict::Failed(reason)
        } else {
            Verdict::Pending(reason)
        }
    }

    fn poll_interval(&self) -> Duration {
        min_interval(&self.strategies)
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or_else(|| max_timeout(&self.strategies))
    }
}

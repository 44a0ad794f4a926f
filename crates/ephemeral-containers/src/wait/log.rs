//! Wait for output in the container log

use super::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, Verdict, WaitStrategy, WaitTarget};
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn count(&self, text: &str) -> usize {
        match self {
            Pattern::Substring(needle) => text.matches(needle.as_str()).count(),
            Pattern::Regex(regex) => regex.find_iter(text).count(),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Pattern::Substring(needle) => needle,
            Pattern::Regex(regex) => regex.as_str(),
        }
    }
}

/// Ready once the log contains a pattern a given number of times
#[derive(Debug, Clone)]
pub struct LogStrategy {
    pattern: Pattern,
    occurrences: usize,
    poll_interval: Duration,
    startup_timeout: Duration,
}

/// Wait until `needle` appears in the log
pub fn for_log(needle: impl Into<String>) -> LogStrategy {
    LogStrategy::new(Pattern::Substring(needle.into()))
}

/// Wait until the log matches `pattern`
pub fn for_log_regex(pattern: &str) -> Result<LogStrategy> {
    let regex = Regex::new(pattern)
        .map_err(|e| Error::Configuration(format!("invalid log pattern '{}': {}", pattern, e)))?;
    Ok(LogStrategy::new(Pattern::Regex(regex)))
}

impl LogStrategy {
    fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            occurrences: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Require the pattern `occurrences` times, e.g. for images that restart
    /// once during initialization
    pub fn with_occurrence(mut self, occurrences: usize) -> Self {
        self.occurrences = occurrences.max(1);
        self
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the startup timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

#[async_trait]
impl WaitStrategy for LogStrategy {
    async fn check(&self, target: &dyn WaitTarget) -> Verdict {
        let logs = match target.logs().await {
            Ok(logs) => logs,
            Err(e) => return Verdict::Pending(format!("could not read logs: {}", e)),
        };

        let found = self.pattern.count(&String::from_utf8_lossy(&logs));
        if found >= self.occurrences {
            Verdict::Ready
        } else {
            Verdict::Pending(format!(
                "found {} of {} occurrences of '{}' in the log",
                found,
                self.occurrences,
                self.pattern.as_str()
            ))
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::testing::FakeTarget;

    #[tokio::test]
    async fn test_substring_occurrences() {
        let target = FakeTarget::running();
        let strategy = for_log("ready to accept connections").with_occurrence(2);

        target.log("database system is ready to accept connections\n");
        assert!(matches!(strategy.check(&target).await, Verdict::Pending(_)));

        target.log("restarting\ndatabase system is ready to accept connections\n");
        assert_eq!(strategy.check(&target).await, Verdict::Ready);
    }

    #[tokio::test]
    async fn test_regex_pattern() {
        let target = FakeTarget::running();
        let strategy = for_log_regex(r"listening on port \d+").unwrap();

        target.log("starting\n");
        assert!(matches!(strategy.check(&target).await, Verdict::Pending(_)));
        target.log("listening on port 6379\n");
        assert_eq!(strategy.check(&target).await, Verdict::Ready);
    }

    #[test]
    fn test_invalid_regex() {
        assert!(matches!(
            for_log_regex("(unclosed"),
            Err(Error::Configuration(_))
        ));
    }
}

//! Wait for a published port to accept TCP connections

use super::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT, Verdict, WaitStrategy, WaitTarget};
use async_trait::async_trait;
use container_runtime::{PortQuery, Protocol};
use std::time::Duration;
use tokio::net::TcpStream;

/// Ready once a TCP connection to the host side of a port succeeds
#[derive(Debug, Clone)]
pub struct PortStrategy {
    port: String,
    poll_interval: Duration,
    startup_timeout: Duration,
}

/// Wait until container port `port` (`"5432"` or `"5432/tcp"`) accepts connections
pub fn for_listening_port(port: impl Into<String>) -> PortStrategy {
    PortStrategy {
        port: port.into(),
        poll_interval: DEFAULT_POLL_INTERVAL,
        startup_timeout: DEFAULT_STARTUP_TIMEOUT,
    }
}

impl PortStrategy {
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
impl WaitStrategy for PortStrategy {
    async fn check(&self, target: &dyn WaitTarget) -> Verdict {
        let query = match self.port.parse::<PortQuery>() {
            Ok(query) => query,
            Err(e) => return Verdict::Failed(e.to_string()),
        };
        if query.protocol.is_some_and(|p| p != Protocol::Tcp) {
            return Verdict::Failed(format!("cannot probe non-TCP port {}", query));
        }

        match target.status().await {
            Ok(status) if status.is_terminal() => {
                return Verdict::Failed(format!("container is {}", status));
            }
            Ok(_) => {}
            Err(e) => return Verdict::Pending(e.to_string()),
        }

        let host = match target.host().await {
            Ok(host) => host,
            Err(e) => return Verdict::Pending(e.to_string()),
        };
        let host_port = match target.mapped_port(&self.port).await {
            Ok(port) => port,
            Err(e) => return Verdict::Pending(e.to_string()),
        };

        match TcpStream::connect((host.as_str(), host_port)).await {
            Ok(_) => Verdict::Ready,
            Err(e) => Verdict::Pending(format!(
                "{}:{} not accepting connections: {}",
                host, host_port, e
            )),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }
}

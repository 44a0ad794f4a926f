//! Client side of the reaper registration protocol

use crate::error::{Error, Result};
use container_reaper::{ACK, Filter};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// An open connection to a reaper.
///
/// The reaper treats the connection as the liveness signal of the session:
/// everything registered over it is swept once it closes, whether through
/// [`close`](Self::close), dropping the value, or the process dying.
#[derive(Debug)]
pub struct ReaperConnection {
    addr: String,
    ack_timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

fn registration_failed(reason: impl Into<String>) -> Error {
    Error::RegistrationFailed {
        reason: reason.into(),
    }
}

impl ReaperConnection {
    /// Connect to the reaper at `addr` (`host:port`)
    pub async fn connect(addr: &str, ack_timeout: Duration) -> Result<Self> {
        let stream = timeout(ack_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| registration_failed(format!("connecting to {} timed out", addr)))?
            .map_err(|e| registration_failed(format!("cannot connect to {}: {}", addr, e)))?;
        debug!(addr = %addr, "Connected to reaper");

        Ok(Self {
            addr: addr.to_string(),
            ack_timeout,
            stream: Mutex::new(Some(BufReader::new(stream))),
        })
    }

    /// Address of the reaper
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Register `filter` and wait for the acknowledgement.
    ///
    /// A connection that failed mid-registration is closed; later calls fail
    /// immediately.
    pub async fn register(&self, filter: &Filter) -> Result<()> {
        let line = filter
            .encode()
            .map_err(|e| registration_failed(e.to_string()))?;

        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(registration_failed(format!(
                "connection to {} is closed",
                self.addr
            )));
        };

        let exchange = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            let mut response = String::new();
            stream.read_line(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        let outcome = match timeout(self.ack_timeout, exchange).await {
            Ok(Ok(response)) if response == ACK => Ok(()),
            Ok(Ok(response)) if response.is_empty() => {
                Err(format!("{} closed the connection", self.addr))
            }
            Ok(Ok(response)) => Err(format!("unexpected response {:?}", response)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no acknowledgement within {:?}", self.ack_timeout)),
        };

        match outcome {
            Ok(()) => {
                debug!(addr = %self.addr, filter = %filter, "Registered with reaper");
                Ok(())
            }
            Err(reason) => {
                warn!(addr = %self.addr, reason = %reason, "Reaper registration failed");
                *guard = None;
                Err(registration_failed(reason))
            }
        }
    }

    /// Close the connection, letting the reaper start its grace period
    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.get_mut().shutdown().await;
            debug!(addr = %self.addr, "Closed reaper connection");
        }
    }
}

//! The reaper sidecar server.
//!
//! Test processes connect, register filters, and keep the connection open for
//! as long as they live. Once the last connection has dropped and no new one
//! arrived within the reconnection timeout, every registered filter is swept
//! and [`ReaperServer::run`] returns the report.

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::protocol::{ACK, Filter};
use crate::sweep::{SweepReport, sweep};
use container_runtime::ContainerRuntime;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Filters registered so far, shared between connection handlers
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    filters: Arc<Mutex<Vec<Filter>>>,
}

impl Registrations {
    /// Record a filter; registering the same filter twice keeps one copy
    pub fn add(&self, filter: Filter) -> bool {
        let mut filters = self.lock();
        if filters.contains(&filter) {
            return false;
        }
        filters.push(filter);
        true
    }

    /// Copy of every registered filter in registration order
    pub fn snapshot(&self) -> Vec<Filter> {
        self.lock().clone()
    }

    /// Number of distinct filters
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been registered yet
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Filter>> {
        self.filters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Where the server is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nobody connected yet; bounded by the connection timeout
    AwaitingFirstClient,
    /// At least one client holds a connection
    Connected(usize),
    /// All clients left; bounded by the reconnection timeout
    Draining,
}

/// A bound reaper server
#[derive(Debug)]
pub struct ReaperServer {
    listener: TcpListener,
    config: ReaperConfig,
    runtime: Arc<dyn ContainerRuntime>,
    registrations: Registrations,
    shutdown: CancellationToken,
}

impl ReaperServer {
    /// Bind the listen address from `config`
    pub async fn bind(config: ReaperConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "Reaper listening");
        Ok(Self {
            listener,
            config,
            runtime,
            registrations: Registrations::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the server actually listens on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops accepting clients and sweeps immediately when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Handle on the registered filters
    pub fn registrations(&self) -> Registrations {
        self.registrations.clone()
    }

    /// Serve clients until they are all gone, then sweep
    pub async fn run(self) -> Result<SweepReport> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SocketAddr>();
        let connections = CancellationToken::new();
        let mut phase = Phase::AwaitingFirstClient;
        let mut deadline = Instant::now() + self.config.connection_timeout;

        loop {
            let idle = !matches!(phase, Phase::Connected(_));
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        phase = match phase {
                            Phase::Connected(n) => Phase::Connected(n + 1),
                            _ => Phase::Connected(1),
                        };
                        info!(peer = %peer, phase = ?phase, "Client connected");

                        let registrations = self.registrations.clone();
                        let cancel = connections.child_token();
                        let events = events_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registrations, cancel).await {
                                warn!(peer = %peer, error = %e, "Connection closed with error");
                            }
                            let _ = events.send(peer);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(peer) = events_rx.recv() => {
                    phase = match phase {
                        Phase::Connected(n) if n > 1 => Phase::Connected(n - 1),
                        _ => {
                            deadline = Instant::now() + self.config.reconnection_timeout;
                            Phase::Draining
                        }
                    };
                    info!(peer = %peer, phase = ?phase, "Client disconnected");
                }
                _ = sleep_until(deadline), if idle => {
                    match phase {
                        Phase::AwaitingFirstClient => warn!(
                            timeout = ?self.config.connection_timeout,
                            "No client connected in time"
                        ),
                        _ => info!(
                            timeout = ?self.config.reconnection_timeout,
                            "No client reconnected, sweeping"
                        ),
                    }
                    break;
                }
            }
        }

        connections.cancel();
        drop(self.listener);

        let filters = self.registrations.snapshot();
        debug!(filters = filters.len(), "Starting sweep");
        let report = sweep(self.runtime.as_ref(), &filters).await;
        info!(
            removed = report.removed.len(),
            already_gone = report.already_gone.len(),
            failed = report.failed.len(),
            "Sweep finished"
        );
        Ok(report)
    }
}

/// Read registration lines until the client goes away.
///
/// Every filter is recorded before its `ACK` is written. A malformed line
/// closes the connection without an `ACK`, and so does a pending line once
/// the server is shutting down.
async fn handle_connection(
    stream: TcpStream,
    registrations: Registrations,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let filter = Filter::parse(&line)?;
        if registrations.add(filter.clone()) {
            info!(filter = %filter, "Registered filter");
        } else {
            debug!(filter = %filter, "Filter already registered");
        }
        writer.write_all(ACK.as_bytes()).await?;
    }

    Ok(())
}

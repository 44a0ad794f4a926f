//! Session reaper
//!
//! A small sidecar that removes the containers of a test run once the run
//! stops holding a connection to it. Test processes register filters over a
//! line protocol (see [`protocol`]); the server keeps the filters, watches the
//! connections, and sweeps through the [`ContainerRuntime`] after the last
//! client has been gone for the reconnection timeout.
//!
//! [`ContainerRuntime`]: container_runtime::ContainerRuntime

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod sweep;

pub use config::ReaperConfig;
pub use error::{Error, Result};
pub use protocol::{ACK, Filter, FilterKey};
pub use server::{ReaperServer, Registrations};
pub use sweep::{SweepFailure, SweepReport, sweep};

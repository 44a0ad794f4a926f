//! Ephemeral containers for tests
//!
//! Containers created through a [`DockerProvider`] belong to a session. Unless
//! a request opts out, the session is registered with a reaper before the
//! first container exists, and the reaper removes everything the session left
//! behind once the test process goes away, however it went away. The one gap
//! is a test process and reaper dying together: then nothing is swept.
//!
//! Starting a container blocks until its [`WaitStrategy`] reports it ready:
//!
//! ```no_run
//! use ephemeral_containers::wait::for_http;
//! use ephemeral_containers::{ContainerRequest, GenericContainerRequest, generic_container};
//!
//! # async fn demo() -> ephemeral_containers::Result<()> {
//! let nginx = generic_container(
//!     GenericContainerRequest::from(
//!         ContainerRequest::new("nginx:alpine")
//!             .with_exposed_port("80/tcp")
//!             .wait_for(for_http("/")),
//!     )
//!     .started(),
//! )
//! .await?;
//!
//! let url = nginx.port_endpoint("80/tcp", "http").await?;
//! # let _ = url;
//! nginx.terminate().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod background;
pub mod config;
pub mod container;
pub mod error;
pub mod generic;
pub mod host;
pub mod provider;
pub mod reaper;
pub mod request;
pub mod session;
pub mod wait;

pub use config::ProviderConfig;
pub use container::Container;
pub use error::{Error, Result};
pub use generic::{
    GenericContainerRequest, ProviderType, generic_container, generic_container_on, use_existing,
};
pub use provider::{ContainerProvider, DockerProvider};
pub use request::ContainerRequest;
pub use session::SessionId;
pub use wait::{Verdict, WaitStrategy, WaitTarget};

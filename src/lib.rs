//! A minimal Kubernetes ingress controller.
//!
//! The [`Server`] terminates HTTP and HTTPS and proxies every request to the
//! backend named by the current [`Snapshot`]. The [`watcher`] builds those
//! snapshots from the cluster and installs them with [`Server::update`],
//! which swaps the whole routing and certificate table at once.

#[macro_use]
extern crate log;

pub mod config;
pub mod debounce;
pub mod payload;
pub mod request;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod tls;
pub mod watcher;

pub use config::Config;
pub use payload::{IngressPayload, Payload};
pub use server::{Server, ServerError};
pub use snapshot::{BackendRef, HostRule, PathRule, Snapshot};

//! Client-side multiplexer and session manager for a transparent network
//! redirector.
//!
//! This crate owns the parts of the redirector that run unprivileged, in a
//! single process, on the machine whose traffic is being redirected:
//!
//! - the single duplex byte stream to a remote relay, over which many
//!   logical TCP connections, UDP flows, and DNS exchanges are statistically
//!   multiplexed on short integer channel IDs ([`mux`], [`wire`],
//!   [`channel`]);
//! - the dual-stack listening sockets that accept redirected traffic
//!   ([`listeners`]);
//! - the bidirectional byte pump tying an accepted socket to its mux channel
//!   ([`proxy`], [`wrapper`]);
//! - the access-control engine, reloaded live from an external pub/sub store
//!   ([`acl`]);
//! - the startup handshake with the relay and the privileged firewall
//!   helper, and the event loop that drives all of the above
//!   ([`session`], [`eventloop`], [`firewall`]).
//!
//! The privileged firewall helper process, the remote relay executable, and
//! the kernel packet-filter mechanism itself are external collaborators;
//! this crate speaks to the first two over the boundaries in [`firewall`]
//! and [`mux`]/[`session`], and never touches the third directly.
//!
//! # Example
//!
//! ```ignore
//! use rshuttle_core::{config::Config, session::Session, acl::AclTables};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> rshuttle_core::error::Result<()> {
//!     let config: Config = todo!("assembled from CLI args, see bins/rshuttle-client");
//!     let tables = Arc::new(AclTables::new());
//!     let session = Session::start(config, tables).await?;
//!     rshuttle_core::eventloop::run(session, None).await
//! }
//! ```

pub mod acl;
pub mod channel;
pub mod config;
pub mod error;
pub mod eventloop;
pub mod firewall;
pub mod listeners;
pub mod mux;
pub mod proxy;
pub mod session;
pub mod wire;
pub mod wrapper;

pub use error::{Error, Result};

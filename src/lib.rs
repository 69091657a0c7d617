//! A SOCKS5 tunnel over TLS
//!
//! ## Tunnel
//!
//! - Roles:
//!     - client: local SOCKS5 listener, carries each connection to the server
//!     - server: terminates TLS and runs the SOCKS5 protocol toward the target
//! - Transports:
//!     - raw: one TLS connection per tunnel, SOCKS5 runs on it directly
//!     - http: SOCKS5 negotiation travels over an HTTPS control endpoint,
//!       then the tunnel migrates to a raw TLS socket identified by a connection id
//! - Optional pre-shared secret on every raw socket
//! - Graceful shutdown with a bounded drain period
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socksbridge::{Config, Lifecycle, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("/etc/socksbridge.json".as_ref())?;
//!     let lifecycle = Lifecycle::new();
//!     Server::new(config, lifecycle.clone())?.run().await?;
//!     lifecycle.await_drain(std::time::Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod conn_id;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socks5;
pub mod transport;
pub mod vsock;

// Re-export main types at crate root for convenience
pub use auth::Authenticator;
pub use client::Client;
pub use config::{Config, Role, Transport};
pub use conn_id::ConnectionId;
pub use error::{AuthError, RegistryError, TunnelError};
pub use lifecycle::{DrainOutcome, Lifecycle};
pub use registry::ConnectionRegistry;
pub use server::Server;
pub use vsock::VirtualSocket;

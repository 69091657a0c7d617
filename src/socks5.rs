//! SOCKS5 server-side protocol driver
//!
//! - Features:
//!     - CONNECT with a bounded dial
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Runs over any async byte stream, so it can sit on a TLS socket or a virtual socket
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)

pub mod address;
pub mod auth;
pub mod commands;
pub mod driver;
pub mod protocol;

pub use auth::UserPass;
pub use driver::Socks5Driver;
pub use protocol::{AuthMethod, Command, ReplyCode, Version};

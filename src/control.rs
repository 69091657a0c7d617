//! HTTPS control endpoint carrying the SOCKS5 negotiation.
//!
//! `POST /connections` allocates a [`ConnectionId`](crate::conn_id::ConnectionId)
//! and starts a SOCKS5 driver on a pending virtual socket.
//! `POST /connections/exchange?conn_id=<id>` feeds the request body to that
//! driver and answers with the next chunk it wrote back.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::ControlClient;
pub use server::{ControlService, serve_http_connection};

pub const BEGIN_PATH: &str = "/connections";
pub const EXCHANGE_PATH: &str = "/connections/exchange";
pub const CONN_ID_PARAM: &str = "conn_id";

/// MAX_EXCHANGE_BODY caps a single exchange request body
pub const MAX_EXCHANGE_BODY: usize = 64 * 1024;

/// BeginResponse is the JSON body answering `POST /connections`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeginResponse {
    pub conn_id: String,
}

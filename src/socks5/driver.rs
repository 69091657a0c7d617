use crate::{
    relay::{RelayStats, relay},
    socks5::{auth::{self, UserPass}, commands},
};
use anyhow::{Result, bail};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// DEFAULT_DIAL_TIMEOUT bounds the CONNECT dial to a target
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Socks5Driver runs the server side of the SOCKS5 protocol over any
/// byte stream and then relays the tunnel to the dialed target
#[derive(Clone)]
pub struct Socks5Driver {
    auth_config: Option<Arc<UserPass>>,
    dial_timeout: Duration,
}

impl Socks5Driver {
    pub fn new() -> Self {
        Self {
            auth_config: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.auth_config = auth.map(Arc::new);
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// serve handles the full client/server SOCKS5 protocol flow on `stream`.
    /// Shutdown interrupts it at any point, negotiation included.
    pub async fn serve<S>(&self, mut stream: S, shutdown: &CancellationToken) -> Result<RelayStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let negotiate = async {
            // Negotiate authentication with client
            auth::negotiate_auth(&mut stream, self.auth_config.as_deref()).await?;

            // Handle connection request from client
            commands::handle_socks_request(&mut stream, self.dial_timeout).await
        };

        let outbound = tokio::select! {
            _ = shutdown.cancelled() => bail!("[ERR] SOCKS5 negotiation interrupted by shutdown"),
            outbound = negotiate => outbound?,
        };
        let target = outbound.peer_addr()?;

        // Proxy
        let stats = relay(stream, outbound, shutdown).await;

        // DEBUG
        info!(
            target = %target,
            "connection closed: {} bytes from client, {} bytes from server",
            stats.a_to_b, stats.b_to_a
        );

        Ok(stats)
    }
}

impl Default for Socks5Driver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        net::TcpListener,
    };

    #[tokio::test]
    async fn test_serve_proxies_to_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let echo = tokio::spawn(async move {
            let (mut conn, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let (mut client, server) = duplex(1024);
        let shutdown = CancellationToken::new();
        let driver = Socks5Driver::new();
        let token = shutdown.clone();
        let serve = tokio::spawn(async move { driver.serve(server, &token).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&port.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        echo.await.unwrap();
        drop(client);
        let stats = serve.await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 5);
        assert_eq!(stats.b_to_a, 5);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_negotiation() {
        // A client that connects and never says anything
        let (_client, server) = duplex(1024);
        let shutdown = CancellationToken::new();
        let driver = Socks5Driver::new();
        let token = shutdown.clone();
        let serve = tokio::spawn(async move { driver.serve(server, &token).await });

        shutdown.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_err());
    }
}

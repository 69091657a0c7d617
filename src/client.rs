use crate::{
    auth::{AUTH_SUCCESS, AUTH_TIMEOUT, Authenticator},
    config::{Config, Transport},
    conn_id::ConnectionId,
    control::ControlClient,
    error::{AuthError, Result as TunnelResult, TunnelError},
    lifecycle::Lifecycle,
    relay::{RELAY_BUFFER_SIZE, RelayStats, relay},
    transport::{self, AsyncStream, HTTP_ALPN},
    vsock::is_negotiation_reply,
};
use anyhow::{Context as _, Result};
use bytes::{Bytes, BytesMut};
use rustls::pki_types::ServerName;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How long the negotiation pump waits for the local client's next request
/// before polling the driver for a reply it may already have
const LOCAL_GRACE: Duration = Duration::from_millis(200);

/// Client is the entry side of the tunnel: it accepts local SOCKS5 clients
/// and carries each one to the server
pub struct Client {
    config: Config,
    lifecycle: Lifecycle,
    dialer: Arc<Dialer>,
}

/// Dialer holds everything a tunnel needs to reach the server
struct Dialer {
    transport: Transport,
    server_addr: String,
    http_addr: Option<String>,
    raw_connector: TlsConnector,
    http_connector: TlsConnector,
    server_name: ServerName<'static>,
    authenticator: Option<Authenticator>,
    dial_timeout: Duration,
    keepalive: Duration,
    lifecycle: Lifecycle,
}

impl Client {
    /// new is a constructor for the Client type
    pub fn new(config: Config, lifecycle: Lifecycle) -> Result<Self> {
        let ca = config.server_ca.as_deref();
        let raw_connector = transport::build_tls_connector(ca, config.insecure_skip_verify, &[])?;
        let http_connector =
            transport::build_tls_connector(ca, config.insecure_skip_verify, &[HTTP_ALPN])?;
        let server_name = transport::server_name(config.tls_server_name())?;
        let authenticator = config.password.as_deref().map(Authenticator::new).transpose()?;

        let dialer = Dialer {
            transport: config.transport,
            server_addr: config.server_addr.clone(),
            http_addr: config.http_addr.clone(),
            raw_connector,
            http_connector,
            server_name,
            authenticator,
            dial_timeout: config.dial_timeout(),
            keepalive: config.keepalive_period(),
            lifecycle: lifecycle.clone(),
        };

        Ok(Self {
            config,
            lifecycle,
            dialer: Arc::new(dialer),
        })
    }

    /// run accepts local SOCKS5 clients until shutdown is signalled
    pub async fn run(self) -> Result<()> {
        let client_addr = self
            .config
            .client_addr
            .as_deref()
            .context("[ERR] client_addr cannot be empty")?;
        let listener = transport::bind_listener(client_addr, "socks5").await?;

        // DEBUG
        info!("tunneling to {} over {:?} transport", self.config.server_addr, self.config.transport);

        let token = self.lifecycle.token();
        let dialer = self.dialer.clone();
        transport::accept_loop(
            listener,
            self.lifecycle.clone(),
            self.config.keepalive_period(),
            "socks5",
            move |local, peer_addr| {
                let dialer = dialer.clone();
                let token = token.clone();
                async move {
                    // DEBUG
                    debug!("new client: {}", peer_addr);

                    match dialer.tunnel(local, &token).await {
                        Ok(stats) => debug!(
                            peer = %peer_addr,
                            "connection closed: {} bytes sent, {} bytes received",
                            stats.a_to_b, stats.b_to_a
                        ),
                        Err(e) => error!(peer = %peer_addr, "connection error: {e:#}"),
                    }
                }
            },
        )
        .await;

        // DEBUG
        info!("stopping proxy {client_addr}");
        Ok(())
    }
}

impl Dialer {
    async fn tunnel(&self, local: TcpStream, shutdown: &CancellationToken) -> Result<RelayStats> {
        match self.transport {
            Transport::Raw => self.tunnel_raw(local, shutdown).await,
            Transport::Http => self.tunnel_http(local, shutdown).await,
        }
    }

    /// tunnel_raw carries the local client over one authenticated TLS socket
    async fn tunnel_raw(&self, local: TcpStream, shutdown: &CancellationToken) -> Result<RelayStats> {
        let mut remote = self.dial(&self.raw_connector, &self.server_addr).await?;
        if let Some(auth) = &self.authenticator {
            auth.initiate(&mut remote).await?;
        }
        Ok(relay(local, remote, shutdown).await)
    }

    /// tunnel_http negotiates SOCKS5 through the control endpoint, then moves
    /// the tunnel to a raw TLS socket
    async fn tunnel_http(
        &self,
        mut local: TcpStream,
        shutdown: &CancellationToken,
    ) -> Result<RelayStats> {
        let http_addr = self
            .http_addr
            .as_deref()
            .context("[ERR] http_addr is required for the http transport")?;

        let control_stream = self.dial(&self.http_connector, http_addr).await?;
        let mut control =
            ControlClient::connect(control_stream, http_addr, &self.lifecycle).await?;
        let id = control.begin().await?;

        // DEBUG
        debug!(conn_id = %id, "negotiating over control endpoint");

        let Some(early) = pump_negotiation(&mut local, &mut control, id, shutdown).await? else {
            debug!(conn_id = %id, "negotiation ended before completion");
            return Ok(RelayStats::default());
        };
        drop(control);

        let raw = self.dial(&self.raw_connector, &self.server_addr).await?;
        let mut raw = handoff(raw, id, self.authenticator.as_ref()).await?;

        // Data the application sent right behind its CONNECT request
        if !early.is_empty() {
            raw.write_all(&early).await?;
        }

        // DEBUG
        debug!(conn_id = %id, "tunnel migrated to raw socket");
        Ok(relay(local, raw, shutdown).await)
    }

    async fn dial(&self, connector: &TlsConnector, addr: &str) -> Result<TlsStream<TcpStream>> {
        transport::dial_tls(
            connector,
            addr,
            self.server_name.clone(),
            self.dial_timeout,
            self.keepalive,
        )
        .await
        .with_context(|| format!("[ERR] failed to dial {addr}"))
    }
}

/// pump_negotiation shuttles local SOCKS5 bytes through exchange calls and
/// writes every reply back to the local client.
///
/// Bytes the local client sends while an exchange is in flight are queued
/// for the next one, so a request split across segments still reaches the
/// driver. An empty reply is answered with another exchange right away.
/// Every wait, exchanges included, gives way to shutdown.
///
/// Returns the bytes read past the negotiation once a reply carries the
/// negotiation-complete marker, or `None` if the local client went away or
/// shutdown was signalled first.
pub async fn pump_negotiation<L>(
    local: &mut L,
    control: &mut ControlClient,
    id: ConnectionId,
    shutdown: &CancellationToken,
) -> TunnelResult<Option<Bytes>>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut pending = BytesMut::new();
    let mut local_open = true;
    let mut awaiting_local = true;
    let mut replied = false;

    loop {
        // The driver answered last time, so its next move needs local input.
        // A client that pipelined its requests has a reply waiting instead,
        // which an empty exchange collects once the grace period passes.
        if awaiting_local && pending.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                read = local.read(&mut buf) => match read? {
                    0 => return Ok(None),
                    n => pending.extend_from_slice(&buf[..n]),
                },
                _ = tokio::time::sleep(LOCAL_GRACE), if replied => {}
            }
        }

        let exchange = control.exchange(id, pending.split().freeze());
        tokio::pin!(exchange);

        let reply = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                reply = &mut exchange => break reply?,
                read = local.read(&mut buf), if local_open => match read? {
                    0 => local_open = false,
                    n => pending.extend_from_slice(&buf[..n]),
                },
            }
        };

        if reply.is_empty() {
            // The driver may be waiting on more input or still dialing
            if !local_open && pending.is_empty() {
                debug!(conn_id = %id, "local client closed during negotiation");
                return Ok(None);
            }
            awaiting_local = false;
            continue;
        }

        local.write_all(&reply).await?;
        local.flush().await?;
        replied = true;

        if is_negotiation_reply(&reply) {
            return Ok(Some(pending.freeze()));
        }
        awaiting_local = local_open;
    }
}

/// handoff announces `id` on a fresh raw socket and waits for the server's
/// one-byte acknowledgement
pub async fn handoff<S>(
    mut raw: S,
    id: ConnectionId,
    authenticator: Option<&Authenticator>,
) -> TunnelResult<S>
where
    S: AsyncStream,
{
    if let Some(auth) = authenticator {
        auth.initiate(&mut raw).await?;
    }

    raw.write_all(id.as_bytes()).await?;
    raw.flush().await?;

    let mut ack = [0u8; 1];
    tokio::time::timeout(AUTH_TIMEOUT, raw.read_exact(&mut ack))
        .await
        .map_err(|_| AuthError::Timeout)??;

    if ack[0] != AUTH_SUCCESS {
        return Err(TunnelError::Protocol(format!(
            "unexpected handoff acknowledgement {:#04x}",
            ack[0]
        )));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handoff_sends_id_and_reads_ack() {
        let (client, mut server) = duplex(64);
        let id = ConnectionId::new();

        let server_side = tokio::spawn(async move {
            let mut raw_id = [0u8; 16];
            server.read_exact(&mut raw_id).await.unwrap();
            server.write_all(&[AUTH_SUCCESS]).await.unwrap();
            (raw_id, server)
        });

        let _raw = handoff(client, id, None).await.unwrap();
        let (raw_id, _server) = server_side.await.unwrap();
        assert_eq!(&raw_id, id.as_bytes());
    }

    #[tokio::test]
    async fn test_handoff_without_ack_fails() {
        let (client, mut server) = duplex(64);

        let server_side = tokio::spawn(async move {
            let mut raw_id = [0u8; 16];
            server.read_exact(&mut raw_id).await.unwrap();
            // Dropped without acknowledging
        });

        let res = handoff(client, ConnectionId::new(), None).await;
        server_side.await.unwrap();
        assert!(matches!(res, Err(TunnelError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_ack_timeout() {
        let (client, _server) = duplex(64);
        let res = handoff(client, ConnectionId::new(), None).await;
        assert!(matches!(res, Err(TunnelError::Auth(AuthError::Timeout))));
    }
}

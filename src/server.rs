use crate::{
    auth::{AUTH_SUCCESS, AUTH_TIMEOUT, Authenticator},
    config::{Config, Transport},
    conn_id::{CONN_ID_LEN, ConnectionId},
    control::{ControlService, serve_http_connection},
    error::{AuthError, Result as TunnelResult, TunnelError, is_peer_closed},
    lifecycle::Lifecycle,
    registry::ConnectionRegistry,
    socks5::Socks5Driver,
    transport::{self, AsyncStream, HTTP_ALPN},
};
use anyhow::{Context as _, Result, anyhow};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server is the exit side of the tunnel: it terminates TLS and runs the
/// SOCKS5 driver, either directly on each raw connection or behind the
/// HTTPS control endpoint
pub struct Server {
    config: Config,
    lifecycle: Lifecycle,
    registry: ConnectionRegistry,
    driver: Socks5Driver,
    authenticator: Option<Authenticator>,
}

impl Server {
    /// new is a constructor for the Server type
    pub fn new(config: Config, lifecycle: Lifecycle) -> Result<Self> {
        let authenticator = config.password.as_deref().map(Authenticator::new).transpose()?;

        let auth = config.socks5_credentials();
        if auth.is_some() {
            info!("SOCKS5 username/password authentication enabled");
        }
        let driver = Socks5Driver::new()
            .with_auth(auth)
            .with_dial_timeout(config.dial_timeout());

        let registry = ConnectionRegistry::new().with_bind_timeout(config.bind_timeout());

        Ok(Self {
            config,
            lifecycle,
            registry,
            driver,
            authenticator,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// run binds the listeners and serves until shutdown is signalled.
    /// In-flight connections are left to the lifecycle's drain.
    pub async fn run(self) -> Result<()> {
        let (cert, key) = match (&self.config.server_cert, &self.config.server_key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => return Err(anyhow!("[ERR] server_cert and server_key are required")),
        };
        let keepalive = self.config.keepalive_period();

        let raw_acceptor = transport::load_tls_acceptor(cert, key, &[])?;
        let raw_listener = transport::bind_listener(&self.config.server_addr, "raw").await?;

        match self.config.transport {
            Transport::Raw => {
                let conn = RawConn {
                    acceptor: raw_acceptor,
                    authenticator: self.authenticator.clone(),
                    token: self.lifecycle.token(),
                };
                let driver = self.driver.clone();

                transport::accept_loop(
                    raw_listener,
                    self.lifecycle.clone(),
                    keepalive,
                    "raw",
                    move |stream, peer_addr| {
                        let conn = conn.clone();
                        let driver = driver.clone();
                        async move { conn.serve_socks5(stream, peer_addr, &driver).await }
                    },
                )
                .await;
            }
            Transport::Http => {
                let http_addr = self
                    .config
                    .http_addr
                    .as_deref()
                    .context("[ERR] http_addr is required for the http transport")?;
                let http_acceptor = transport::load_tls_acceptor(cert, key, &[HTTP_ALPN])?;
                let http_listener = transport::bind_listener(http_addr, "control").await?;

                let service = ControlService::new(
                    self.registry.clone(),
                    self.lifecycle.clone(),
                    self.driver.clone(),
                )
                .with_exchange_timeout(self.config.exchange_timeout());

                let control_loop = transport::accept_loop(
                    http_listener,
                    self.lifecycle.clone(),
                    keepalive,
                    "control",
                    move |stream, peer_addr| {
                        let acceptor = http_acceptor.clone();
                        let service = service.clone();
                        async move {
                            match tls_accept(&acceptor, stream).await {
                                Ok(tls) => serve_http_connection(tls, service, peer_addr).await,
                                Err(e) => debug!(peer = %peer_addr, "control TLS handshake failed: {e}"),
                            }
                        }
                    },
                );

                let registry = self.registry.clone();
                let authenticator = self.authenticator.clone();
                let raw_loop = transport::accept_loop(
                    raw_listener,
                    self.lifecycle.clone(),
                    keepalive,
                    "raw",
                    move |stream, peer_addr| {
                        let acceptor = raw_acceptor.clone();
                        let registry = registry.clone();
                        let authenticator = authenticator.clone();
                        async move {
                            let tls = match tls_accept(&acceptor, stream).await {
                                Ok(tls) => tls,
                                Err(e) => {
                                    debug!(peer = %peer_addr, "raw TLS handshake failed: {e}");
                                    return;
                                }
                            };
                            match find_bound_socket(tls, peer_addr, &registry, authenticator.as_ref()).await {
                                Ok(id) => debug!(conn_id = %id, peer = %peer_addr, "raw socket bound"),
                                Err(e) => error!(peer = %peer_addr, "failed to bind raw socket: {e}"),
                            }
                        }
                    },
                );

                tokio::join!(control_loop, raw_loop);
            }
        }

        // DEBUG
        info!("stopping proxy {}", self.config.server_addr);
        Ok(())
    }
}

/// RawConn carries what a raw-mode connection needs
#[derive(Clone)]
struct RawConn {
    acceptor: TlsAcceptor,
    authenticator: Option<Authenticator>,
    token: CancellationToken,
}

impl RawConn {
    /// serve_socks5 runs TLS, the optional shared-secret check and the
    /// SOCKS5 driver on one raw connection
    async fn serve_socks5(&self, stream: TcpStream, peer_addr: SocketAddr, driver: &Socks5Driver) {
        // DEBUG
        info!("new client: {}", peer_addr);

        let mut tls = match tls_accept(&self.acceptor, stream).await {
            Ok(tls) => tls,
            Err(e) => {
                debug!(peer = %peer_addr, "TLS handshake failed: {e}");
                return;
            }
        };

        if let Some(auth) = &self.authenticator {
            if let Err(e) = auth.respond(&mut tls).await {
                warn!(peer = %peer_addr, "authentication failed: {e}");
                return;
            }
        }

        if let Err(e) = driver.serve(tls, &self.token).await {
            log_driver_error(peer_addr, &e);
        }
    }
}

/// find_bound_socket reads the connection id off a raw socket, acknowledges
/// it and hands the socket to the waiting virtual socket.
///
/// Unknown or malformed ids get no reply and leave the registry untouched.
pub async fn find_bound_socket<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    registry: &ConnectionRegistry,
    authenticator: Option<&Authenticator>,
) -> TunnelResult<ConnectionId>
where
    S: AsyncStream + 'static,
{
    if let Some(auth) = authenticator {
        auth.respond(&mut stream).await?;
    }

    let mut raw_id = [0u8; CONN_ID_LEN];
    tokio::time::timeout(AUTH_TIMEOUT, stream.read_exact(&mut raw_id))
        .await
        .map_err(|_| AuthError::Timeout)??;

    let id = ConnectionId::from_bytes(raw_id);
    let handle = registry.lookup(&id)?;

    stream.write_all(&[AUTH_SUCCESS]).await?;
    stream.flush().await?;

    handle.bind(Box::new(stream), peer_addr)?;
    Ok(id)
}

async fn tls_accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> TunnelResult<tokio_rustls::server::TlsStream<TcpStream>> {
    // The handshake shares the authentication deadline
    let accepted = tokio::time::timeout(AUTH_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| TunnelError::Auth(AuthError::Timeout))?;
    Ok(accepted?)
}

fn log_driver_error(peer_addr: SocketAddr, err: &anyhow::Error) {
    let peer_closed = err
        .downcast_ref::<std::io::Error>()
        .is_some_and(is_peer_closed);

    if peer_closed {
        debug!(peer = %peer_addr, "client closed connection: {err}");
    } else {
        error!(peer = %peer_addr, "connection error: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::RegistryError, vsock::VirtualSocket};
    use std::time::Duration;
    use tokio::io::duplex;

    const BIND_GRACE: Duration = Duration::from_secs(2);

    fn peer() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    /// negotiated_socket drives a pending socket past its success reply
    async fn negotiated_socket(registry: &ConnectionRegistry) -> VirtualSocket {
        let mut socket = registry.create(ConnectionId::new(), peer()).unwrap();
        socket
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();
        assert!(socket.is_negotiated());
        socket
    }

    #[tokio::test]
    async fn test_known_id_is_acked_and_bound() {
        let registry = ConnectionRegistry::new();
        let mut socket = negotiated_socket(&registry).await;
        let id = socket.id();

        let (mut client, server) = duplex(1024);
        client.write_all(id.as_bytes()).await.unwrap();

        let bound = find_bound_socket(server, peer(), &registry, None).await.unwrap();
        assert_eq!(bound, id);

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [AUTH_SUCCESS]);

        // The virtual socket now talks to the raw stream
        client.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(BIND_GRACE, socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"data");
        assert!(socket.is_bound());
    }

    #[tokio::test]
    async fn test_unknown_id_gets_no_ack() {
        let registry = ConnectionRegistry::new();
        let _socket = negotiated_socket(&registry).await;

        let (mut client, server) = duplex(1024);
        client.write_all(ConnectionId::new().as_bytes()).await.unwrap();

        let res = find_bound_socket(server, peer(), &registry, None).await;
        assert!(matches!(res, Err(TunnelError::Registry(RegistryError::NotFound(_)))));
        assert_eq!(registry.len(), 1);

        // Server side dropped without writing anything
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_shared_secret_precedes_id() {
        let registry = ConnectionRegistry::new();
        let socket = negotiated_socket(&registry).await;
        let auth = Authenticator::new("hunter2").unwrap();

        let (mut client, server) = duplex(1024);
        let client_auth = auth.clone();
        let id = socket.id();
        let handoff = tokio::spawn(async move {
            client_auth.initiate(&mut client).await.unwrap();
            client.write_all(id.as_bytes()).await.unwrap();
            let mut ack = [0u8; 1];
            client.read_exact(&mut ack).await.unwrap();
            ack[0]
        });

        find_bound_socket(server, peer(), &registry, Some(&auth)).await.unwrap();
        assert_eq!(handoff.await.unwrap(), AUTH_SUCCESS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_raw_socket_times_out() {
        let registry = ConnectionRegistry::new();
        let (_client, server) = duplex(1024);

        let res = find_bound_socket(server, peer(), &registry, None).await;
        assert!(matches!(res, Err(TunnelError::Auth(AuthError::Timeout))));
    }
}

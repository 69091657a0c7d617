use crate::{
    conn_id::ConnectionId,
    control::{BEGIN_PATH, BeginResponse, CONN_ID_PARAM, EXCHANGE_PATH, MAX_EXCHANGE_BODY},
    error::{RegistryError, Result, TunnelError},
    lifecycle::Lifecycle,
    registry::ConnectionRegistry,
    socks5::Socks5Driver,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, io, net::SocketAddr, time::Duration};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// DEFAULT_EXCHANGE_TIMEOUT bounds how long an exchange waits for driver output
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts at drawing a fresh id before giving up on a begin call
const ID_ATTEMPTS: usize = 3;

/// ControlService answers control endpoint requests for the server role
#[derive(Clone)]
pub struct ControlService {
    registry: ConnectionRegistry,
    lifecycle: Lifecycle,
    driver: Socks5Driver,
    exchange_timeout: Duration,
}

impl ControlService {
    pub fn new(registry: ConnectionRegistry, lifecycle: Lifecycle, driver: Socks5Driver) -> Self {
        Self {
            registry,
            lifecycle,
            driver,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    pub fn with_exchange_timeout(mut self, exchange_timeout: Duration) -> Self {
        self.exchange_timeout = exchange_timeout;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// begin registers a pending virtual socket for `remote_addr` and starts
    /// a SOCKS5 driver on it. The driver task is tracked for shutdown.
    pub fn begin(&self, remote_addr: SocketAddr) -> Result<ConnectionId> {
        if self.lifecycle.is_shutting_down() {
            return Err(TunnelError::Transport(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server is shutting down",
            )));
        }

        let mut attempt = 0;
        let mut socket = loop {
            attempt += 1;
            match self.registry.create(ConnectionId::new(), remote_addr) {
                Ok(socket) => break socket,
                Err(RegistryError::DuplicateId(id)) if attempt < ID_ATTEMPTS => {
                    warn!(conn_id = %id, "generated connection id collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        let id = socket.id();
        let driver = self.driver.clone();
        let token = self.lifecycle.token();

        self.lifecycle.spawn(async move {
            match driver.serve(&mut socket, &token).await {
                Ok(_) => debug!(conn_id = %id, "tunnel finished"),
                Err(e) => error!(conn_id = %id, "connection error: {e:#}"),
            }
            if let Err(e) = socket.close().await {
                debug!(conn_id = %id, "failed to close virtual socket: {e}");
            }
        });

        // DEBUG
        info!(conn_id = %id, remote = %remote_addr, "tunnel negotiation started");
        Ok(id)
    }

    /// exchange feeds `payload` to the driver behind `id` and returns its reply.
    /// Shutdown ends a waiting exchange as if the socket were gone.
    pub async fn exchange(
        &self,
        id: ConnectionId,
        payload: Bytes,
    ) -> std::result::Result<Bytes, RegistryError> {
        let handle = self.registry.lookup(&id)?;

        tokio::select! {
            _ = self.lifecycle.cancelled() => Err(RegistryError::NotFound(id)),
            reply = handle.exchange(payload, self.exchange_timeout) => reply,
        }
    }

    /// route dispatches one HTTP request
    pub async fn route(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<Full<Bytes>> {
        let is_begin = match req.uri().path() {
            BEGIN_PATH => true,
            EXCHANGE_PATH => false,
            _ => return status_response(StatusCode::NOT_FOUND),
        };

        if req.method() != Method::POST {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        if is_begin {
            self.handle_begin(remote_addr)
        } else {
            self.handle_exchange(req).await
        }
    }

    fn handle_begin(&self, remote_addr: SocketAddr) -> Response<Full<Bytes>> {
        let id = match self.begin(remote_addr) {
            Ok(id) => id,
            Err(e) => {
                warn!(remote = %remote_addr, "failed to begin tunnel: {e}");
                return status_response(StatusCode::SERVICE_UNAVAILABLE);
            }
        };

        let body = BeginResponse {
            conn_id: id.to_string(),
        };
        match serde_json::to_vec(&body) {
            Ok(json) => body_response(json.into(), "application/json"),
            Err(e) => {
                error!("failed to encode begin response: {e}");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn handle_exchange(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(id) = req.uri().query().and_then(parse_conn_id) else {
            return status_response(StatusCode::BAD_REQUEST);
        };

        let payload = match Limited::new(req.into_body(), MAX_EXCHANGE_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                debug!(conn_id = %id, "failed to read exchange body: {e}");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };

        match self.exchange(id, payload).await {
            Ok(reply) => body_response(reply, "application/octet-stream"),
            Err(RegistryError::NotFound(_)) => status_response(StatusCode::NOT_FOUND),
            Err(e) => {
                warn!(conn_id = %id, "exchange failed: {e}");
                status_response(StatusCode::CONFLICT)
            }
        }
    }
}

/// serve_http_connection runs HTTP/1.1 on one accepted control connection
/// until the peer leaves or shutdown completes a graceful close
pub async fn serve_http_connection<S>(stream: S, service: ControlService, remote_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let lifecycle = service.lifecycle.clone();
    let svc = service_fn(move |req| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.route(req, remote_addr).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = lifecycle.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = res {
        debug!(remote = %remote_addr, "control connection ended: {e}");
    }
}

/// parse_conn_id pulls the connection id out of a query string
fn parse_conn_id(query: &str) -> Option<ConnectionId> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CONN_ID_PARAM)
        .and_then(|(_, value)| value.parse().ok())
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn body_response(body: Bytes, content_type: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

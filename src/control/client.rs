use crate::{
    conn_id::ConnectionId,
    control::{BEGIN_PATH, BeginResponse, CONN_ID_PARAM, EXCHANGE_PATH},
    error::{RegistryError, Result, TunnelError},
    lifecycle::Lifecycle,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, StatusCode,
    client::conn::http1::{self, SendRequest},
    header::HOST,
};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// ControlClient speaks to the server's control endpoint over one
/// HTTP/1.1 connection
pub struct ControlClient {
    sender: SendRequest<Full<Bytes>>,
    host: String,
}

impl ControlClient {
    /// connect runs the HTTP/1.1 handshake on an established stream.
    /// The connection task is tracked by `lifecycle` like any other.
    pub async fn connect<S>(
        stream: S,
        host: impl Into<String>,
        lifecycle: &Lifecycle,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TunnelError::Protocol(format!("control handshake failed: {e}")))?;

        // The connection task ends once the sender is dropped
        lifecycle.spawn(async move {
            if let Err(e) = conn.await {
                debug!("control connection ended: {e}");
            }
        });

        Ok(Self {
            sender,
            host: host.into(),
        })
    }

    /// begin asks the server for a new tunnel and returns its id
    pub async fn begin(&mut self) -> Result<ConnectionId> {
        let (status, body) = self.post(BEGIN_PATH.to_string(), Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(TunnelError::Protocol(format!("begin rejected with {status}")));
        }

        let resp: BeginResponse = serde_json::from_slice(&body)
            .map_err(|e| TunnelError::Protocol(format!("invalid begin response: {e}")))?;
        resp.conn_id
            .parse()
            .map_err(|_| TunnelError::Protocol(format!("invalid connection id {}", resp.conn_id)))
    }

    /// exchange sends `payload` for `id` and returns the driver's reply.
    /// An empty reply means the driver had nothing to send yet.
    pub async fn exchange(&mut self, id: ConnectionId, payload: Bytes) -> Result<Bytes> {
        let uri = format!("{EXCHANGE_PATH}?{CONN_ID_PARAM}={id}");
        let (status, body) = self.post(uri, payload).await?;

        match status {
            StatusCode::OK => Ok(body),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(id).into()),
            status => Err(TunnelError::Protocol(format!("exchange rejected with {status}"))),
        }
    }

    async fn post(&mut self, uri: String, body: Bytes) -> Result<(StatusCode, Bytes)> {
        let failed = |e: &dyn std::fmt::Display| TunnelError::Protocol(format!("control request failed: {e}"));

        self.sender.ready().await.map_err(|e| failed(&e))?;

        let req = Request::post(uri)
            .header(HOST, &self.host)
            .body(Full::new(body))
            .map_err(|e| failed(&e))?;

        let resp = self.sender.send_request(req).await.map_err(|e| failed(&e))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| failed(&e))?
            .to_bytes();

        Ok((status, body))
    }
}

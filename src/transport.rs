//! Sockets, TLS and the accept loop shared by both roles.

use crate::lifecycle::Lifecycle;
use anyhow::{Context as _, Result, anyhow};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, ServerName},
};
use socket2::{SockRef, TcpKeepalive};
use std::{
    fs::File,
    future::Future,
    io::{self, BufReader},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsConnector, client::TlsStream};
use tracing::{debug, info, warn};

/// AsyncStream is any duplex byte stream a connection can run on
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// RawStream is the type-erased raw socket a VirtualSocket binds to
pub type RawStream = Box<dyn AsyncStream>;

/// ALPN offered by the HTTPS control endpoint
pub const HTTP_ALPN: &[u8] = b"http/1.1";

/// set_keepalive enables TCP keep-alive with the given idle period
pub fn set_keepalive(stream: &TcpStream, period: Duration) {
    let keepalive = TcpKeepalive::new().with_time(period);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("failed to enable TCP keep-alive: {e}");
    }
}

/// accept_loop accepts connections until shutdown and hands each one to
/// `on_accept` as a task tracked by the lifecycle.
///
/// Shutdown is detected through the lifecycle's own flag, never by looking
/// at the accept error. Any accept error outside shutdown is fatal.
pub async fn accept_loop<F, Fut>(
    listener: TcpListener,
    lifecycle: Lifecycle,
    keepalive: Duration,
    name: &'static str,
    mut on_accept: F,
) where
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let accepted = tokio::select! {
            _ = lifecycle.cancelled() => {
                debug!(listener = name, "listener closed by shutdown");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                set_keepalive(&stream, keepalive);
                lifecycle.spawn(on_accept(stream, peer_addr));
            }
            Err(_) if lifecycle.is_shutting_down() => return,
            Err(e) => {
                lifecycle.report_fatal(anyhow!(e).context(format!("{name} listener failed")));
                return;
            }
        }
    }
}

/// load_tls_acceptor builds a server-side TLS acceptor from PEM files
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path, alpn: &[&[u8]]) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_path.display()));
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))?
        .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// build_tls_connector builds the client-side TLS connector.
/// Roots are the bundled webpki set plus an optional extra CA file.
pub fn build_tls_connector(
    ca_path: Option<&Path>,
    insecure_skip_verify: bool,
    alpn: &[&[u8]],
) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_path) = ca_path {
        for cert in load_certs(ca_path)? {
            roots.add(cert)?;
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    if insecure_skip_verify {
        warn!("TLS certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// server_name turns a host name or IP literal into an SNI value
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {host}: {e}"))
}

/// dial_tls opens a TCP connection with a deadline and runs the TLS handshake
pub async fn dial_tls(
    connector: &TlsConnector,
    addr: &str,
    server_name: ServerName<'static>,
    timeout: Duration,
    keepalive: Duration,
) -> io::Result<TlsStream<TcpStream>> {
    let dial = async {
        let tcp = TcpStream::connect(addr).await?;
        set_keepalive(&tcp, keepalive);
        tcp.set_nodelay(true).ok();
        connector.connect(server_name, tcp).await
    };

    tokio::time::timeout(timeout, dial)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out")))?
}

/// bind_listener binds a TCP listener and logs where it runs
pub async fn bind_listener(addr: &str, name: &'static str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} listener on {addr}"))?;

    // DEBUG
    info!(listener = name, "listening on {}", listener.local_addr()?);
    Ok(listener)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// NoVerifier accepts any server certificate
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

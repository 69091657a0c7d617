use crate::error::{AuthError, TunnelError, is_peer_closed};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// MAX_SECRET_LEN caps the shared secret; the responder never reads more
pub const MAX_SECRET_LEN: usize = 20;

/// AUTH_SUCCESS is the single byte a responder sends on a matching secret
pub const AUTH_SUCCESS: u8 = 0x01;

/// AUTH_TIMEOUT bounds both sides of the handshake
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Authenticator runs the pre-shared-secret challenge on a fresh raw socket
///
/// Initiator:  SECRET (raw bytes, no length prefix)
/// Responder:  0x01 on match, otherwise the connection is closed
#[derive(Clone)]
pub struct Authenticator {
    secret: Arc<[u8]>,
    timeout: Duration,
}

impl Authenticator {
    /// new validates the secret and builds an authenticator with the default timeout
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, TunnelError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(TunnelError::Config("password cannot be empty".into()));
        }
        if secret.len() > MAX_SECRET_LEN {
            return Err(TunnelError::Config(format!(
                "password too long: {} bytes (max {MAX_SECRET_LEN})",
                secret.len()
            )));
        }

        Ok(Self {
            secret: Arc::from(secret),
            timeout: AUTH_TIMEOUT,
        })
    }

    /// with_timeout overrides the handshake deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// initiate sends the secret and waits for the success byte
    pub async fn initiate<S>(&self, stream: &mut S) -> Result<(), AuthError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            stream.write_all(&self.secret).await?;
            stream.flush().await?;

            // A closed channel is how the responder says no
            let mut reply = [0u8; 1];
            match stream.read(&mut reply).await {
                Ok(0) => Err(AuthError::SecretMismatch),
                Ok(_) if reply[0] == AUTH_SUCCESS => Ok(()),
                Ok(_) => Err(AuthError::SecretMismatch),
                Err(e) if is_peer_closed(&e) => Err(AuthError::SecretMismatch),
                Err(e) => Err(AuthError::Transport(e)),
            }
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AuthError::Timeout)?
    }

    /// respond reads the peer's secret and acknowledges it on a match.
    /// On mismatch nothing is written; the caller drops the stream.
    pub async fn respond<S>(&self, stream: &mut S) -> Result<(), AuthError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let mut buf = [0u8; MAX_SECRET_LEN];
            let n = stream.read(&mut buf).await?;

            if n == 0 || buf[..n] != *self.secret {
                return Err(AuthError::SecretMismatch);
            }

            stream.write_all(&[AUTH_SUCCESS]).await?;
            stream.flush().await?;
            Ok(())
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AuthError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_secret_validation() {
        assert!(Authenticator::new("").is_err());
        assert!(Authenticator::new("a".repeat(MAX_SECRET_LEN + 1)).is_err());
        assert!(Authenticator::new("a".repeat(MAX_SECRET_LEN)).is_ok());
    }

    #[tokio::test]
    async fn test_matching_secrets() {
        let (mut client, mut server) = duplex(64);
        let initiator = Authenticator::new("s3cret").unwrap();
        let responder = Authenticator::new("s3cret").unwrap();

        let (client_res, server_res) =
            tokio::join!(initiator.initiate(&mut client), responder.respond(&mut server));
        assert!(client_res.is_ok());
        assert!(server_res.is_ok());
    }

    #[tokio::test]
    async fn test_mismatched_secret() {
        let (mut client, server) = duplex(64);
        let initiator = Authenticator::new("wrong").unwrap();
        let responder = Authenticator::new("s3cret").unwrap();

        let server_task = tokio::spawn(async move {
            let mut server = server;
            let res = responder.respond(&mut server).await;
            // Dropping the stream is the only answer a mismatch gets
            drop(server);
            res
        });

        let client_res = initiator.initiate(&mut client).await;
        assert!(matches!(client_res, Err(AuthError::SecretMismatch)));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(AuthError::SecretMismatch)
        ));
    }

    #[tokio::test]
    async fn test_longer_secret_is_rejected() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"s3cret-and-more").await.unwrap();

        let responder = Authenticator::new("s3cret").unwrap();
        let res = responder.respond(&mut server).await;
        assert!(matches!(res, Err(AuthError::SecretMismatch)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_responder_times_out() {
        // Keep the far end open but never answer
        let (mut client, _server) = duplex(64);
        let initiator = Authenticator::new("s3cret").unwrap();

        let started = tokio::time::Instant::now();
        let res = initiator.initiate(&mut client).await;
        assert!(matches!(res, Err(AuthError::Timeout)));
        assert!(started.elapsed() >= AUTH_TIMEOUT);
    }
}

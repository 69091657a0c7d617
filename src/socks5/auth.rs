use crate::socks5::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UserPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// negotiate_auth handles authentication negotiation between the SOCKS server and client.
/// With credentials configured only username/password is offered, otherwise only no-auth.
pub async fn negotiate_auth<S>(stream: &mut S, auth_config: Option<&UserPass>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    let method = select_auth_method(&methods, auth_config.is_some());

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;
    stream.flush().await?;

    match (method, auth_config) {
        (AuthMethod::UserPass, Some(creds)) => authenticate_userpass(stream, creds).await,
        (AuthMethod::NoAuth, None) => Ok(()),
        _ => bail!("[ERR] no acceptable authentication method"),
    }
}

/// authenticate_userpass handles username/password authentication according to the RFC1929
async fn authenticate_userpass<S>(stream: &mut S, server_creds: &UserPass) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Subnegotiation version -> 0x01 expected
    if stream.read_u8().await? != USERPASS_VERSION {
        bail!("[ERR] invalid username/password subnegotiation version");
    }

    let username_len = stream.read_u8().await?;
    let mut username = vec![0u8; username_len as usize];
    stream.read_exact(&mut username).await?;

    let password_len = stream.read_u8().await?;
    let mut password = vec![0u8; password_len as usize];
    stream.read_exact(&mut password).await?;

    let status = if username != server_creds.username.as_bytes()
        || password != server_creds.password.as_bytes()
    {
        AuthStatus::Failure
    } else {
        AuthStatus::Success
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[USERPASS_VERSION, status as u8]).await?;
    stream.flush().await?;

    match status {
        AuthStatus::Success => Ok(()),
        AuthStatus::Failure => bail!("[ERR] authentication failed"),
    }
}

/// select_auth_method picks the single method this server accepts, if the client offers it
fn select_auth_method(client_methods: &[u8], userpass_required: bool) -> AuthMethod {
    let wanted = if userpass_required {
        AuthMethod::UserPass
    } else {
        AuthMethod::NoAuth
    };

    if client_methods.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    }
}

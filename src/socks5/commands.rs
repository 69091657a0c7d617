use crate::socks5::{
    address::{encode_socket_addr, parse_address_from_stream},
    protocol::{Command, RSV, ReplyCode, Version},
};
use anyhow::{Result, anyhow, bail};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

/// UNSPECIFIED is the bound address sent with failure replies
const UNSPECIFIED: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// handle_socks_request checks the incoming request for SOCKS5 version number
/// and command, dials the target for CONNECT and returns the outbound stream.
/// Every other command is answered with CommandNotSupported.
pub async fn handle_socks_request<S>(stream: &mut S, dial_timeout: Duration) -> Result<TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not retrieving RSV (RESERVED) -> 0x00

    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    match Command::from_byte(command) {
        Some(Command::Connect) => handle_connect_cmd(stream, dial_timeout).await,
        Some(cmd @ (Command::Bind | Command::UdpAssociate)) => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED).await?;
            Err(anyhow!("[ERR] {cmd:?} not supported"))
        }
        None => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED).await?;
            Err(anyhow!("[ERR] unknown command {command:#04x}"))
        }
    }
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect_cmd parses the CONNECT target, dials it within
/// `dial_timeout` and reports the outcome to the client
async fn handle_connect_cmd<S>(stream: &mut S, dial_timeout: Duration) -> Result<TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (target, _) = parse_address_from_stream(stream).await?;

    // DEBUG
    debug!(target = %target, "dialing CONNECT target");

    let dialed = match tokio::time::timeout(dial_timeout, TcpStream::connect(&target)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
    };

    match dialed {
        Ok(outbound) => {
            outbound.set_nodelay(true).ok();
            send_reply(stream, ReplyCode::Succeeded, outbound.local_addr()?).await?;
            Ok(outbound)
        }
        Err(e) => {
            send_reply(stream, ReplyCode::from_io_error(&e), UNSPECIFIED).await?;
            Err(anyhow!("[ERR] failed to connect to {target}: {e}"))
        }
    }
}

/// send_reply writes a complete SOCKS5 reply in a single write
pub async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[Version::SOCKS5 as u8, reply_code as u8, RSV]);
    encode_socket_addr(&mut reply, bound_addr);

    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::duplex, net::TcpListener};

    #[tokio::test]
    async fn test_connect_dials_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let (mut client, mut server) = duplex(256);
        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&port.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let outbound = handle_socks_request(&mut server, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outbound.peer_addr().unwrap().port(), port);

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, ReplyCode::Succeeded as u8, RSV, 0x01]);
    }

    #[tokio::test]
    async fn test_refused_target_gets_failure_reply() {
        // Grab a free port and close it again
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut client, mut server) = duplex(256);
        let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        req.extend_from_slice(&port.to_be_bytes());
        client.write_all(&req).await.unwrap();

        assert!(handle_socks_request(&mut server, Duration::from_secs(5)).await.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::ConnectionRefused as u8);
    }

    #[tokio::test]
    async fn test_bind_and_udp_not_supported() {
        for cmd in [Command::Bind, Command::UdpAssociate] {
            let (mut client, mut server) = duplex(256);
            client
                .write_all(&[0x05, cmd as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            assert!(handle_socks_request(&mut server, Duration::from_secs(1)).await.is_err());

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
        }
    }

    #[tokio::test]
    async fn test_reply_is_single_chunk() {
        let (mut client, mut server) = duplex(256);
        send_reply(&mut server, ReplyCode::Succeeded, "192.0.2.1:443".parse().unwrap())
            .await
            .unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 192, 0, 2, 1, 0x01, 0xbb]);
    }
}

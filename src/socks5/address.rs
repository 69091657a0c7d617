use crate::socks5::protocol::AddressType;
use anyhow::{Result, anyhow, bail};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// parse_address_from_stream contains logic to parse the network address
/// from an incoming client connection request: IPv4, IPv6, or domain name
/// and returns the resultant address as a String
pub async fn parse_address_from_stream<S>(stream: &mut S) -> Result<(String, AddressType)>
where
    S: AsyncRead + Unpin,
{
    // Read address type byte from stream
    let atype = stream.read_u8().await?;
    let addr_type =
        AddressType::from_byte(atype).ok_or_else(|| anyhow!("[ERR] unknown address type {atype:#04x}"))?;

    // Match type and extract address or domain name
    let host = match addr_type {
        AddressType::IPv4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        AddressType::DomainName => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream.read_u8().await?;
            if len == 0 {
                bail!("[ERR] empty domain name");
            }

            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)?
        }
        AddressType::IPv6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            // Bracketed so the result stays dialable as host:port
            format!("[{}]", Ipv6Addr::from(addr))
        }
    };

    // Read port -> BigEndian (network order)
    let dest_port = stream.read_u16().await?;

    Ok((format!("{host}:{dest_port}"), addr_type))
}

/// encode_socket_addr appends ATYP, address and port for a reply
pub fn encode_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_ipv4() {
        let mut input: &[u8] = &[0x01, 127, 0, 0, 1, 0x1f, 0x90];
        let (addr, atype) = parse_address_from_stream(&mut input).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080");
        assert_eq!(atype, AddressType::IPv4);
    }

    #[tokio::test]
    async fn test_parse_domain() {
        let mut bytes = vec![0x03, 11];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let mut input: &[u8] = &bytes;
        let (addr, atype) = parse_address_from_stream(&mut input).await.unwrap();
        assert_eq!(addr, "example.com:443");
        assert_eq!(atype, AddressType::DomainName);
    }

    #[tokio::test]
    async fn test_parse_ipv6_is_dialable() {
        let mut bytes = vec![0x04];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let mut input: &[u8] = &bytes;
        let (addr, _) = parse_address_from_stream(&mut input).await.unwrap();
        assert_eq!(addr, "[::1]:80");
        assert!(addr.parse::<SocketAddr>().is_ok());
    }

    #[tokio::test]
    async fn test_rejects_unknown_type_and_truncation() {
        let mut unknown: &[u8] = &[0x02, 0, 0];
        assert!(parse_address_from_stream(&mut unknown).await.is_err());

        let mut truncated: &[u8] = &[0x01, 10, 0];
        assert!(parse_address_from_stream(&mut truncated).await.is_err());

        let mut empty_domain: &[u8] = &[0x03, 0, 0, 80];
        assert!(parse_address_from_stream(&mut empty_domain).await.is_err());
    }

    #[test]
    fn test_encode_socket_addr() {
        let mut buf = Vec::new();
        encode_socket_addr(&mut buf, "10.0.0.2:1080".parse().unwrap());
        assert_eq!(buf, [0x01, 10, 0, 0, 2, 0x04, 0x38]);
    }
}

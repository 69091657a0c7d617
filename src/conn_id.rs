use std::{fmt, str::FromStr};
use thiserror::Error;

/// Length of the raw byte form sent at the start of a handoff socket
pub const CONN_ID_LEN: usize = 16;

// Lengths of the hyphen-separated groups in the canonical text form
const GROUPS: [usize; 5] = [4, 2, 2, 2, 6];

/// ConnectionId correlates a control endpoint session with its raw socket.
/// 128 random bits, written as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` on the
/// control endpoint and as 16 raw bytes on the handoff socket.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; CONN_ID_LEN]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed connection id")]
pub struct ParseConnectionIdError;

impl ConnectionId {
    /// new mints a fresh random id
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; CONN_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// from_slice parses the raw byte form, which must be exactly 16 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseConnectionIdError> {
        let raw: [u8; CONN_ID_LEN] = bytes.try_into().map_err(|_| ParseConnectionIdError)?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; CONN_ID_LEN] {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut start = 0;
        for (i, len) in GROUPS.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(&hex::encode(&self.0[start..start + len]))?;
            start += len;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl FromStr for ConnectionId {
    type Err = ParseConnectionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != GROUPS.len() {
            return Err(ParseConnectionIdError);
        }

        let mut raw = [0u8; CONN_ID_LEN];
        let mut start = 0;
        for (part, len) in parts.iter().zip(GROUPS) {
            // Each group must have exactly two hex digits per byte
            if part.len() != len * 2 {
                return Err(ParseConnectionIdError);
            }
            hex::decode_to_slice(part, &mut raw[start..start + len])
                .map_err(|_| ParseConnectionIdError)?;
            start += len;
        }

        Ok(Self(raw))
    }
}

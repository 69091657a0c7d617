use crate::{
    auth::MAX_SECRET_LEN,
    error::{Result, TunnelError},
    socks5::UserPass,
};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// DEFAULT_CONFIG_PATH is read when no -c flag is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/socksbridge.json";

pub const DEFAULT_KEEPALIVE_PERIOD: u64 = 3600;
pub const DEFAULT_GRACEFUL_PERIOD: u64 = 10;
pub const DEFAULT_DIAL_TIMEOUT: u64 = 10;
pub const DEFAULT_BIND_TIMEOUT: u64 = 30;
pub const DEFAULT_EXCHANGE_TIMEOUT: u64 = 30;

/// Role selects which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

/// Transport selects how a tunnel is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// one TLS connection per tunnel, SOCKS5 runs on it directly
    #[default]
    Raw,
    /// SOCKS5 negotiation over HTTPS, then migration to a raw TLS socket
    Http,
}

/// Config is the JSON configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    pub role: Role,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub server_addr: String,
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub client_addr: Option<String>,
    #[serde(default)]
    pub server_cert: Option<PathBuf>,
    #[serde(default)]
    pub server_key: Option<PathBuf>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub server_ca: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub socks5_username: Option<String>,
    #[serde(default)]
    pub socks5_password: Option<String>,
    #[serde(default)]
    pub keepalive_period: u64,
    #[serde(default)]
    pub graceful_period: u64,
    #[serde(default)]
    pub dial_timeout: u64,
    #[serde(default)]
    pub bind_timeout: u64,
    #[serde(default)]
    pub exchange_timeout: u64,
}

impl Config {
    /// load reads, defaults and validates the config file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// from_json parses a config document and applies defaults and validation
    pub fn from_json(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_json::from_str(data)
            .map_err(|e| TunnelError::Config(format!("invalid config: {e}")))?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        // Zero means unset
        for (value, default) in [
            (&mut self.keepalive_period, DEFAULT_KEEPALIVE_PERIOD),
            (&mut self.graceful_period, DEFAULT_GRACEFUL_PERIOD),
            (&mut self.dial_timeout, DEFAULT_DIAL_TIMEOUT),
            (&mut self.bind_timeout, DEFAULT_BIND_TIMEOUT),
            (&mut self.exchange_timeout, DEFAULT_EXCHANGE_TIMEOUT),
        ] {
            if *value == 0 {
                *value = default;
            }
        }

        // Empty strings behave like missing fields
        for field in [
            &mut self.http_addr,
            &mut self.client_addr,
            &mut self.server_name,
            &mut self.password,
            &mut self.socks5_username,
            &mut self.socks5_password,
        ] {
            if field.as_deref().is_some_and(str::is_empty) {
                *field = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TunnelError::Config(msg.to_string()));

        if self.server_addr.is_empty() {
            return invalid("server_addr cannot be empty");
        }

        if let Some(password) = &self.password {
            if password.len() > MAX_SECRET_LEN {
                return Err(TunnelError::Config(format!(
                    "password cannot be longer than {MAX_SECRET_LEN} bytes"
                )));
            }
        }

        if self.socks5_username.is_some() != self.socks5_password.is_some() {
            return invalid("socks5_username and socks5_password must be set together");
        }

        if self.transport == Transport::Http && self.http_addr.is_none() {
            return invalid("http_addr is required for the http transport");
        }

        match self.role {
            Role::Server => {
                if self.server_cert.is_none() {
                    return invalid("server_cert cannot be empty");
                }
                if self.server_key.is_none() {
                    return invalid("server_key cannot be empty");
                }
            }
            Role::Client => {
                if self.client_addr.is_none() {
                    return invalid("client_addr cannot be empty");
                }
            }
        }

        Ok(())
    }

    /// tls_server_name is the SNI the client presents, defaulting to the
    /// host part of server_addr
    pub fn tls_server_name(&self) -> &str {
        if let Some(name) = &self.server_name {
            return name;
        }
        host_of(&self.server_addr)
    }

    /// socks5_credentials returns the RFC 1929 credentials, if configured
    pub fn socks5_credentials(&self) -> Option<UserPass> {
        match (&self.socks5_username, &self.socks5_password) {
            (Some(username), Some(password)) => Some(UserPass {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_period)
    }

    pub fn graceful_period(&self) -> Duration {
        Duration::from_secs(self.graceful_period)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout)
    }
}

/// host_of strips the port from `host:port` or `[v6]:port`
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

use crate::error::ConfigError;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Name of the environment variable holding the debug flag
pub const DEBUG_ENV: &str = "TURBO_DEBUG";

/// ConfigOptions holds raw, unvalidated server settings as they arrive from
/// flags or the environment. Every field is optional; timeouts are in
/// milliseconds.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub max_connections: Option<i64>,
    pub local_read_timeout_ms: Option<i64>,
    pub local_write_timeout_ms: Option<i64>,
    pub remote_connect_timeout_ms: Option<i64>,
    pub remote_read_timeout_ms: Option<i64>,
    pub remote_write_timeout_ms: Option<i64>,
}

/// Timeouts applied to a proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub local_read: Duration,
    pub local_write: Duration,
    pub remote_connect: Duration,
    // Remote read/write deadlines are carried but the relay does not
    // enforce them.
    pub remote_read: Duration,
    pub remote_write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        Self {
            local_read: timeout,
            local_write: timeout,
            remote_connect: timeout,
            remote_read: timeout,
            remote_write: timeout,
        }
    }
}

/// ServerConfig is the validated, immutable configuration of a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeouts: Timeouts::default(),
        }
    }
}

impl ServerConfig {
    /// address returns the configured listen address as host:port
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl ConfigOptions {
    /// validate applies defaults to unset or non-positive values and rejects
    /// ports outside 1-65535. An explicit port of 0 counts as unset.
    pub fn validate(self) -> Result<ServerConfig, ConfigError> {
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host.trim().to_string(),
            _ => DEFAULT_HOST.to_string(),
        };

        let port = match self.port {
            None | Some(0) => DEFAULT_PORT,
            Some(port) => u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange(port))?,
        };

        let max_connections = match self.max_connections {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX),
            _ => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(ServerConfig {
            host,
            port,
            max_connections,
            timeouts: Timeouts {
                local_read: timeout_or_default(self.local_read_timeout_ms),
                local_write: timeout_or_default(self.local_write_timeout_ms),
                remote_connect: timeout_or_default(self.remote_connect_timeout_ms),
                remote_read: timeout_or_default(self.remote_read_timeout_ms),
                remote_write: timeout_or_default(self.remote_write_timeout_ms),
            },
        })
    }
}

fn timeout_or_default(ms: Option<i64>) -> Duration {
    match ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(DEFAULT_TIMEOUT_MS),
    }
}

/// debug_enabled interprets the debug flag: absent or "off" disables it,
/// any other value enables it
pub fn debug_enabled(value: Option<&str>) -> bool {
    !matches!(value, None | Some("") | Some("off"))
}

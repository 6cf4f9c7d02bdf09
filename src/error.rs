use std::io;
use thiserror::Error;

/// ConnectionError is the terminal error of a single proxied connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// is_protocol_violation reports whether the peer broke the SOCKS5
    /// protocol, as opposed to a transport failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::UnsupportedVersion(_)
                | ConnectionError::NoAcceptableMethod
                | ConnectionError::UnsupportedCommand(_)
                | ConnectionError::MalformedRequest(_)
        )
    }

    /// from_read maps a failed exact read: a stream that ends early is a
    /// malformed request, anything else is a transport error
    pub(crate) fn from_read(e: io::Error, what: &str) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnectionError::MalformedRequest(format!("truncated {what}"))
        } else {
            ConnectionError::Io(e)
        }
    }
}

/// ServerError reports listener lifecycle failures
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyRunning,

    #[error("server already stopped")]
    AlreadyStopped,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// ConfigError reports configuration values that cannot be defaulted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {0} out of range (1-65535)")]
    PortOutOfRange(i64),
}

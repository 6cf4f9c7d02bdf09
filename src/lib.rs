//! A SOCKS5 proxy gateway
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - No Authentication
//!     - Explicit per-connection state machine: handshake -> command -> relay -> close
//!     - Connection ceiling enforced at accept time
//!     - Live/total connection statistics
//!     - Graceful stop: new connections are refused, open ones drain
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use turbosocks::{ConfigOptions, TcpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigOptions {
//!         host: Some("127.0.0.1".into()),
//!         port: Some(1080),
//!         ..Default::default()
//!     }
//!     .validate()?;
//!
//!     let server = TcpServer::new(config);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod server;
pub mod socks5;

// Re-export main types at crate root for convenience
pub use config::{ConfigOptions, ServerConfig, Timeouts};
pub use error::{ConfigError, ConnectionError, ServerError};
pub use server::{Server, Statistics, Status, TcpServer};
pub use socks5::address::{Address, TargetAddress};
pub use socks5::connection::{Connection, ConnectionState};

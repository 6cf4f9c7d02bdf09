use crate::{
    config::ServerConfig,
    error::ServerError,
    socks5::connection::Connection,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, oneshot, watch},
    time,
};
use tracing::{Instrument, debug, error, info, info_span};

mod stats;

use stats::ConnectionStats;
pub use stats::Statistics;

/// How long a single accept may block before the loop re-checks its status
pub const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Status is the lifecycle position of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
    Stopping,
}

/// Server is the capability shared by listening transports
pub trait Server {
    /// proto names the transport, e.g. "tcp"
    fn proto(&self) -> &'static str;

    /// address returns the configured listen address
    fn address(&self) -> String;

    /// run serves until stop is called
    fn run(&self) -> impl Future<Output = Result<(), ServerError>> + Send;

    /// stop halts admission of new connections and waits for run to return
    fn stop(&self) -> impl Future<Output = Result<(), ServerError>> + Send;

    fn statistics(&self) -> Statistics;
}

/// TcpServer is a SOCKS5 server over TCP
pub struct TcpServer {
    config: ServerConfig,
    status: watch::Sender<Status>,
    // Serializes run/stop transitions and holds the accept loop's exit signal
    lifecycle: Mutex<Option<oneshot::Receiver<()>>>,
    stats: Arc<ConnectionStats>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

/// TcpServer implementation block
impl TcpServer {
    /// new is a constructor for the TcpServer type
    pub fn new(config: ServerConfig) -> Self {
        let (status, _) = watch::channel(Status::Stopped);

        Self {
            config,
            status,
            lifecycle: Mutex::new(None),
            stats: Arc::new(ConnectionStats::default()),
            local_addr: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// local_addr returns the bound socket address while the server runs
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().map(|addr| *addr).unwrap_or(None)
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut local_addr) = self.local_addr.lock() {
            *local_addr = addr;
        }
    }

    /// run binds the listener and serves connections until stop is called
    pub async fn run(&self) -> Result<(), ServerError> {
        let (listener, done) = {
            let mut lifecycle = self.lifecycle.lock().await;

            if self.status() == Status::Running {
                return Err(ServerError::AlreadyRunning);
            }

            let bind_err = |source| ServerError::Bind {
                addr: self.config.address(),
                source,
            };
            let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
                .await
                .map_err(bind_err)?;
            let bound = listener.local_addr().map_err(bind_err)?;

            info!("SOCKS5 server listening on {}", bound);
            self.set_local_addr(Some(bound));

            let (done_tx, done_rx) = oneshot::channel();
            *lifecycle = Some(done_rx);

            self.stats.mark_started();
            self.status.send_replace(Status::Running);

            (listener, done_tx)
        };

        let _guard = RunGuard {
            status: &self.status,
            _done: done,
        };

        self.accept_loop(listener).await;

        info!("server <{}> no longer accepting", self.config.address());
        Ok(())
    }

    /// stop halts the accept loop and waits for it to exit. Connections
    /// already being served run to completion on their own.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.status() {
            Status::Stopping | Status::Stopped => return Err(ServerError::AlreadyStopped),
            Status::Running => {}
        }

        self.status.send_replace(Status::Stopping);

        // Resolves when run drops its end, whether it returned or was cancelled
        if let Some(done) = lifecycle.take() {
            let _ = done.await;
        }

        self.status.send_replace(Status::Stopped);
        self.set_local_addr(None);

        info!("server <{}> stopped", self.config.address());
        Ok(())
    }

    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut status = self.status.subscribe();

        while *status.borrow_and_update() == Status::Running {
            // Accept with a deadline, but wake up at once on a status change
            let accepted = tokio::select! {
                _ = status.changed() => continue,
                accepted = time::timeout(ACCEPT_DEADLINE, listener.accept()) => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Err(_elapsed) => continue,
                Ok(Err(e)) if is_transient(&e) => continue,
                Ok(Err(e)) => {
                    error!("accept failed: {}", e);
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            self.admit(stream, peer_addr);
        }
    }

    /// admit hands an accepted stream to a new connection task, or drops it
    /// when the connection ceiling is reached
    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        // Over the ceiling: the stream was still accepted to drain the
        // backlog, and is closed here without a word
        let Some(permit) = self.stats.try_admit(self.config.max_connections) else {
            drop(stream);
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {}", e);
        }

        let timeouts = self.config.timeouts;
        let span = info_span!("conn", peer = %peer_addr);

        // Spawn async task
        tokio::spawn(
            async move {
                let _permit = permit;
                debug!("new client");

                match Connection::new(stream, timeouts).run().await {
                    Ok(()) => debug!("connection closed"),
                    Err(e) => debug!("connection aborted, last err: {}", e),
                }
            }
            .instrument(span),
        );
    }
}

impl Server for TcpServer {
    fn proto(&self) -> &'static str {
        "tcp"
    }

    fn address(&self) -> String {
        self.config.address()
    }

    fn run(&self) -> impl Future<Output = Result<(), ServerError>> + Send {
        TcpServer::run(self)
    }

    fn stop(&self) -> impl Future<Output = Result<(), ServerError>> + Send {
        TcpServer::stop(self)
    }

    fn statistics(&self) -> Statistics {
        TcpServer::statistics(self)
    }
}

/// RunGuard settles the status when run exits. A normal exit leaves the
/// Stopping -> Stopped transition to stop; a cancelled run falls back to
/// Stopped. Dropping it also releases a waiting stop.
struct RunGuard<'a> {
    status: &'a watch::Sender<Status>,
    _done: oneshot::Sender<()>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.status.send_if_modified(|status| {
            if *status == Status::Running {
                *status = Status::Stopped;
                true
            } else {
                false
            }
        });
    }
}

/// is_transient reports accept errors that only affect a single attempt
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

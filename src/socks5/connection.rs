use crate::config::Timeouts;
use crate::error::ConnectionError;
use crate::socks5::address::{self, TargetAddress};
use crate::socks5::auth::select_auth_method;
use crate::socks5::protocol::{AuthMethod, Command, SUCCESS_REPLY, Version};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// ConnectionState is the position of a connection in the SOCKS5 flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the client's method negotiation
    Handshaking,
    /// Auth method agreed, waiting for the command request
    Negotiated,
    /// Destination dialed and success reply sent
    RemoteConnected,
    /// Relay finished or a step failed; sockets are being released
    Closing,
    Closed,
}

/// Connection drives one accepted client through handshake, command,
/// relay and teardown. It exclusively owns the client stream and, once
/// dialed, the destination stream.
pub struct Connection<S> {
    client: Option<S>,
    remote: Option<TcpStream>,
    state: ConnectionState,
    last_error: Option<ConnectionError>,
    target: Option<TargetAddress>,
    timeouts: Timeouts,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// new wraps a freshly accepted client stream
    pub fn new(client: S, timeouts: Timeouts) -> Self {
        Self {
            client: Some(client),
            remote: None,
            state: ConnectionState::Handshaking,
            last_error: None,
            target: None,
            timeouts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&ConnectionError> {
        self.last_error.as_ref()
    }

    /// target returns the destination requested by the client, once parsed
    pub fn target(&self) -> Option<&TargetAddress> {
        self.target.as_ref()
    }

    /// run drives the connection to completion and returns its terminal error
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        self.drive().await;

        match self.last_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// drive steps the state machine until it is Closed
    pub async fn drive(&mut self) -> Option<&ConnectionError> {
        while self.state != ConnectionState::Closed {
            self.step().await;
        }
        self.last_error.as_ref()
    }

    /// step performs the action of the current state and returns the state
    /// it moved to. A failing step records its error and moves to Closing.
    pub async fn step(&mut self) -> ConnectionState {
        let outcome = match self.state {
            ConnectionState::Handshaking => self.negotiate().await,
            ConnectionState::Negotiated => self.handle_request().await,
            ConnectionState::RemoteConnected => self.relay().await,
            ConnectionState::Closing => {
                if let Err(e) = self.close().await {
                    self.record(e);
                }
                return self.state;
            }
            ConnectionState::Closed => return self.state,
        };

        match outcome {
            Ok(next) => self.state = next,
            Err(e) => {
                debug!("{:?} failed: {}", self.state, e);
                self.record(e);
                self.state = ConnectionState::Closing;
            }
        }

        self.state
    }

    /// close releases both streams. Both are shut down even if the first
    /// fails; the first failure is returned. Closing a Closed connection is
    /// a no-op.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        let mut first_err = None;

        if let Some(mut client) = self.client.take() {
            if let Err(e) = shutdown(&mut client).await {
                first_err.get_or_insert(e);
            }
        }

        if let Some(mut remote) = self.remote.take() {
            if let Err(e) = shutdown(&mut remote).await {
                first_err.get_or_insert(e);
            }
        }

        self.state = ConnectionState::Closed;

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// record keeps the first error as the connection's last error
    fn record(&mut self, e: ConnectionError) {
        self.last_error.get_or_insert(e);
    }

    fn client_mut(&mut self) -> Result<&mut S, ConnectionError> {
        self.client
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    /// negotiate handles authentication negotiation with the client
    async fn negotiate(&mut self) -> Result<ConnectionState, ConnectionError> {
        let timeouts = self.timeouts;
        let client = self.client_mut()?;

        // ClientHello format
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+
        let mut header = [0u8; 2];
        read_exact_within(client, &mut header, timeouts.local_read, "handshake").await?;

        if header[0] != Version::SOCKS5 as u8 {
            return Err(ConnectionError::UnsupportedVersion(header[0]));
        }

        let mut methods = vec![0u8; header[1] as usize];
        read_exact_within(client, &mut methods, timeouts.local_read, "auth methods").await?;

        let method = select_auth_method(&methods);

        // ServerChoice method selection reply format
        // +----+--------+
        // |VER | METHOD |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        write_all_within(
            client,
            &[Version::SOCKS5 as u8, method as u8],
            timeouts.local_write,
            "handshake reply",
        )
        .await?;

        if method == AuthMethod::NoAcceptable {
            return Err(ConnectionError::NoAcceptableMethod);
        }

        Ok(ConnectionState::Negotiated)
    }

    /// handle_request parses the command request, dials the destination and
    /// sends the success reply
    async fn handle_request(&mut self) -> Result<ConnectionState, ConnectionError> {
        let timeouts = self.timeouts;
        let client = self.client_mut()?;

        // SOCKS5 request format
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut header = [0u8; 4];
        read_exact_within(client, &mut header, timeouts.local_read, "request header").await?;

        let [version, command, _rsv, atyp] = header;

        if version != Version::SOCKS5 as u8 {
            return Err(ConnectionError::UnsupportedVersion(version));
        }

        // BIND and UDP ASSOCIATE are recognised but never fulfilled
        if Command::from_byte(command) != Some(Command::Connect) {
            return Err(ConnectionError::UnsupportedCommand(command));
        }

        let target = within(
            timeouts.local_read,
            "request address",
            address::read_target_address(client, atyp),
        )
        .await?;

        info!("remote host: {}", target);
        self.target = Some(target.clone());

        let remote = dial(&target, timeouts.remote_connect).await?;
        let remote = self.remote.insert(remote);

        if let Err(e) = remote.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on remote: {}", e);
        }

        let client = self.client_mut()?;
        write_all_within(client, &SUCCESS_REPLY, timeouts.local_write, "command reply").await?;

        Ok(ConnectionState::RemoteConnected)
    }

    /// relay copies bytes in both directions until both sides are done.
    /// EOF on one side half-closes the other and is not an error.
    async fn relay(&mut self) -> Result<ConnectionState, ConnectionError> {
        let (Some(client), Some(remote)) = (self.client.as_mut(), self.remote.as_mut()) else {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        };

        let (from_client, from_remote) = copy_bidirectional(client, remote).await?;

        debug!(
            "relay finished: {} bytes from client, {} bytes from remote",
            from_client, from_remote
        );

        Ok(ConnectionState::Closing)
    }
}

/// dial connects to the target, bounded by the connect timeout
async fn dial(target: &TargetAddress, limit: Duration) -> Result<TcpStream, ConnectionError> {
    let host = target.host();

    match time::timeout(limit, TcpStream::connect((host.as_str(), target.port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectionError::Connect {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(ConnectionError::ConnectTimeout(target.to_string())),
    }
}

async fn within<F, T>(limit: Duration, what: &'static str, fut: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, ConnectionError>>,
{
    time::timeout(limit, fut)
        .await
        .map_err(|_| ConnectionError::Timeout(what))?
}

async fn read_exact_within<R>(
    reader: &mut R,
    buf: &mut [u8],
    limit: Duration,
    what: &'static str,
) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    within(limit, what, async {
        reader
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::from_read(e, what))
    })
    .await
}

async fn write_all_within<W>(
    writer: &mut W,
    buf: &[u8],
    limit: Duration,
    what: &'static str,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    within(limit, what, async {
        writer.write_all(buf).await.map_err(ConnectionError::from)
    })
    .await
}

/// shutdown closes the write side; a peer that is already gone is not an error
async fn shutdown<W>(stream: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match stream.shutdown().await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

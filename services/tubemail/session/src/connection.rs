//! Connection manager: TLS listener, dialer and socket bookkeeping.
//!
//! Only connections that pass mutual authentication are surfaced, as
//! [`Connection`]s on the channel returned by [`ConnectionManager::new`].
//! Every raw socket, authenticated or not, is tracked by a [`SocketGuard`]
//! until it is fully closed, so [`ConnectionManager::close`] can wait for a
//! complete teardown.

use crate::transport::{IoStream, TlsIdentity};
use crate::x509::CertInfo;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Connection manager errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried
        addr: SocketAddr,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The manager was closed
    #[error("connection manager is closed")]
    Closed,
}

impl ConnectionError {
    /// Whether a bind failed because the port is taken
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ConnectionError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote side dialled us
    In,
    /// We dialled the remote side
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// Keeps a raw socket counted as live until dropped.
///
/// Dropping the guard decrements the live count and runs the close hook
/// registered with [`ConnectionManager::connect`], exactly once.
pub struct SocketGuard {
    live: Option<Arc<watch::Sender<usize>>>,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SocketGuard {
    pub(crate) fn tracked(live: Arc<watch::Sender<usize>>, on_close: Option<Box<dyn FnOnce() + Send + Sync>>) -> Self {
        live.send_modify(|n| *n += 1);
        Self {
            live: Some(live),
            on_close,
        }
    }

    /// A guard not tied to any manager
    pub fn detached() -> Self {
        Self {
            live: None,
            on_close: None,
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.send_modify(|n| *n = n.saturating_sub(1));
        }
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl fmt::Debug for SocketGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketGuard")
            .field("tracked", &self.live.is_some())
            .finish()
    }
}

/// A mutually authenticated connection, ready for a session to take over
pub struct Connection {
    /// Encrypted stream
    pub stream: IoStream,
    /// Who dialled
    pub direction: Direction,
    /// Remote socket address, IPv4-mapped addresses unwrapped
    pub remote: SocketAddr,
    /// Certificate the peer presented
    pub info: CertInfo,
    /// Live-socket tracking; keep alive as long as the stream
    pub guard: SocketGuard,
    /// Turns `true` when the manager forcibly closes every socket
    pub kill: watch::Receiver<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .field("peer", &self.info.to_string())
            .finish()
    }
}

/// Resolve once `kill` turns true; never if the manager is gone
pub async fn killed(kill: &mut watch::Receiver<bool>) {
    if kill.wait_for(|killed| *killed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

struct Inner {
    tls: TlsIdentity,
    handshake_timeout: Duration,
    live: Arc<watch::Sender<usize>>,
    kill: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    connections: mpsc::Sender<Connection>,
}

/// Owner of the listening socket and every raw socket
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager. Authenticated connections arrive on the returned
    /// receiver.
    pub fn new(tls: TlsIdentity, handshake_timeout: Duration) -> (Self, mpsc::Receiver<Connection>) {
        let (connections, rx) = mpsc::channel(64);
        let (kill, _) = watch::channel(false);
        let (live, _) = watch::channel(0usize);
        let inner = Inner {
            tls,
            handshake_timeout,
            live: Arc::new(live),
            kill,
            listener: Mutex::new(None),
            connections,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Number of raw sockets not yet fully closed
    pub fn live_sockets(&self) -> usize {
        *self.inner.live.borrow()
    }

    /// Bind and start accepting. Returns the bound port, which differs from
    /// `port` when `port` is 0.
    pub async fn listen(&self, addr: IpAddr, port: u16) -> Result<u16, ConnectionError> {
        if *self.inner.kill.borrow() {
            return Err(ConnectionError::Closed);
        }

        let addr = SocketAddr::new(addr, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ConnectionError::Bind { addr, source })?;
        info!("Listening on {}", bound);

        let manager = self.clone();
        let task = tokio::spawn(async move { manager.accept_loop(listener).await });
        if let Some(previous) = self.inner.listener.lock().await.replace(task) {
            previous.abort();
        }
        Ok(bound.port())
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut kill = self.inner.kill.subscribe();
        loop {
            tokio::select! {
                _ = killed(&mut kill) => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, remote)) => {
                        let guard = SocketGuard::tracked(self.inner.live.clone(), None);
                        let manager = self.clone();
                        tokio::spawn(async move {
                            manager.secure(tcp, canonical(remote), Direction::In, guard).await
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
        debug!("Listener closed");
    }

    /// Dial `addr`. `on_close` runs once the resulting socket is fully
    /// closed, whether or not it ever authenticated.
    pub fn connect<F>(&self, addr: SocketAddr, on_close: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let guard = SocketGuard::tracked(self.inner.live.clone(), Some(Box::new(on_close)));
        if *self.inner.kill.borrow() {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let mut kill = manager.inner.kill.subscribe();
            let tcp = tokio::select! {
                _ = killed(&mut kill) => return,
                tcp = tokio::time::timeout(manager.inner.handshake_timeout, TcpStream::connect(addr)) => tcp,
            };
            match tcp {
                Ok(Ok(tcp)) => manager.secure(tcp, canonical(addr), Direction::Out, guard).await,
                Ok(Err(e)) => debug!("Failed to connect to {}: {}", addr, e),
                Err(_) => debug!("Timed out connecting to {}", addr),
            }
        });
    }

    /// Run the TLS handshake and surface the connection if it authenticated
    async fn secure(&self, tcp: TcpStream, remote: SocketAddr, direction: Direction, guard: SocketGuard) {
        let mut kill = self.inner.kill.subscribe();
        let handshake = async {
            match direction {
                Direction::In => self.inner.tls.accept(tcp).await,
                Direction::Out => self.inner.tls.connect(tcp).await,
            }
        };

        let stream = tokio::select! {
            _ = killed(&mut kill) => return,
            res = tokio::time::timeout(self.inner.handshake_timeout, handshake) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Dropping unauthorized {} connection {}: {}", direction, remote, e);
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake with {} timed out", remote);
                    return;
                }
            },
        };

        let info = match stream.peer_certificate().map(|der| CertInfo::from_der(&der)) {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                debug!("Dropping {} connection {}: {}", direction, remote, e);
                return;
            }
            None => {
                debug!("Dropping {} connection {}: no peer certificate", direction, remote);
                return;
            }
        };

        trace!("Authenticated {} connection {} ({})", direction, remote, info);
        let connection = Connection {
            stream,
            direction,
            remote,
            info,
            guard,
            kill,
        };
        if self.inner.connections.send(connection).await.is_err() {
            debug!("No consumer for connection from {}", remote);
        }
    }

    /// Stop accepting and destroy every tracked socket.
    ///
    /// Resolves immediately if the manager never listened; otherwise waits
    /// until the listening socket is closed and no tracked socket is left.
    pub async fn close(&self) {
        self.inner.kill.send_replace(true);

        let Some(listener) = self.inner.listener.lock().await.take() else {
            return;
        };
        if let Err(e) = listener.await {
            debug!("Listener task ended abnormally: {}", e);
        }

        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|n| *n == 0).await;
        info!("Connection manager closed");
    }
}

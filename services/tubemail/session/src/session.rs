//! Session driver: runs a [`NeighMachine`] over a framed connection.
//!
//! Each session is one tokio task. It never touches hood state; everything
//! it learns goes out as a [`SessionEvent`], and the hood steers it through
//! [`SessionCommand`]s and the admission reply.

use crate::connection::{Connection, Direction};
use crate::framer::{FrameSender, Framer, FramerError, FramerEvent};
use crate::neigh::{Effect, Input, NeighContext, NeighError, NeighMachine};
use crate::x509::CertInfo;
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use tubemail_wire::{Iam, Message, NeighAnnounce, PeerId, WireError};

/// Identifies a session for the lifetime of its hood
pub type SessionKey = u64;

/// Admission verdict: the neighbours to advertise, or why we are refused
pub type AdmissionReply = Result<Vec<NeighAnnounce>, NeighError>;

const PEER_MESSAGE_BUFFER: usize = 256;

/// Configuration shared by all sessions of a hood
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Our identity
    pub local_id: PeerId,
    /// Our listen port, announced to peers
    pub listen_port: u16,
    /// Time allowed for each handshake stage
    pub handshake_timeout: Duration,
}

/// Events emitted by sessions
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake reached the identity check; the hood must reserve the id
    Admission {
        /// Session asking
        key: SessionKey,
        /// Identity and listen port the peer announced
        iam: Iam,
        /// Where the verdict goes
        reply: oneshot::Sender<AdmissionReply>,
    },
    /// The session became a neighbour
    Found {
        /// Session
        key: SessionKey,
        /// Neighbour handle
        neigh: Neigh,
    },
    /// A neighbour went away gracefully
    Lost {
        /// Session
        key: SessionKey,
        /// Neighbour handle
        neigh: Neigh,
    },
    /// A peer that might be worth dialling
    Discovery {
        /// Peer address
        host: IpAddr,
        /// Peer listen port
        port: u16,
        /// Peer identity when known
        id: Option<PeerId>,
    },
    /// Application payload from a neighbour
    Message {
        /// Sender
        neigh: Neigh,
        /// Payload
        payload: Bytes,
    },
    /// A neighbour sent a frame we could not decode
    ParserError {
        /// Sender
        neigh: Neigh,
        /// Decode error
        error: WireError,
    },
    /// The session ended and its transport is closed
    Goodbye {
        /// Session
        key: SessionKey,
        /// Why the session ended, `None` when graceful
        error: Option<NeighError>,
    },
}

/// Instructions from the hood to a session
#[derive(Debug)]
pub enum SessionCommand {
    /// Gossip a newly found neighbour to our peer
    Advertise(NeighAnnounce),
    /// Tear the session down
    Leave,
}

struct NeighInner {
    id: PeerId,
    listen_port: u16,
    direction: Direction,
    remote: SocketAddr,
    info: CertInfo,
    sender: FrameSender,
    messages: broadcast::Sender<Bytes>,
}

/// A connected neighbour
#[derive(Clone)]
pub struct Neigh {
    inner: Arc<NeighInner>,
}

impl Neigh {
    /// Remote identity
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Who dialled
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Remote address as seen on the socket
    pub fn host(&self) -> IpAddr {
        self.inner.remote.ip()
    }

    /// Remote socket port; ephemeral for inbound connections
    pub fn port(&self) -> u16 {
        self.inner.remote.port()
    }

    /// Port the neighbour listens on
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    /// Certificate the neighbour presented
    pub fn info(&self) -> &CertInfo {
        &self.inner.info
    }

    /// Gossip record describing this neighbour
    pub fn announce(&self) -> NeighAnnounce {
        NeighAnnounce {
            id: self.inner.id,
            port: self.inner.listen_port,
            host: self.host(),
        }
    }

    /// Send a payload to this neighbour only
    pub async fn send(&self, payload: Bytes) -> Result<(), FramerError> {
        let fragments = Message::Data(payload).pack()?;
        self.inner.sender.send(&fragments).await
    }

    /// Receive payloads this neighbour sends from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.messages.subscribe()
    }
}

impl fmt::Debug for Neigh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neigh")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote", &self.inner.remote)
            .field("listen_port", &self.inner.listen_port)
            .finish()
    }
}

impl PartialEq for Neigh {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Hood-side handle of a running session
#[derive(Debug)]
pub struct SessionHandle {
    /// Session key
    pub key: SessionKey,
    /// Who dialled
    pub direction: Direction,
    /// Remote socket address
    pub remote: SocketAddr,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Queue a command; ignored once the session ended
    pub fn command(&self, command: SessionCommand) {
        let _ = self.commands.send(command);
    }
}

/// Session task
pub struct Session {
    key: SessionKey,
    machine: NeighMachine,
    framer: Framer,
    direction: Direction,
    remote: SocketAddr,
    info: CertInfo,
    handshake_timeout: Duration,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    deadline: Option<Instant>,
    admission: Option<oneshot::Receiver<AdmissionReply>>,
    neigh: Option<Neigh>,
}

impl Session {
    /// Take over an authenticated connection and start the handshake
    pub fn spawn(
        connection: Connection,
        config: &SessionConfig,
        key: SessionKey,
        events: mpsc::Sender<SessionEvent>,
    ) -> SessionHandle {
        let Connection {
            stream,
            direction,
            remote,
            info,
            guard,
            kill,
        } = connection;

        let machine = NeighMachine::new(NeighContext {
            local_id: config.local_id,
            listen_port: config.listen_port,
            direction,
            remote_host: remote.ip(),
        });
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let session = Session {
            key,
            machine,
            framer: Framer::new(stream, kill, guard),
            direction,
            remote,
            info,
            handshake_timeout: config.handshake_timeout,
            commands,
            events,
            deadline: None,
            admission: None,
            neigh: None,
        };
        tokio::spawn(session.run());

        SessionHandle {
            key,
            direction,
            remote,
            commands: commands_tx,
        }
    }

    async fn run(mut self) {
        debug!("Session {} started ({} {})", self.key, self.direction, self.remote);
        let effects = self.machine.handle(Input::Start);
        self.apply(effects).await;

        while !self.machine.is_final() {
            let input = self.next_input().await;
            trace!("Session {} input {:?}", self.key, input);
            let effects = self.machine.handle(input);
            self.apply(effects).await;
        }

        let error = self.machine.take_error();
        match &error {
            Some(e) => debug!("Session {} with {} ended: {}", self.key, self.remote, e),
            None => debug!("Session {} with {} ended", self.key, self.remote),
        }
        let _ = self
            .events
            .send(SessionEvent::Goodbye {
                key: self.key,
                error,
            })
            .await;
    }

    async fn next_input(&mut self) -> Input {
        // Frames stay queued in the framer until the hood has decided
        if let Some(reply) = self.admission.as_mut() {
            let verdict = reply.await.unwrap_or(Err(NeighError::Leaving));
            self.admission = None;
            return Input::Admission(verdict);
        }

        let deadline = self.deadline;
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = self.framer.next() => match event {
                Some(FramerEvent::Block(block)) => Input::Block(block),
                Some(FramerEvent::Closed(_)) | None => Input::Closed,
            },
            command = self.commands.recv() => match command {
                Some(SessionCommand::Advertise(neigh)) => Input::Advertise(neigh),
                Some(SessionCommand::Leave) | None => Input::Leave,
            },
            _ = timer => Input::Timeout,
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    let kind = message.kind();
                    let sent = match message.pack() {
                        Ok(fragments) => self.framer.send(&fragments).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = sent {
                        // The reader side reports the close
                        debug!("Session {} failed to send {}: {}", self.key, kind, e);
                    }
                }
                Effect::ArmTimeout => {
                    self.deadline = Some(Instant::now() + self.handshake_timeout);
                }
                Effect::CancelTimeout => {
                    self.deadline = None;
                }
                Effect::RequestAdmission(iam) => {
                    let (reply, verdict) = oneshot::channel();
                    self.admission = Some(verdict);
                    self.emit(SessionEvent::Admission {
                        key: self.key,
                        iam,
                        reply,
                    })
                    .await;
                }
                Effect::Discover { host, port, id } => {
                    self.emit(SessionEvent::Discovery { host, port, id }).await;
                }
                Effect::Found(iam) => {
                    let (messages, _) = broadcast::channel(PEER_MESSAGE_BUFFER);
                    let neigh = Neigh {
                        inner: Arc::new(NeighInner {
                            id: iam.id,
                            listen_port: iam.port,
                            direction: self.direction,
                            remote: self.remote,
                            info: self.info.clone(),
                            sender: self.framer.sender(),
                            messages,
                        }),
                    };
                    info!(
                        "Connected to {} ({}, {} {})",
                        neigh.id().short(),
                        neigh.info(),
                        self.direction,
                        self.remote
                    );
                    self.neigh = Some(neigh.clone());
                    self.emit(SessionEvent::Found {
                        key: self.key,
                        neigh,
                    })
                    .await;
                }
                Effect::Deliver(payload) => {
                    if let Some(neigh) = self.neigh.clone() {
                        let _ = neigh.inner.messages.send(payload.clone());
                        self.emit(SessionEvent::Message { neigh, payload }).await;
                    }
                }
                Effect::ParserError(error) => {
                    if let Some(neigh) = self.neigh.clone() {
                        warn!("Neighbour {} sent a bad frame: {}", neigh.id().short(), error);
                        self.emit(SessionEvent::ParserError { neigh, error }).await;
                    }
                }
                Effect::Lost => {
                    if let Some(neigh) = self.neigh.clone() {
                        info!("Lost neighbour {} ({})", neigh.id().short(), neigh.info());
                        self.emit(SessionEvent::Lost {
                            key: self.key,
                            neigh,
                        })
                        .await;
                    }
                }
                Effect::Close => {
                    self.framer.close().await;
                }
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Session {} has no listener", self.key);
        }
    }
}

//! The neigh protocol engine.
//!
//! One [`NeighMachine`] runs per connection. It is a pure transition
//! function: the driver in [`crate::session`] feeds it [`Input`]s (blocks
//! from the framer, timer expiry, verdicts from the hood) and executes the
//! [`Effect`]s it returns. Keeping I/O out of here makes every stage
//! transition testable without sockets.
//!
//! ```text
//!  hello ──► iam ──► connected ──► final
//!    │        │                      ▲
//!    └────────┴──────── fail ────────┘
//! ```

use crate::connection::Direction;
use bytes::Bytes;
use std::net::IpAddr;
use thiserror::Error;
use tubemail_wire::{Iam, Message, NeighAnnounce, PeerId, WireError};

/// Reasons a session ends with an error
#[derive(Error, Debug)]
pub enum NeighError {
    /// Transport closed before the handshake completed
    #[error("remote side closed the connection")]
    RemoteClosed,

    /// No hello arrived in time, or something else arrived instead
    #[error("remote side sent no valid magic")]
    NoMagic,

    /// No iam arrived in time, or something else arrived instead
    #[error("remote side sent no valid iam packet")]
    NoIam,

    /// The remote side carries our own identity
    #[error("we connected ourselves")]
    SelfConnection,

    /// Another session already owns the remote identity
    #[error("remote ID is already connected")]
    AlreadyConnected,

    /// Inbound session lost the tie-break
    #[error("remote ID higher than ours")]
    IdHigher,

    /// Outbound session lost the tie-break
    #[error("remote ID lower than ours")]
    IdLower,

    /// The hood is shutting down
    #[error("hood is leaving")]
    Leaving,

    /// Malformed frame during the handshake
    #[error("handshake violation: {0}")]
    Violation(#[source] WireError),
}

/// Handshake stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Exchanging the magic greeting
    Hello,
    /// Exchanging identities
    Iam,
    /// Steady relay
    Connected,
    /// Terminal
    Final,
}

/// Something that happened to the session
#[derive(Debug)]
pub enum Input {
    /// Session was created; enter the first stage
    Start,
    /// A block arrived from the framer
    Block(Bytes),
    /// The transport reached its end
    Closed,
    /// The current stage timer expired
    Timeout,
    /// The hood's verdict on our admission request, with the neighbours to
    /// advertise when admitted
    Admission(Result<Vec<NeighAnnounce>, NeighError>),
    /// A neighbour the hood found after we were admitted
    Advertise(NeighAnnounce),
    /// The hood tears the session down
    Leave,
}

/// Side effect requested by the machine
#[derive(Debug)]
pub enum Effect {
    /// Write a message to the peer
    Send(Message),
    /// Start (or restart) the stage timer
    ArmTimeout,
    /// Stop the stage timer
    CancelTimeout,
    /// Ask the hood to admit this identity
    RequestAdmission(Iam),
    /// Tell the hood about a peer it may dial
    Discover {
        /// Peer address
        host: IpAddr,
        /// Peer listen port
        port: u16,
        /// Peer identity when known
        id: Option<PeerId>,
    },
    /// Handshake done; the session is a neighbour now
    Found(Iam),
    /// Application payload from the peer
    Deliver(Bytes),
    /// Post-handshake frame that failed to decode
    ParserError(WireError),
    /// A found neighbour went away
    Lost,
    /// Close the transport
    Close,
}

/// Static facts the machine decides on
#[derive(Debug, Clone, Copy)]
pub struct NeighContext {
    /// Our identity
    pub local_id: PeerId,
    /// Our listen port, announced in iam
    pub listen_port: u16,
    /// Who dialled
    pub direction: Direction,
    /// Address of the peer as seen on the socket
    pub remote_host: IpAddr,
}

/// Per-connection handshake and relay state machine
#[derive(Debug)]
pub struct NeighMachine {
    ctx: NeighContext,
    stage: Stage,
    remote: Option<Iam>,
    awaiting_admission: bool,
    found: bool,
    lost: bool,
    error: Option<NeighError>,
}

impl NeighMachine {
    /// Create a machine that has not started yet
    pub fn new(ctx: NeighContext) -> Self {
        Self {
            ctx,
            stage: Stage::Hello,
            remote: None,
            awaiting_admission: false,
            found: false,
            lost: false,
            error: None,
        }
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether the session has ended
    pub fn is_final(&self) -> bool {
        self.stage == Stage::Final
    }

    /// Remote identity and listen port, once admitted
    pub fn remote(&self) -> Option<Iam> {
        if self.found {
            self.remote
        } else {
            None
        }
    }

    /// Whether the machine waits for the hood's admission verdict
    pub fn awaiting_admission(&self) -> bool {
        self.awaiting_admission
    }

    /// Take the error the session ended with
    pub fn take_error(&mut self) -> Option<NeighError> {
        self.error.take()
    }

    /// Feed one input and collect the resulting effects
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match (self.stage, input) {
            (Stage::Final, _) => Vec::new(),

            (_, Input::Leave) => {
                let error = (self.stage != Stage::Connected).then_some(NeighError::Leaving);
                self.finish(error)
            }

            (Stage::Hello, Input::Start) => {
                vec![Effect::Send(Message::Hello), Effect::ArmTimeout]
            }
            (Stage::Hello, Input::Block(block)) => match Message::unpack(block) {
                Ok(Message::Hello) => {
                    self.stage = Stage::Iam;
                    let iam = Iam {
                        id: self.ctx.local_id,
                        port: self.ctx.listen_port,
                    };
                    vec![Effect::Send(Message::Iam(iam)), Effect::ArmTimeout]
                }
                Ok(_) | Err(WireError::Magic) => self.finish(Some(NeighError::NoMagic)),
                Err(e) => self.finish(Some(NeighError::Violation(e))),
            },
            (Stage::Hello, Input::Timeout) => self.finish(Some(NeighError::NoMagic)),

            (Stage::Iam, Input::Block(_)) if self.awaiting_admission => Vec::new(),
            (Stage::Iam, Input::Block(block)) => match Message::unpack(block) {
                Ok(Message::Iam(iam)) => self.on_iam(iam),
                Ok(_) => self.finish(Some(NeighError::NoIam)),
                Err(e) => self.finish(Some(NeighError::Violation(e))),
            },
            (Stage::Iam, Input::Timeout) => self.finish(Some(NeighError::NoIam)),
            (Stage::Iam, Input::Admission(verdict)) if self.awaiting_admission => {
                self.awaiting_admission = false;
                match verdict {
                    Ok(neighbours) => self.on_admitted(neighbours),
                    Err(e) => self.finish(Some(e)),
                }
            }

            (Stage::Hello | Stage::Iam, Input::Closed) => {
                self.finish(Some(NeighError::RemoteClosed))
            }

            (Stage::Connected, Input::Block(block)) => match Message::unpack(block) {
                Ok(Message::Neigh(neigh)) => vec![Effect::Discover {
                    host: neigh.host,
                    port: neigh.port,
                    id: Some(neigh.id),
                }],
                Ok(Message::Data(payload)) => vec![Effect::Deliver(payload)],
                Ok(Message::Hello | Message::Iam(_)) => Vec::new(),
                Err(e) => vec![Effect::ParserError(e)],
            },
            (Stage::Connected, Input::Advertise(neigh)) => self.advertise(neigh).into_iter().collect(),
            (Stage::Connected, Input::Closed) => self.finish(None),

            // Stray inputs: verdicts without a request, timers after a stage
            // advanced, advertisements before admission.
            (_, _) => Vec::new(),
        }
    }

    fn on_iam(&mut self, iam: Iam) -> Vec<Effect> {
        let local = self.ctx.local_id;
        if iam.id == local {
            return self.finish(Some(NeighError::SelfConnection));
        }

        match self.ctx.direction {
            Direction::In if iam.id > local => {
                // Let the other direction's dial go ahead
                let mut effects = vec![Effect::Discover {
                    host: self.ctx.remote_host,
                    port: iam.port,
                    id: Some(iam.id),
                }];
                effects.extend(self.finish(Some(NeighError::IdHigher)));
                effects
            }
            Direction::Out if iam.id < local => self.finish(Some(NeighError::IdLower)),
            _ => {
                self.remote = Some(iam);
                self.awaiting_admission = true;
                vec![Effect::CancelTimeout, Effect::RequestAdmission(iam)]
            }
        }
    }

    fn on_admitted(&mut self, neighbours: Vec<NeighAnnounce>) -> Vec<Effect> {
        let Some(iam) = self.remote else {
            return self.finish(Some(NeighError::NoIam));
        };

        self.stage = Stage::Connected;
        self.found = true;
        let mut effects = vec![Effect::Found(iam)];
        effects.extend(neighbours.into_iter().filter_map(|n| self.advertise(n)));
        effects
    }

    fn advertise(&self, neigh: NeighAnnounce) -> Option<Effect> {
        let remote = self.remote.map(|iam| iam.id);
        if remote == Some(neigh.id) || neigh.id == self.ctx.local_id {
            return None;
        }
        Some(Effect::Send(Message::Neigh(neigh)))
    }

    /// Enter the terminal stage. Only the first call has an effect.
    fn finish(&mut self, error: Option<NeighError>) -> Vec<Effect> {
        if self.stage == Stage::Final {
            return Vec::new();
        }
        self.stage = Stage::Final;
        self.awaiting_admission = false;

        let mut effects = vec![Effect::CancelTimeout];
        if error.is_none() && self.found && !self.lost {
            self.lost = true;
            effects.push(Effect::Lost);
        }
        self.error = error;
        effects.push(Effect::Close);
        effects
    }
}

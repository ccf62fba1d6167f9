//! The hood: one process's membership in a tubemail mesh.
//!
//! All membership state lives in a single actor task. Sessions, discovery
//! plugins, reconnect timers and dial completions report to it over
//! channels; [`Hood`] handles only read the published neighbour list and
//! ask the actor to leave.

use crate::config::HoodConfig;
use crate::discovery::{DiscoveryContext, DiscoverySink, StopHandle};
use crate::error::HoodError;
use crate::membership::Membership;
use bytes::Bytes;
use futures::future::join_all;
use futures::Stream;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use tubemail_session::{
    AdmissionReply, CertInfo, Connection, ConnectionManager, Neigh, NeighError, ReconnectTimer,
    Session, SessionCommand, SessionConfig, SessionEvent, SessionHandle, SessionKey,
};
use tubemail_wire::{Iam, PeerId, WireError, ID_SIZE};

const SESSION_EVENT_BUFFER: usize = 256;

/// Inputs the actor receives from plugins, timers and the dialer
#[derive(Debug)]
pub(crate) enum HoodInput {
    /// A plugin found a peer; `host` may still need resolving
    Discovered { host: String, port: u16 },
    /// A resolved peer worth dialling
    Candidate {
        host: IpAddr,
        port: u16,
        id: Option<PeerId>,
    },
    /// The socket of an earlier dial is fully closed
    DialClosed(String),
    /// A plugin reported a failure
    DiscoveryFailed(String),
}

/// Notifications for the application
#[derive(Debug)]
pub enum HoodEvent {
    /// A neighbour completed the handshake
    FoundNeigh(Neigh),
    /// A neighbour went away
    LostNeigh(Neigh),
    /// A neighbour sent a payload
    Message {
        /// Sender
        neigh: Neigh,
        /// Payload
        payload: Bytes,
    },
    /// A neighbour sent a frame that could not be decoded; the connection
    /// stays up
    ParserError {
        /// Sender
        neigh: Neigh,
        /// Decode failure
        error: WireError,
    },
    /// A non-fatal failure worth surfacing
    Error(HoodError),
}

/// Stream of [`HoodEvent`]s. Ends once the hood has left.
#[derive(Debug)]
pub struct HoodEvents {
    rx: mpsc::UnboundedReceiver<HoodEvent>,
}

impl HoodEvents {
    /// Next event, `None` after the hood has left
    pub async fn recv(&mut self) -> Option<HoodEvent> {
        self.rx.recv().await
    }
}

impl Stream for HoodEvents {
    type Item = HoodEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<HoodEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Selects a neighbour by identity, or by address and listen port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighQuery {
    /// Match this identity
    pub id: Option<PeerId>,
    /// Match this host and listen port
    pub addr: Option<(IpAddr, u16)>,
}

impl NeighQuery {
    /// Query by identity
    pub fn by_id(id: PeerId) -> Self {
        Self {
            id: Some(id),
            addr: None,
        }
    }

    /// Query by host and listen port
    pub fn by_addr(host: IpAddr, port: u16) -> Self {
        Self {
            id: None,
            addr: Some((host.to_canonical(), port)),
        }
    }

    /// Whether `neigh` matches either criterion
    pub fn matches(&self, neigh: &Neigh) -> bool {
        if self.id == Some(neigh.id()) {
            return true;
        }
        self.addr == Some((neigh.host(), neigh.listen_port()))
    }
}

struct Shared {
    id: PeerId,
    port: u16,
    fingerprint: String,
    info: CertInfo,
    neighbours: watch::Receiver<Vec<Neigh>>,
    leave: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

/// Handle to a running hood
#[derive(Clone)]
pub struct Hood {
    shared: Arc<Shared>,
}

impl Hood {
    /// Our identity for this run
    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// Port we listen on
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Mesh fingerprint
    pub fn fingerprint(&self) -> &str {
        &self.shared.fingerprint
    }

    /// Our own certificate
    pub fn info(&self) -> &CertInfo {
        &self.shared.info
    }

    /// Current neighbours
    pub fn neighbours(&self) -> Vec<Neigh> {
        self.shared.neighbours.borrow().clone()
    }

    /// Watch the neighbour list change
    pub fn watch_neighbours(&self) -> watch::Receiver<Vec<Neigh>> {
        self.shared.neighbours.clone()
    }

    /// First neighbour matching `query`
    pub fn get_neigh(&self, query: &NeighQuery) -> Option<Neigh> {
        self.shared
            .neighbours
            .borrow()
            .iter()
            .find(|neigh| query.matches(neigh))
            .cloned()
    }

    /// Whether the hood has left
    pub fn is_closed(&self) -> bool {
        self.shared.leave.is_closed()
    }

    /// Send `payload` to every current neighbour.
    ///
    /// Resolves once every transport took the frame, with the ids that were
    /// addressed. With no neighbours this is a successful no-op.
    pub async fn send(&self, payload: Bytes) -> Result<Vec<PeerId>, HoodError> {
        if self.is_closed() {
            return Err(HoodError::Closed);
        }

        let neighbours = self.neighbours();
        let results = join_all(neighbours.iter().map(|neigh| {
            let payload = payload.clone();
            async move { (neigh.id(), neigh.send(payload).await) }
        }))
        .await;

        let mut sent = Vec::with_capacity(results.len());
        for (id, result) in results {
            result.map_err(|source| HoodError::Send { id, source })?;
            sent.push(id);
        }
        Ok(sent)
    }

    /// Leave the mesh and wait until everything is torn down: discovery
    /// stopped, every session closed and the listening socket released.
    pub async fn leave(&self) {
        let (done, wait) = oneshot::channel();
        if self.shared.leave.send(done).is_err() {
            return;
        }
        let _ = wait.await;
    }
}

impl std::fmt::Debug for Hood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hood")
            .field("id", &self.shared.id)
            .field("port", &self.shared.port)
            .field("info", &self.shared.info.to_string())
            .finish()
    }
}

/// Join the mesh: generate an identity, bind one of the port candidates and
/// start discovery.
///
/// Fails if the randomness source fails, or if no candidate port could be
/// bound.
pub async fn start(config: HoodConfig) -> Result<(Hood, HoodEvents), HoodError> {
    let HoodConfig {
        identity,
        info,
        fingerprint,
        ports,
        listen_addr,
        discovery,
        reconnect_interval,
        reconnect_timeout,
        handshake_timeout,
    } = config;

    let id = generate_id()?;
    info!("Local ID {}", id.short());
    debug!("Full local ID {}", id);

    let (cm, connections) = ConnectionManager::new(identity, handshake_timeout);
    let port = listen(&cm, listen_addr, ports.ports()).await?;

    let (inputs_tx, inputs) = mpsc::unbounded_channel();
    let ctx = DiscoveryContext {
        port,
        fingerprint: fingerprint.clone(),
        id,
    };
    let stops = discovery
        .into_iter()
        .map(|plugin| plugin.start(ctx.clone(), DiscoverySink::new(inputs_tx.clone())))
        .collect();

    let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (published, neighbours) = watch::channel(Vec::new());
    let (leave_tx, leave_rx) = mpsc::unbounded_channel();

    let actor = HoodActor {
        id,
        session_config: SessionConfig {
            local_id: id,
            listen_port: port,
            handshake_timeout,
        },
        cm,
        connections,
        session_tx,
        session_rx,
        inputs_tx,
        inputs,
        leave_rx,
        events: events_tx,
        published,
        sessions: HashMap::new(),
        neighbours: BTreeMap::new(),
        membership: Membership::default(),
        dialing: HashSet::new(),
        reconnect: ReconnectTimer::new(reconnect_interval, reconnect_timeout),
        stops,
        next_key: 0,
        leaving: false,
        handles_gone: false,
        waiters: Vec::new(),
        teardown: None,
        torn_down: false,
    };
    tokio::spawn(actor.run());
    info!("Hood {} ({}) listening on port {}", id.short(), info, port);

    let hood = Hood {
        shared: Arc::new(Shared {
            id,
            port,
            fingerprint,
            info,
            neighbours,
            leave: leave_tx,
        }),
    };
    Ok((hood, HoodEvents { rx: events_rx }))
}

fn generate_id() -> Result<PeerId, HoodError> {
    let mut bytes = [0u8; ID_SIZE];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(HoodError::Randomness)?;
    Ok(PeerId::from_bytes(bytes))
}

/// Bind the first free candidate
async fn listen(cm: &ConnectionManager, addr: IpAddr, ports: &[u16]) -> Result<u16, HoodError> {
    for &port in ports {
        match cm.listen(addr, port).await {
            Ok(bound) => return Ok(bound),
            Err(e) if e.is_addr_in_use() => {
                debug!("Port {} is in use, trying next candidate", port);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(HoodError::ListeningFailed)
}

async fn join_teardown(task: &mut Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            warn!("Hood teardown ended abnormally: {}", e);
        }
    }
}

fn prefer_v4(addrs: impl Iterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

/// Key of the dial dedup table
fn dial_key(host: IpAddr, port: u16) -> String {
    format!("[{}]:{}", host, port)
}

struct HoodActor {
    id: PeerId,
    session_config: SessionConfig,
    cm: ConnectionManager,
    connections: mpsc::Receiver<Connection>,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: mpsc::Receiver<SessionEvent>,
    inputs_tx: mpsc::UnboundedSender<HoodInput>,
    inputs: mpsc::UnboundedReceiver<HoodInput>,
    leave_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<HoodEvent>,
    published: watch::Sender<Vec<Neigh>>,
    sessions: HashMap<SessionKey, SessionHandle>,
    neighbours: BTreeMap<SessionKey, Neigh>,
    membership: Membership,
    dialing: HashSet<String>,
    reconnect: ReconnectTimer,
    stops: Vec<StopHandle>,
    next_key: SessionKey,
    leaving: bool,
    handles_gone: bool,
    waiters: Vec<oneshot::Sender<()>>,
    teardown: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl HoodActor {
    async fn run(mut self) {
        loop {
            if self.torn_down && self.sessions.is_empty() {
                break;
            }

            tokio::select! {
                Some(connection) = self.connections.recv() => self.on_connection(connection),
                Some(event) = self.session_rx.recv() => self.on_session_event(event),
                Some(input) = self.inputs.recv() => self.on_input(input),
                request = self.leave_rx.recv(), if !self.handles_gone => {
                    match request {
                        Some(done) => self.waiters.push(done),
                        None => {
                            debug!("Every hood handle was dropped");
                            self.handles_gone = true;
                        }
                    }
                    self.begin_leave();
                }
                _ = join_teardown(&mut self.teardown), if self.teardown.is_some() => {
                    self.teardown = None;
                    self.torn_down = true;
                }
                else => break,
            }
        }

        self.reconnect.remove_all();
        self.dialing.clear();
        self.published.send_replace(Vec::new());
        for done in self.waiters.drain(..) {
            let _ = done.send(());
        }
        info!("Hood {} left", self.id.short());
    }

    fn emit(&self, event: HoodEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.published
            .send_replace(self.neighbours.values().cloned().collect());
    }

    fn on_connection(&mut self, connection: Connection) {
        if self.leaving {
            debug!("Dropping connection with {} while leaving", connection.remote);
            return;
        }

        let key = self.next_key;
        self.next_key += 1;
        let handle = Session::spawn(connection, &self.session_config, key, self.session_tx.clone());
        self.sessions.insert(key, handle);
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Admission { key, iam, reply } => {
                let verdict = self.admit(key, iam);
                if let Err(e) = &verdict {
                    debug!("Refusing {} on session {}: {}", iam.id.short(), key, e);
                }
                let _ = reply.send(verdict);
            }
            SessionEvent::Found { key, neigh } => self.on_found(key, neigh),
            SessionEvent::Lost { key, neigh } => self.on_lost(key, neigh),
            SessionEvent::Discovery { host, port, id } => self.on_candidate(host, port, id),
            SessionEvent::Message { neigh, payload } => {
                self.emit(HoodEvent::Message { neigh, payload })
            }
            SessionEvent::ParserError { neigh, error } => {
                self.emit(HoodEvent::ParserError { neigh, error })
            }
            SessionEvent::Goodbye { key, error } => self.on_goodbye(key, error),
        }
    }

    /// Reserve the identity and hand out the neighbours to gossip
    fn admit(&mut self, key: SessionKey, iam: Iam) -> AdmissionReply {
        if self.leaving {
            return Err(NeighError::Leaving);
        }
        let Some(handle) = self.sessions.get(&key) else {
            return Err(NeighError::Leaving);
        };
        self.membership.reserve(key, handle.remote.ip(), iam)?;
        Ok(self.neighbours.values().map(Neigh::announce).collect())
    }

    fn on_found(&mut self, key: SessionKey, neigh: Neigh) {
        info!(
            "New neighbour {} ({}) at {}:{}",
            neigh.id().short(),
            neigh.info(),
            neigh.host(),
            neigh.listen_port()
        );
        self.reconnect.remove(neigh.host(), neigh.listen_port());

        let announce = neigh.announce();
        for (other, handle) in &self.sessions {
            if *other != key && self.membership.admitted(*other) {
                handle.command(SessionCommand::Advertise(announce));
            }
        }

        self.neighbours.insert(key, neigh.clone());
        self.publish();
        self.emit(HoodEvent::FoundNeigh(neigh));
    }

    fn on_lost(&mut self, key: SessionKey, neigh: Neigh) {
        if self.neighbours.remove(&key).is_none() {
            return;
        }
        info!("Lost neighbour {} ({})", neigh.id().short(), neigh.info());
        self.publish();

        if !self.leaving && self.reconnect.is_enabled() {
            let (host, port) = (neigh.host(), neigh.listen_port());
            let inputs = self.inputs_tx.clone();
            self.reconnect.add(host, port, move || {
                let _ = inputs.send(HoodInput::Candidate {
                    host,
                    port,
                    id: None,
                });
            });
        }
        self.emit(HoodEvent::LostNeigh(neigh));
    }

    fn on_goodbye(&mut self, key: SessionKey, error: Option<NeighError>) {
        self.sessions.remove(&key);
        self.membership.release(key);
        if let Some(neigh) = self.neighbours.get(&key).cloned() {
            self.on_lost(key, neigh);
        }
        match error {
            Some(e) => debug!("Session {} closed: {}", key, e),
            None => trace!("Session {} closed", key),
        }
    }

    fn on_input(&mut self, input: HoodInput) {
        match input {
            HoodInput::Discovered { host, port } => self.on_discovered(host, port),
            HoodInput::Candidate { host, port, id } => self.on_candidate(host, port, id),
            HoodInput::DialClosed(key) => {
                self.dialing.remove(&key);
            }
            HoodInput::DiscoveryFailed(reason) => {
                warn!("Discovery failed: {}", reason);
                self.emit(HoodEvent::Error(HoodError::Discovery(reason)));
            }
        }
    }

    /// Resolve names off the actor; literals go straight to the dialer
    fn on_discovered(&mut self, host: String, port: u16) {
        if self.leaving {
            return;
        }

        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            self.on_candidate(ip, port, None);
            return;
        }

        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => match prefer_v4(addrs) {
                    Some(addr) => {
                        trace!("Resolved {} to {}", host, addr.ip());
                        let _ = inputs.send(HoodInput::Candidate {
                            host: addr.ip(),
                            port,
                            id: None,
                        });
                    }
                    None => debug!("{} resolved to no address", host),
                },
                Err(e) => debug!("Failed to resolve {}: {}", host, e),
            }
        });
    }

    fn on_candidate(&mut self, host: IpAddr, port: u16, id: Option<PeerId>) {
        if self.leaving || id == Some(self.id) {
            return;
        }

        let host = host.to_canonical();
        let key = dial_key(host, port);
        if self.dialing.contains(&key) {
            trace!("Already dialling {}", key);
            return;
        }
        if self.membership.covers(host, port, id) {
            trace!("{} is already connected", key);
            return;
        }

        debug!("Potential neighbour {}", key);
        self.dialing.insert(key.clone());
        let inputs = self.inputs_tx.clone();
        self.cm.connect(SocketAddr::new(host, port), move || {
            let _ = inputs.send(HoodInput::DialClosed(key));
        });
    }

    fn begin_leave(&mut self) {
        if self.leaving {
            return;
        }
        self.leaving = true;
        info!("Leaving hood with {} neighbours", self.neighbours.len());

        self.reconnect.remove_all();
        for handle in self.sessions.values() {
            handle.command(SessionCommand::Leave);
        }

        let stops = std::mem::take(&mut self.stops);
        let cm = self.cm.clone();
        self.teardown = Some(tokio::spawn(async move {
            join_all(stops.into_iter().map(StopHandle::stop)).await;
            cm.close().await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_key() {
        assert_eq!(dial_key("10.0.0.1".parse().unwrap(), 4816), "[10.0.0.1]:4816");
        assert_eq!(dial_key("::1".parse().unwrap(), 4816), "[::1]:4816");
    }

    #[test]
    fn test_resolution_prefers_ipv4() {
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(prefer_v4([v6, v4].into_iter()), Some(v4));
        assert_eq!(prefer_v4([v6].into_iter()), Some(v6));
        assert_eq!(prefer_v4(std::iter::empty::<SocketAddr>()), None);
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = generate_id().unwrap();
        let b = generate_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_query_constructors() {
        let query = NeighQuery::default();
        assert!(query.id.is_none());
        assert!(query.addr.is_none());
        let mapped: IpAddr = "::ffff:10.0.0.1".parse().unwrap();
        assert_eq!(
            NeighQuery::by_addr(mapped, 1).addr,
            Some(("10.0.0.1".parse().unwrap(), 1))
        );
    }
}

//! Peer sessions for the tubemail mesh.
//!
//! This crate owns everything between a TCP socket and a connected
//! neighbour:
//!
//! - **Transport**: mutually authenticated TLS against a shared CA
//! - **Connection manager**: listener, dialer and socket bookkeeping
//! - **Framer**: length-prefixed blocks over the TLS stream
//! - **Neigh**: the hello/iam handshake as a pure state machine
//! - **Session**: the tokio task driving one handshake and its data phase
//! - **Reconnect timer**: periodic re-announcement of lost peers
//!
//! Sessions never touch shared membership state. They report through
//! [`SessionEvent`]s and ask the owner for an admission verdict before
//! becoming neighbours.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod framer;
pub mod neigh;
pub mod reconnect;
pub mod session;
pub mod transport;
pub mod x509;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use connection::{Connection, ConnectionError, ConnectionManager, Direction, SocketGuard};
pub use framer::{FrameSender, Framer, FramerError, FramerEvent};
pub use neigh::{NeighError, NeighMachine, Stage};
pub use reconnect::{reconnect_key, ReconnectTimer};
pub use session::{
    AdmissionReply, Neigh, Session, SessionCommand, SessionConfig, SessionEvent, SessionHandle,
    SessionKey,
};
pub use transport::{IoStream, TlsError, TlsIdentity};
pub use x509::{der_to_pem, fingerprint, CertError, CertInfo};

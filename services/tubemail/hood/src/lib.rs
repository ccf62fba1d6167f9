//! Mesh orchestrator for tubemail.
//!
//! A hood is one process's membership in a mesh of mutually authenticated
//! peers sharing a CA. It binds one of its candidate ports, feeds peers
//! reported by discovery plugins to the dialer, admits each handshaken
//! session under a unique identity, gossips new neighbours to the existing
//! ones and re-announces lost neighbours for a while.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tubemail_hood::{start, HoodConfig, HoodEvent, StaticPeer};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HoodConfig::builder()
//!     .key(std::fs::read("hood.alice.key")?)
//!     .cert(std::fs::read("hood.alice.crt")?)
//!     .ca(std::fs::read("hood.crt")?)
//!     .discovery(StaticPeer::new("10.0.0.2", 4816).every(Duration::from_secs(30)))
//!     .build()?;
//!
//! let (hood, mut events) = start(config).await?;
//! hood.send(bytes::Bytes::from_static(b"hello")).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         HoodEvent::FoundNeigh(neigh) => println!("{} joined", neigh.info()),
//!         HoodEvent::LostNeigh(neigh) => println!("{} left", neigh.info()),
//!         HoodEvent::Message { neigh, payload } => {
//!             println!("<{}> {}", neigh.info(), String::from_utf8_lossy(&payload))
//!         }
//!         _ => {}
//!     }
//! }
//! hood.leave().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod hood;
mod membership;

// Re-export main types
pub use config::{
    HoodConfig, HoodConfigBuilder, PortCandidates, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORTS,
    DEFAULT_RECONNECT_INTERVAL, DEFAULT_RECONNECT_TIMEOUT,
};
pub use discovery::{Discovery, DiscoveryContext, DiscoverySink, StaticPeer, StopHandle};
pub use error::{ConfigError, HoodError};
pub use hood::{start, Hood, HoodEvent, HoodEvents, NeighQuery};

pub use tubemail_session::{CertInfo, Direction, Neigh};
pub use tubemail_wire::PeerId;

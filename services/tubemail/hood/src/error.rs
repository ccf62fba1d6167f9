//! Hood error types

use thiserror::Error;
use tubemail_session::{CertError, ConnectionError, FramerError, TlsError};
use tubemail_wire::PeerId;

/// Invalid or missing startup material
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required option was not set
    #[error("{0} is missing")]
    Missing(&'static str),

    /// The certificate or CA could not be parsed
    #[error("invalid {what}: {source}")]
    Certificate {
        /// Which option
        what: &'static str,
        /// Parse failure
        #[source]
        source: CertError,
    },

    /// Key material was rejected by the TLS stack
    #[error("invalid TLS material: {0}")]
    Tls(#[from] TlsError),
}

/// Hood errors
#[derive(Error, Debug)]
pub enum HoodError {
    /// Startup configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The randomness source failed while generating our id
    #[error("failed to generate local ID: {0}")]
    Randomness(#[source] rand::Error),

    /// Every port candidate was taken
    #[error("listening failed")]
    ListeningFailed,

    /// Binding failed for a reason other than a taken port
    #[error(transparent)]
    Bind(#[from] ConnectionError),

    /// A neighbour's transport refused the payload
    #[error("failed to send to {}: {source}", .id.short())]
    Send {
        /// Neighbour
        id: PeerId,
        /// Transport failure
        #[source]
        source: FramerError,
    },

    /// A discovery plugin reported a failure
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The hood has already left
    #[error("hood is closed")]
    Closed,
}

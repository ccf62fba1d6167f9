//! Wire protocol for tubemail: block framing and the message registry.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 block_len (BE)   | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 tag               | message kind               |
//! +----------------------+----------------------------+
//! | payload              | kind specific (0..N)       |
//! +----------------------+----------------------------+
//! ```
//!
//! The framer ([`frame`]) only knows about the length prefix. The tag and
//! payload are interpreted by [`message`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod id;
pub mod message;

// Re-export main types
pub use error::WireError;
pub use frame::{encode_block, BlockDecoder, DEFAULT_MAX_BLOCK_SIZE, LENGTH_PREFIX_SIZE};
pub use id::{PeerId, ID_HEX_SIZE, ID_SIZE};
pub use message::{Iam, Message, MessageKind, NeighAnnounce, HELLO_MAGIC};

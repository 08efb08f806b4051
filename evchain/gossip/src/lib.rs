//! Gossip transport between off-chain replicas.
//!
//! A SWIM-style membership layer over UDP carries a fragmented, compressed,
//! retransmitting datagram bus. Large messages are split into CRC-guarded
//! frames sharing a random 128-bit stream id; receivers reassemble them in
//! any order. Reliable unicast rides a TCP side channel on the same port.

pub mod config;
pub mod crypto;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod membership;
pub mod queue;
pub mod router;
pub mod transport;

pub use config::GossipConfig;
pub use decoder::StreamDecoder;
pub use error::{FrameError, GossipError};
pub use frame::{max_data_bytes, Frame, MAX_FRAME_COUNT};
pub use membership::{ControlMessage, Member, Membership};
pub use queue::FrameQueue;
pub use router::{FrameRouter, InboundMessage};
pub use transport::GossipTransport;

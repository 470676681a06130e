//! Backhaul Protocol Definitions
//!
//! This crate defines the frames exchanged on an agent control stream and on
//! the streaming-tunnel frontend, together with the length-prefixed codec
//! both ends use to put them on the wire.

pub mod codec;
pub mod duration_secs;
pub mod frame;

pub use codec::{CodecError, FrameCodec};
pub use frame::{AgentMetadata, ConnectionId, Frame};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

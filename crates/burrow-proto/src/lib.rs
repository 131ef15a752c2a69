//! Tunnel Protocol Definitions
//!
//! This crate defines the frame types exchanged over burrow tunnels and the
//! length-prefixed codec both peers use to put them on the wire.

pub mod codec;
pub mod messages;
pub mod stream;

pub use codec::{CodecError, FrameCodec};
pub use messages::{
    AgentMessage, CommandChannel, Endpoint, HttpHeader, ToolMessage, CONTENT_LENGTH_CHUNKED,
};
pub use stream::{split_stream, MessageSink, MessageSource, MessageStream};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

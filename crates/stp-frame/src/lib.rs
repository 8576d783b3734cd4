//! Length-prefixed binary framing for the Scope Transport Protocol.
//!
//! Every STP message travels as one frame:
//! - A 2-byte magic number ("ST") for stream synchronization
//! - A 4-byte little-endian envelope length
//! - The envelope: status, correlation tag, command id, service name, payload
//!
//! Decoding is resumable: feed bytes as they arrive, take frames as they
//! complete. No partial reads, no buffer management in user code.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod error;
pub mod reader;
pub mod status;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::StpCodec;
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameDecoder, DEFAULT_MAX_FRAME,
    ENVELOPE_FIXED_SIZE, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use status::{Status, SCOPE_SERVICE};
pub use writer::FrameWriter;

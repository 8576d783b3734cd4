use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// `tokio_util` codec for STP frames.
///
/// Wrap any `AsyncRead + AsyncWrite` in `Framed::new(io, StpCodec::default())`
/// to get a `Stream` of frames and a `Sink` accepting them.
#[derive(Debug, Clone)]
pub struct StpCodec {
    max_frame_size: usize,
}

impl StpCodec {
    /// Create a codec with an explicit maximum envelope size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Create a codec from a frame configuration.
    pub fn with_config(config: &FrameConfig) -> Self {
        Self::new(config.max_frame_size)
    }
}

impl Default for StpCodec {
    fn default() -> Self {
        Self::with_config(&FrameConfig::default())
    }
}

impl Decoder for StpCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.max_frame_size)
    }
}

impl Encoder<Frame> for StpCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.envelope_size() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: item.envelope_size(),
                max: self.max_frame_size,
            });
        }
        encode_frame(&item, dst)
    }
}

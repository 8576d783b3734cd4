/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x5354 \"ST\")")]
    InvalidMagic,

    /// The envelope length exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An inbound frame exceeded the maximum size and is being discarded.
    /// Only returned by [`FrameDecoder`](crate::FrameDecoder), which skips
    /// the envelope bytes without buffering them.
    #[error("dropped oversized frame ({size} bytes, max {max})")]
    OversizedFrameSkipped { size: usize, max: usize },

    /// The envelope is structurally invalid but correctly delimited.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope carries a status byte this codec does not know.
    #[error("unknown frame status {0}")]
    UnknownStatus(u8),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the byte stream can no longer be decoded after this error.
    ///
    /// Malformed envelopes, unknown statuses and skipped oversized frames
    /// are delimited by a valid length prefix, so decoding resumes after
    /// them. Everything else loses stream synchronization.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FrameError::MalformedEnvelope(_)
                | FrameError::UnknownStatus(_)
                | FrameError::OversizedFrameSkipped { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

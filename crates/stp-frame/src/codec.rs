use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::status::{Status, MAX_SERVICE_NAME_LEN};

/// Frame header: magic (2) + envelope length (4) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Magic bytes: "ST" (0x53 0x54).
pub const MAGIC: [u8; 2] = [0x53, 0x54];

/// Fixed part of the envelope: status (1) + tag (4) + command id (4) + name length (2).
pub const ENVELOPE_FIXED_SIZE: usize = 11;

/// Default maximum envelope size: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// One STP message: a command, a response, or an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Service the message belongs to (e.g. `exec`, `window-manager`).
    pub service: String,
    /// Numeric command id within the service.
    pub command_id: u32,
    /// Correlation tag. Zero on events.
    pub tag: u32,
    /// Message kind.
    pub status: Status,
    /// Opaque serialized payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(
        service: impl Into<String>,
        command_id: u32,
        tag: u32,
        status: Status,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            command_id,
            tag,
            status,
            payload: payload.into(),
        }
    }

    /// Create an outbound command frame.
    pub fn command(
        service: impl Into<String>,
        command_id: u32,
        tag: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(service, command_id, tag, Status::Command, payload)
    }

    /// Create an event frame.
    pub fn event(service: impl Into<String>, command_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(service, command_id, 0, Status::Event, payload)
    }

    /// Build the successful reply to this frame.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(
            self.service.clone(),
            self.command_id,
            self.tag,
            Status::Ok,
            payload,
        )
    }

    /// Build the error reply to this frame.
    pub fn reply_error(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(
            self.service.clone(),
            self.command_id,
            self.tag,
            Status::Error,
            payload,
        )
    }

    /// Size of the envelope (everything after the header).
    pub fn envelope_size(&self) -> usize {
        ENVELOPE_FIXED_SIZE + self.service.len() + self.payload.len()
    }

    /// The total wire size of this frame (header + envelope).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.envelope_size()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (integers little-endian):
/// ```text
/// ┌────────────┬────────────┬────────┬─────────┬──────────┬──────────┬─────────┬─────────┐
/// │ Magic (2B) │ Length(4B) │ Status │ Tag     │ Command  │ Name len │ Service │ Payload │
/// │ "ST"       │ envelope   │ (1B)   │ (4B)    │ id (4B)  │ (2B)     │ UTF-8   │         │
/// └────────────┴────────────┴────────┴─────────┴──────────┴──────────┴─────────┴─────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.service.len() > MAX_SERVICE_NAME_LEN {
        return Err(FrameError::MalformedEnvelope(format!(
            "service name too long ({} bytes)",
            frame.service.len()
        )));
    }

    let envelope = frame.envelope_size();
    if envelope > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: envelope,
            max: u32::MAX as usize,
        });
    }

    dst.reserve(HEADER_SIZE + envelope);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(envelope as u32);
    dst.put_u8(frame.status.as_u8());
    dst.put_u32_le(frame.tag);
    dst.put_u32_le(frame.command_id);
    dst.put_u16_le(frame.service.len() as u16);
    dst.put_slice(frame.service.as_bytes());
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A recoverable error
/// (see [`FrameError::is_fatal`]) also consumes the offending frame, so the
/// caller may keep decoding.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let envelope_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    if envelope_len > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: envelope_len,
            max: max_frame_size,
        });
    }

    let total = HEADER_SIZE + envelope_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let envelope = src.split_to(envelope_len).freeze();
    parse_envelope(envelope).map(Some)
}

fn parse_envelope(mut envelope: Bytes) -> Result<Frame> {
    if envelope.len() < ENVELOPE_FIXED_SIZE {
        return Err(FrameError::MalformedEnvelope(format!(
            "envelope of {} bytes is shorter than the fixed {ENVELOPE_FIXED_SIZE}",
            envelope.len()
        )));
    }

    let status = envelope.get_u8();
    let tag = envelope.get_u32_le();
    let command_id = envelope.get_u32_le();
    let name_len = envelope.get_u16_le() as usize;

    if name_len > envelope.len() {
        return Err(FrameError::MalformedEnvelope(format!(
            "service name length {name_len} overruns envelope ({} bytes left)",
            envelope.len()
        )));
    }

    let name = envelope.split_to(name_len);
    let service = std::str::from_utf8(&name)
        .map_err(|_| FrameError::MalformedEnvelope("service name is not UTF-8".to_string()))?
        .to_string();
    let status = Status::try_from(status)?;

    Ok(Frame {
        service,
        command_id,
        tag,
        status,
        payload: envelope,
    })
}

/// Resumable decoder over a growing receive buffer.
///
/// Bytes arrive in arbitrary chunks; [`feed`](Self::feed) appends them and
/// [`next_frame`](Self::next_frame) yields complete frames until it returns
/// `Ok(None)`, leaving any trailing partial frame buffered.
///
/// A frame whose length prefix exceeds the maximum is reported once as
/// [`FrameError::OversizedFrameSkipped`]; its envelope bytes are then
/// discarded as they arrive, never buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
    /// Envelope bytes of an oversized frame still to be discarded.
    /// While non-zero, `buf` is empty.
    skip: usize,
}

impl FrameDecoder {
    /// Create a decoder with the given maximum envelope size.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
            skip: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        let skipped = bytes.len().min(self.skip);
        self.skip -= skipped;
        self.buf.extend_from_slice(&bytes[skipped..]);
    }

    /// Decode the next complete frame, if any.
    ///
    /// After a fatal error the buffer is left untouched and further calls
    /// return the same error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.skip > 0 {
            return Ok(None);
        }

        match decode_frame(&mut self.buf, self.max_frame_size) {
            Err(FrameError::FrameTooLarge { size, max }) => {
                self.buf.advance(HEADER_SIZE);
                let dropped = self.buf.len().min(size);
                self.buf.advance(dropped);
                self.skip = size - dropped;
                Err(FrameError::OversizedFrameSkipped { size, max })
            }
            other => other,
        }
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True while the rest of an oversized frame is being discarded.
    pub fn is_skipping(&self) -> bool {
        self.skip > 0
    }

    /// Drop all buffered bytes and any pending discard.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.skip = 0;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum envelope size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

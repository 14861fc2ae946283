//! Streaming framer for backend messages.
//!
//! [`MessageDecoder`] pulls complete messages off the front of a receive
//! buffer. It keeps the little state protocol 2 needs to find message
//! boundaries: the field count of the last RowDescription, and whether a
//! raw COPY OUT is in progress.

use bytes::{Buf, BytesMut};

use super::backend::BackendMessage;
use super::error::{BackendError, PgError, PgResult};
use super::protocol::COPY_TERMINATOR;
use super::types::ProtocolVersion;

/// Largest message body accepted from the server.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Length bytes of a protocol 3 ErrorResponse that is really a protocol 2
/// `"FATAL:  ..."` string from a server that rejected the v3 startup.
const LEGACY_ERROR_MARKER: &[u8; 4] = b"FATA";

/// Incremental backend message decoder.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    version: ProtocolVersion,
    row_fields: Option<usize>,
    raw_copy_out: bool,
}

impl MessageDecoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            row_fields: None,
            raw_copy_out: false,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switch protocol version; clears framing state.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.row_fields = None;
        self.raw_copy_out = false;
    }

    /// Whether a protocol 2 COPY OUT line stream is being read.
    pub fn in_raw_copy_out(&self) -> bool {
        self.raw_copy_out
    }

    /// Decode the next complete message, consuming its bytes.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a message; the
    /// caller reads more and tries again.
    pub fn decode(&mut self, buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
        let msg = match self.version {
            ProtocolVersion::V3 => self.decode_v3(buf)?,
            ProtocolVersion::V2 if self.raw_copy_out => self.decode_copy_line(buf),
            ProtocolVersion::V2 => self.decode_v2(buf)?,
        };

        match &msg {
            Some(BackendMessage::RowDescription(desc)) => self.row_fields = Some(desc.len()),
            Some(BackendMessage::CopyOutResponse(_)) if self.version == ProtocolVersion::V2 => {
                self.raw_copy_out = true;
            }
            _ => {}
        }
        Ok(msg)
    }

    fn decode_v3(&mut self, buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
        if buf.len() < 5 {
            return Ok(None);
        }

        let tag = buf[0];
        if tag == b'E' && &buf[1..5] == LEGACY_ERROR_MARKER {
            return Self::decode_legacy_error(buf);
        }

        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgError::Protocol(format!(
                "Invalid message length {} for message type {}",
                len, tag as char
            )));
        }

        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        frame.advance(5);
        BackendMessage::decode_v3(tag, frame).map(Some)
    }

    /// A pre-7.4 server answers a v3 startup with a bare v2 error string.
    fn decode_legacy_error(buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
        let Some(end) = buf[1..].iter().position(|b| *b == 0) else {
            if buf.len() > MAX_MESSAGE_LEN {
                return Err(PgError::Protocol(
                    "Unterminated protocol 2 error message".to_string(),
                ));
            }
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&buf[1..1 + end]).into_owned();
        buf.advance(end + 2);
        Ok(Some(BackendMessage::ErrorResponse(BackendError::from_legacy(
            &text,
        ))))
    }

    fn decode_v2(&mut self, buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
        match BackendMessage::decode_v2(buf, self.row_fields)? {
            Some((msg, used)) => {
                buf.advance(used);
                Ok(Some(msg))
            }
            None => {
                if buf.len() > MAX_MESSAGE_LEN {
                    return Err(PgError::Protocol(
                        "Protocol 2 message exceeds maximum length".to_string(),
                    ));
                }
                Ok(None)
            }
        }
    }

    fn decode_copy_line(&mut self, buf: &mut BytesMut) -> Option<BackendMessage> {
        let end = buf.iter().position(|b| *b == b'\n')?;
        let line = buf.split_to(end + 1).freeze();
        if &line[..] == COPY_TERMINATOR {
            self.raw_copy_out = false;
            Some(BackendMessage::CopyDone)
        } else {
            Some(BackendMessage::CopyData(line))
        }
    }
}

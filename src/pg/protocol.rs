//! PostgreSQL wire protocol frontend message encoding and decoding.
//!
//! Protocol 3 messages are a tag byte followed by a big-endian length that
//! includes itself. Startup, SSLRequest and CancelRequest carry no tag.
//! Protocol 2 has no length word on tagged messages and a fixed-width
//! startup packet.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};
use super::types::{Format, Oid, ProtocolVersion};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Code sent in place of a protocol version to ask for TLS.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Code sent in place of a protocol version to cancel a running query.
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678;

/// Terminator line ending protocol 2 COPY data.
pub const COPY_TERMINATOR: &[u8] = b"\\.\n";

/// Fixed length of a protocol 2 startup packet.
pub const STARTUP_V2_LEN: usize = 296;

const SM_DATABASE: usize = 64;
const SM_USER: usize = 32;
const SM_OPTIONS: usize = 64;
const SM_UNUSED: usize = 64;
const SM_TTY: usize = 64;

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Append the encoded message to `buf`.
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()>;

    /// Encode into a fresh buffer.
    fn encode(&self, version: ProtocolVersion) -> PgResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode_to(version, &mut buf)?;
        Ok(buf)
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => {
                let start = buf.len();
                // Placeholder for length (will be filled in at the end)
                buf.put_i32(0);
                buf.put_i32(ProtocolVersion::V3.code());

                put_cstr(buf, "user")?;
                put_cstr(buf, &self.user)?;

                if let Some(ref db) = self.database {
                    put_cstr(buf, "database")?;
                    put_cstr(buf, db)?;
                }

                for (key, value) in &self.options {
                    put_cstr(buf, key)?;
                    put_cstr(buf, value)?;
                }

                // Terminator
                buf.put_u8(0);
                patch_len(buf, start)
            }
            ProtocolVersion::V2 => {
                buf.put_i32(STARTUP_V2_LEN as i32);
                buf.put_i32(ProtocolVersion::V2.code());
                let options = self
                    .options
                    .iter()
                    .find(|(k, _)| k == "options")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("");
                put_fixed(buf, self.database.as_deref().unwrap_or(""), SM_DATABASE)?;
                put_fixed(buf, &self.user, SM_USER)?;
                put_fixed(buf, options, SM_OPTIONS)?;
                put_fixed(buf, "", SM_UNUSED)?;
                put_fixed(buf, "", SM_TTY)?;
                Ok(())
            }
        }
    }
}

/// SSLRequest, sent before the startup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    fn encode_to(&self, _version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        Ok(())
    }
}

/// CancelRequest, sent on a fresh connection instead of a startup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode_to(&self, _version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
        Ok(())
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => tagged(buf, b'p', |body| put_cstr(body, &self.password)),
            ProtocolVersion::V2 => {
                // Untagged packet: length + string
                let start = buf.len();
                buf.put_i32(0);
                put_cstr(buf, &self.password)?;
                patch_len(buf, start)
            }
        }
    }
}

/// Raw token for GSSAPI/SSPI negotiation ('p').
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GssResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for GssResponseMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "GSS/SSPI authentication")?;
        tagged(buf, b'p', |body| {
            body.put_slice(&self.data);
            Ok(())
        })
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMessage {
    pub query: String,
}

impl QueryMessage {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

impl FrontendMessage for QueryMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => tagged(buf, b'Q', |body| put_cstr(body, &self.query)),
            ProtocolVersion::V2 => {
                buf.put_u8(b'Q');
                put_cstr(buf, &self.query)
            }
        }
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Parse")?;
        tagged(buf, b'P', |body| {
            put_cstr(body, &self.name)?;
            put_cstr(body, &self.query)?;
            put_count(body, self.param_types.len())?;
            for oid in &self.param_types {
                body.put_i32(oid.as_i32());
            }
            Ok(())
        })
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
///
/// Parameter values are already serialized; `None` is sent as NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Bind")?;
        tagged(buf, b'B', |body| {
            put_cstr(body, &self.portal)?;
            put_cstr(body, &self.statement)?;

            put_count(body, self.param_formats.len())?;
            for fmt in &self.param_formats {
                body.put_i16(*fmt as i16);
            }

            put_count(body, self.params.len())?;
            for param in &self.params {
                match param {
                    None => body.put_i32(-1),
                    Some(value) => {
                        let len = i32::try_from(value.len()).map_err(|_| {
                            PgError::Protocol("Bind parameter too large".to_string())
                        })?;
                        body.put_i32(len);
                        body.put_slice(value);
                    }
                }
            }

            put_count(body, self.result_formats.len())?;
            for fmt in &self.result_formats {
                body.put_i16(*fmt as i16);
            }
            Ok(())
        })
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl DescribeMessage {
    pub fn statement(name: impl Into<String>) -> Self {
        Self {
            kind: b'S',
            name: name.into(),
        }
    }

    pub fn portal(name: impl Into<String>) -> Self {
        Self {
            kind: b'P',
            name: name.into(),
        }
    }
}

impl FrontendMessage for DescribeMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Describe")?;
        tagged(buf, b'D', |body| {
            body.put_u8(self.kind);
            put_cstr(body, &self.name)
        })
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Close")?;
        tagged(buf, b'C', |body| {
            body.put_u8(self.kind);
            put_cstr(body, &self.name)
        })
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Execute")?;
        tagged(buf, b'E', |body| {
            put_cstr(body, &self.portal)?;
            body.put_i32(self.max_rows);
            Ok(())
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Sync")?;
        tagged(buf, b'S', |_| Ok(()))
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "Flush")?;
        tagged(buf, b'H', |_| Ok(()))
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => tagged(buf, b'X', |_| Ok(())),
            ProtocolVersion::V2 => {
                buf.put_u8(b'X');
                Ok(())
            }
        }
    }
}

/// CopyData ('d'). Under protocol 2 the payload is written raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDataMessage {
    pub data: Bytes,
}

impl FrontendMessage for CopyDataMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => tagged(buf, b'd', |body| {
                body.put_slice(&self.data);
                Ok(())
            }),
            ProtocolVersion::V2 => {
                buf.put_slice(&self.data);
                Ok(())
            }
        }
    }
}

/// CopyDone ('c'). Under protocol 2 this is the `\.` terminator line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => tagged(buf, b'c', |_| Ok(())),
            ProtocolVersion::V2 => {
                buf.put_slice(COPY_TERMINATOR);
                Ok(())
            }
        }
    }
}

/// CopyFail ('f') - Abort a COPY FROM STDIN with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailMessage {
    pub reason: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        require_v3(version, "CopyFail")?;
        tagged(buf, b'f', |body| put_cstr(body, &self.reason))
    }
}

// ============================================================================
// Frontend message decoding
// ============================================================================

/// Any frontend message, as seen by a backend.
///
/// Decoding is the mirror of encoding; the connector itself never needs
/// it, but scripted backends and round-trip checks do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frontend {
    Startup(StartupMessage),
    SslRequest,
    CancelRequest(CancelRequestMessage),
    Password(PasswordMessage),
    GssResponse(GssResponseMessage),
    Query(QueryMessage),
    Parse(ParseMessage),
    Bind(BindMessage),
    Describe(DescribeMessage),
    Close(CloseMessage),
    Execute(ExecuteMessage),
    Sync,
    Flush,
    Terminate,
    CopyData(CopyDataMessage),
    CopyDone,
    CopyFail(CopyFailMessage),
}

impl Frontend {
    /// Decode one untagged packet (startup, SSL or cancel request).
    ///
    /// Returns `Ok(None)` until the whole packet is buffered.
    pub fn decode_startup(buf: &mut BytesMut) -> PgResult<Option<Frontend>> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if !(8..=10_000).contains(&len) {
            return Err(PgError::Protocol(format!("Invalid startup packet length: {}", len)));
        }
        let len = len as usize;
        if buf.len() < len {
            return Ok(None);
        }
        let mut body = buf.split_to(len).freeze();
        body.advance(4);
        let code = body.get_i32();

        let msg = match code {
            SSL_REQUEST_CODE => Frontend::SslRequest,
            CANCEL_REQUEST_CODE => {
                ensure_remaining(&body, 8)?;
                Frontend::CancelRequest(CancelRequestMessage {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            code if code == ProtocolVersion::V3.code() => {
                let mut user = String::new();
                let mut database = None;
                let mut options = Vec::new();
                loop {
                    let key = read_cstring(&mut body)?;
                    if key.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut body)?;
                    match key.as_str() {
                        "user" => user = value,
                        "database" => database = Some(value),
                        _ => options.push((key, value)),
                    }
                }
                Frontend::Startup(StartupMessage {
                    user,
                    database,
                    options,
                })
            }
            code if code == ProtocolVersion::V2.code() => {
                ensure_remaining(&body, STARTUP_V2_LEN - 8)?;
                let database = read_fixed(&mut body, SM_DATABASE);
                let user = read_fixed(&mut body, SM_USER);
                let opts = read_fixed(&mut body, SM_OPTIONS);
                let mut options = Vec::new();
                if !opts.is_empty() {
                    options.push(("options".to_string(), opts));
                }
                Frontend::Startup(StartupMessage {
                    user,
                    database: if database.is_empty() {
                        None
                    } else {
                        Some(database)
                    },
                    options,
                })
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unknown startup code: {}",
                    other
                )))
            }
        };
        Ok(Some(msg))
    }

    /// Decode one tagged message.
    ///
    /// Under protocol 2 only Query and Terminate are framed well enough to
    /// be decoded from a stream. Returns `Ok(None)` until the message is
    /// complete.
    pub fn decode(buf: &mut BytesMut, version: ProtocolVersion) -> PgResult<Option<Frontend>> {
        match version {
            ProtocolVersion::V3 => Self::decode_v3(buf),
            ProtocolVersion::V2 => Self::decode_v2(buf),
        }
    }

    fn decode_v3(buf: &mut BytesMut) -> PgResult<Option<Frontend>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let tag = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", len)));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let mut body = buf.split_to(total).freeze();
        body.advance(5);

        let msg = match tag {
            b'p' => {
                // A password is a single NUL-terminated string; anything else
                // is a raw negotiation token.
                let is_cstring = body.last() == Some(&0)
                    && body.iter().filter(|b| **b == 0).count() == 1;
                if is_cstring {
                    Frontend::Password(PasswordMessage {
                        password: read_cstring(&mut body)?,
                    })
                } else {
                    Frontend::GssResponse(GssResponseMessage {
                        data: body.to_vec(),
                    })
                }
            }
            b'Q' => Frontend::Query(QueryMessage {
                query: read_cstring(&mut body)?,
            }),
            b'P' => {
                let name = read_cstring(&mut body)?;
                let query = read_cstring(&mut body)?;
                ensure_remaining(&body, 2)?;
                let count = body.get_i16().max(0) as usize;
                ensure_remaining(&body, count * 4)?;
                let param_types = (0..count).map(|_| Oid(body.get_i32())).collect();
                Frontend::Parse(ParseMessage {
                    name,
                    query,
                    param_types,
                })
            }
            b'B' => {
                let portal = read_cstring(&mut body)?;
                let statement = read_cstring(&mut body)?;
                let param_formats = read_formats(&mut body)?;
                ensure_remaining(&body, 2)?;
                let count = body.get_i16().max(0) as usize;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure_remaining(&body, 4)?;
                    let len = body.get_i32();
                    if len < 0 {
                        params.push(None);
                    } else {
                        ensure_remaining(&body, len as usize)?;
                        params.push(Some(body.split_to(len as usize)));
                    }
                }
                let result_formats = read_formats(&mut body)?;
                Frontend::Bind(BindMessage {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                })
            }
            b'D' | b'C' => {
                ensure_remaining(&body, 1)?;
                let kind = body.get_u8();
                let name = read_cstring(&mut body)?;
                if tag == b'D' {
                    Frontend::Describe(DescribeMessage { kind, name })
                } else {
                    Frontend::Close(CloseMessage { kind, name })
                }
            }
            b'E' => {
                let portal = read_cstring(&mut body)?;
                ensure_remaining(&body, 4)?;
                Frontend::Execute(ExecuteMessage {
                    portal,
                    max_rows: body.get_i32(),
                })
            }
            b'S' => Frontend::Sync,
            b'H' => Frontend::Flush,
            b'X' => Frontend::Terminate,
            b'd' => Frontend::CopyData(CopyDataMessage { data: body }),
            b'c' => Frontend::CopyDone,
            b'f' => Frontend::CopyFail(CopyFailMessage {
                reason: read_cstring(&mut body)?,
            }),
            other => {
                return Err(PgError::Protocol(format!(
                    "Unknown frontend message type: {}",
                    other as char
                )))
            }
        };
        Ok(Some(msg))
    }

    fn decode_v2(buf: &mut BytesMut) -> PgResult<Option<Frontend>> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };
        match tag {
            b'X' => {
                buf.advance(1);
                Ok(Some(Frontend::Terminate))
            }
            b'Q' => match buf[1..].iter().position(|b| *b == 0) {
                None => Ok(None),
                Some(end) => {
                    let query = String::from_utf8_lossy(&buf[1..1 + end]).into_owned();
                    buf.advance(end + 2);
                    Ok(Some(Frontend::Query(QueryMessage { query })))
                }
            },
            other => Err(PgError::Protocol(format!(
                "Unsupported protocol 2 frontend message: {}",
                other as char
            ))),
        }
    }
}

impl FrontendMessage for Frontend {
    fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match self {
            Frontend::Startup(m) => m.encode_to(version, buf),
            Frontend::SslRequest => SslRequestMessage.encode_to(version, buf),
            Frontend::CancelRequest(m) => m.encode_to(version, buf),
            Frontend::Password(m) => m.encode_to(version, buf),
            Frontend::GssResponse(m) => m.encode_to(version, buf),
            Frontend::Query(m) => m.encode_to(version, buf),
            Frontend::Parse(m) => m.encode_to(version, buf),
            Frontend::Bind(m) => m.encode_to(version, buf),
            Frontend::Describe(m) => m.encode_to(version, buf),
            Frontend::Close(m) => m.encode_to(version, buf),
            Frontend::Execute(m) => m.encode_to(version, buf),
            Frontend::Sync => SyncMessage.encode_to(version, buf),
            Frontend::Flush => FlushMessage.encode_to(version, buf),
            Frontend::Terminate => TerminateMessage.encode_to(version, buf),
            Frontend::CopyData(m) => m.encode_to(version, buf),
            Frontend::CopyDone => CopyDoneMessage.encode_to(version, buf),
            Frontend::CopyFail(m) => m.encode_to(version, buf),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Write `tag`, a length placeholder and the body produced by `f`, then
/// patch the length.
pub(crate) fn tagged<F>(buf: &mut BytesMut, tag: u8, f: F) -> PgResult<()>
where
    F: FnOnce(&mut BytesMut) -> PgResult<()>,
{
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    f(buf)?;
    patch_len(buf, start)
}

/// Fill in the 4-byte length at `start` (length includes itself).
pub(crate) fn patch_len(buf: &mut BytesMut, start: usize) -> PgResult<()> {
    let len = i32::try_from(buf.len() - start)
        .map_err(|_| PgError::Protocol("Message too large".to_string()))?;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Write a NUL-terminated string.
pub(crate) fn put_cstr(buf: &mut BytesMut, s: &str) -> PgResult<()> {
    if s.as_bytes().contains(&0) {
        return Err(PgError::Protocol(
            "String contains an embedded NUL byte".to_string(),
        ));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

pub(crate) fn put_count(buf: &mut BytesMut, count: usize) -> PgResult<()> {
    let count = i16::try_from(count)
        .map_err(|_| PgError::Protocol(format!("Too many items for one message: {}", count)))?;
    buf.put_i16(count);
    Ok(())
}

/// Write `s` NUL-padded to exactly `width` bytes (protocol 2 startup).
fn put_fixed(buf: &mut BytesMut, s: &str, width: usize) -> PgResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= width {
        return Err(PgError::Config(format!(
            "'{}' does not fit the {}-byte protocol 2 startup field",
            s, width
        )));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

fn read_fixed(buf: &mut Bytes, width: usize) -> String {
    let field = buf.split_to(width);
    let end = field.iter().position(|b| *b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_formats(body: &mut Bytes) -> PgResult<Vec<Format>> {
    ensure_remaining(body, 2)?;
    let count = body.get_i16().max(0) as usize;
    ensure_remaining(body, count * 2)?;
    Ok((0..count).map(|_| Format::from_i16(body.get_i16())).collect())
}

fn require_v3(version: ProtocolVersion, what: &str) -> PgResult<()> {
    match version {
        ProtocolVersion::V3 => Ok(()),
        ProtocolVersion::V2 => Err(PgError::Unsupported(format!(
            "{} requires protocol version 3",
            what
        ))),
    }
}

pub(crate) fn ensure_remaining(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol("Message body truncated".to_string()));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
pub(crate) fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

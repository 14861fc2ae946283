//! Backend (server -> client) messages.
//!
//! Protocol 3 bodies arrive already framed by their length word and are
//! decoded with [`BackendMessage::decode_v3`]. Protocol 2 messages carry no
//! length, so [`BackendMessage::decode_v2`] parses straight from the receive
//! buffer and reports how many bytes it consumed, or `None` when the buffer
//! does not yet hold a complete message.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::copy::CopyFormat;
use super::error::{BackendError, PgError, PgResult};
use super::protocol::{ensure_remaining, put_count, put_cstr, read_cstring, tagged};
use super::types::{Format, Oid, ProtocolVersion, TransactionStatus};

/// Raw field values of one row; `None` is SQL NULL.
pub type RowValues = SmallVec<[Option<Bytes>; 16]>;

// ============================================================================
// Authentication
// ============================================================================

/// Sub-code of an `R` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationRequest {
    Ok,
    KerberosV4,
    KerberosV5,
    Cleartext,
    Crypt { salt: [u8; 2] },
    Md5 { salt: [u8; 4] },
    ScmCredential,
    Gss,
    GssContinue { data: Bytes },
    Sspi,
    /// Any other code (SASL included); the handshake fails on it.
    Unknown(i32),
}

impl AuthenticationRequest {
    pub fn code(&self) -> i32 {
        match self {
            AuthenticationRequest::Ok => 0,
            AuthenticationRequest::KerberosV4 => 1,
            AuthenticationRequest::KerberosV5 => 2,
            AuthenticationRequest::Cleartext => 3,
            AuthenticationRequest::Crypt { .. } => 4,
            AuthenticationRequest::Md5 { .. } => 5,
            AuthenticationRequest::ScmCredential => 6,
            AuthenticationRequest::Gss => 7,
            AuthenticationRequest::GssContinue { .. } => 8,
            AuthenticationRequest::Sspi => 9,
            AuthenticationRequest::Unknown(code) => *code,
        }
    }

    fn put_body(&self, buf: &mut BytesMut) {
        buf.put_i32(self.code());
        match self {
            AuthenticationRequest::Crypt { salt } => buf.put_slice(salt),
            AuthenticationRequest::Md5 { salt } => buf.put_slice(salt),
            AuthenticationRequest::GssContinue { data } => buf.put_slice(data),
            _ => {}
        }
    }
}

// ============================================================================
// Row description
// ============================================================================

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Ordered field metadata of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub fn new(fields: Vec<FieldDescription>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&FieldDescription> {
        self.fields.get(index)
    }

    /// Index of the first field named `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldDescription> {
        self.fields.iter()
    }
}

// ============================================================================
// Backend messages
// ============================================================================

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(AuthenticationRequest),
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Query responses
    RowDescription(RowDescription),
    /// Protocol 3 row.
    DataRow {
        values: RowValues,
    },
    /// Protocol 2 text row.
    AsciiRow {
        values: RowValues,
    },
    /// Protocol 2 binary-cursor row.
    BinaryRow {
        values: RowValues,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,
    /// Protocol 2 cursor name echo.
    CursorResponse {
        name: String,
    },

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },

    // Errors and notices
    ErrorResponse(BackendError),
    NoticeResponse(BackendError),

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },

    // COPY
    CopyInResponse(CopyFormat),
    CopyOutResponse(CopyFormat),
    CopyData(Bytes),
    CopyDone,
}

impl BackendMessage {
    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::Authentication(_) => "Authentication",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::AsciiRow { .. } => "AsciiRow",
            BackendMessage::BinaryRow { .. } => "BinaryRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::CursorResponse { .. } => "CursorResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
            BackendMessage::CopyInResponse(_) => "CopyInResponse",
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
        }
    }

    /// Decode a protocol 3 message body whose tag and length were already
    /// consumed by the framer.
    pub fn decode_v3(tag: u8, mut body: Bytes) -> PgResult<Self> {
        match tag {
            b'R' => Self::decode_auth(&mut body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            }),
            b'Z' => {
                ensure_remaining(&body, 1)?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse(BackendError::from_fields(
                &read_error_fields(body)?,
            ))),
            b'N' => Ok(BackendMessage::NoticeResponse(BackendError::from_fields(
                &read_error_fields(body)?,
            ))),
            b'S' => {
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                ensure_remaining(&body, 8)?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => {
                ensure_remaining(&body, 2)?;
                let count = body.get_i16().max(0) as usize;
                ensure_remaining(&body, count * 4)?;
                let type_oids = (0..count).map(|_| Oid::from_i32(body.get_i32())).collect();
                Ok(BackendMessage::ParameterDescription { type_oids })
            }
            b'A' => {
                ensure_remaining(&body, 4)?;
                let process_id = body.get_i32();
                let channel = read_cstring(&mut body)?;
                let payload = read_cstring(&mut body)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                })
            }
            b'G' => Ok(BackendMessage::CopyInResponse(Self::decode_copy_format(body)?)),
            b'H' => Ok(BackendMessage::CopyOutResponse(Self::decode_copy_format(
                body,
            )?)),
            b'd' => Ok(BackendMessage::CopyData(body)),
            b'c' => Ok(BackendMessage::CopyDone),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                tag as char
            ))),
        }
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        ensure_remaining(body, 4)?;
        let auth_type = body.get_i32();

        let request = match auth_type {
            0 => AuthenticationRequest::Ok,
            1 => AuthenticationRequest::KerberosV4,
            2 => AuthenticationRequest::KerberosV5,
            3 => AuthenticationRequest::Cleartext,
            4 => {
                ensure_remaining(body, 2)?;
                let mut salt = [0u8; 2];
                body.copy_to_slice(&mut salt);
                AuthenticationRequest::Crypt { salt }
            }
            5 => {
                ensure_remaining(body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                AuthenticationRequest::Md5 { salt }
            }
            6 => AuthenticationRequest::ScmCredential,
            7 => AuthenticationRequest::Gss,
            8 => AuthenticationRequest::GssContinue {
                data: body.split_off(0),
            },
            9 => AuthenticationRequest::Sspi,
            other => AuthenticationRequest::Unknown(other),
        };
        Ok(BackendMessage::Authentication(request))
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        ensure_remaining(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            ensure_remaining(&body, 18)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = Format::from_i16(body.get_i16());

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription(RowDescription { fields }))
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        ensure_remaining(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = RowValues::with_capacity(num_cols);

        for _ in 0..num_cols {
            ensure_remaining(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                ensure_remaining(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_copy_format(mut body: Bytes) -> PgResult<CopyFormat> {
        ensure_remaining(&body, 3)?;
        let binary = body.get_i8() != 0;
        let count = body.get_i16().max(0) as usize;
        ensure_remaining(&body, count * 2)?;
        let column_formats = (0..count).map(|_| Format::from_i16(body.get_i16())).collect();
        Ok(CopyFormat {
            binary,
            column_formats,
        })
    }

    /// Try to decode one protocol 2 message from the front of `buf`.
    ///
    /// `row_fields` is the field count of the last RowDescription, needed
    /// to size the null bitmap of AsciiRow/BinaryRow. Returns the message
    /// and the number of bytes it occupied, or `None` if more input is
    /// needed. Nothing is consumed.
    pub fn decode_v2(buf: &[u8], row_fields: Option<usize>) -> PgResult<Option<(Self, usize)>> {
        let mut cur = Cursor { buf, pos: 0 };
        match Self::parse_v2(&mut cur, row_fields) {
            Ok(msg) => Ok(Some((msg, cur.pos))),
            Err(V2Error::Incomplete) => Ok(None),
            Err(V2Error::Invalid(e)) => Err(e),
        }
    }

    fn parse_v2(cur: &mut Cursor<'_>, row_fields: Option<usize>) -> Result<Self, V2Error> {
        let tag = cur.u8()?;
        let msg = match tag {
            b'R' => {
                let code = cur.i32()?;
                let request = match code {
                    0 => AuthenticationRequest::Ok,
                    1 => AuthenticationRequest::KerberosV4,
                    2 => AuthenticationRequest::KerberosV5,
                    3 => AuthenticationRequest::Cleartext,
                    4 => {
                        let s = cur.take(2)?;
                        AuthenticationRequest::Crypt { salt: [s[0], s[1]] }
                    }
                    5 => {
                        let s = cur.take(4)?;
                        AuthenticationRequest::Md5 {
                            salt: [s[0], s[1], s[2], s[3]],
                        }
                    }
                    6 => AuthenticationRequest::ScmCredential,
                    other => AuthenticationRequest::Unknown(other),
                };
                BackendMessage::Authentication(request)
            }
            b'K' => BackendMessage::BackendKeyData {
                process_id: cur.i32()?,
                secret_key: cur.i32()?,
            },
            b'T' => {
                let count = cur.i16()?.max(0) as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = cur.cstring()?;
                    let type_oid = Oid::from_i32(cur.i32()?);
                    let type_size = cur.i16()?;
                    let type_modifier = cur.i32()?;
                    fields.push(FieldDescription {
                        name,
                        table_oid: 0,
                        column_attr: 0,
                        type_oid,
                        type_size,
                        type_modifier,
                        format: Format::Text,
                    });
                }
                BackendMessage::RowDescription(RowDescription { fields })
            }
            b'D' | b'B' => {
                let count = row_fields.ok_or_else(|| {
                    V2Error::Invalid(PgError::Protocol(
                        "Row data received before any RowDescription".to_string(),
                    ))
                })?;
                let bitmap = cur.take(count.div_ceil(8))?;
                let mut values = RowValues::with_capacity(count);
                for i in 0..count {
                    let present = bitmap[i / 8] & (0x80 >> (i % 8)) != 0;
                    if !present {
                        values.push(None);
                        continue;
                    }
                    let len = cur.i32()?;
                    // AsciiRow lengths count themselves, BinaryRow lengths do not.
                    let len = if tag == b'D' { len - 4 } else { len };
                    if len < 0 {
                        return Err(V2Error::Invalid(PgError::Protocol(format!(
                            "Invalid field length in protocol 2 row: {}",
                            len
                        ))));
                    }
                    values.push(Some(Bytes::copy_from_slice(cur.take(len as usize)?)));
                }
                if tag == b'D' {
                    BackendMessage::AsciiRow { values }
                } else {
                    BackendMessage::BinaryRow { values }
                }
            }
            b'C' => BackendMessage::CommandComplete {
                tag: cur.cstring()?,
            },
            b'I' => {
                cur.cstring()?;
                BackendMessage::EmptyQueryResponse
            }
            b'P' => BackendMessage::CursorResponse {
                name: cur.cstring()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle,
            },
            b'E' => BackendMessage::ErrorResponse(BackendError::from_legacy(&cur.cstring()?)),
            b'N' => BackendMessage::NoticeResponse(BackendError::from_legacy(&cur.cstring()?)),
            b'A' => BackendMessage::NotificationResponse {
                process_id: cur.i32()?,
                channel: cur.cstring()?,
                payload: String::new(),
            },
            b'G' => BackendMessage::CopyInResponse(CopyFormat::default()),
            b'H' => BackendMessage::CopyOutResponse(CopyFormat::default()),
            other => {
                return Err(V2Error::Invalid(PgError::Protocol(format!(
                    "Unknown protocol 2 message type: {}",
                    other as char
                ))))
            }
        };
        Ok(msg)
    }

    // ========================================================================
    // Encoding (server side)
    // ========================================================================

    /// Encode as a server would send it.
    pub fn encode(&self, version: ProtocolVersion) -> PgResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode_to(version, &mut buf)?;
        Ok(buf)
    }

    pub fn encode_to(&self, version: ProtocolVersion, buf: &mut BytesMut) -> PgResult<()> {
        match version {
            ProtocolVersion::V3 => self.encode_v3(buf),
            ProtocolVersion::V2 => self.encode_v2(buf),
        }
    }

    fn encode_v3(&self, buf: &mut BytesMut) -> PgResult<()> {
        match self {
            BackendMessage::Authentication(req) => tagged(buf, b'R', |b| {
                req.put_body(b);
                Ok(())
            }),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => tagged(buf, b'K', |b| {
                b.put_i32(*process_id);
                b.put_i32(*secret_key);
                Ok(())
            }),
            BackendMessage::RowDescription(desc) => tagged(buf, b'T', |b| {
                put_count(b, desc.len())?;
                for f in desc.iter() {
                    put_cstr(b, &f.name)?;
                    b.put_i32(f.table_oid);
                    b.put_i16(f.column_attr);
                    b.put_i32(f.type_oid.as_i32());
                    b.put_i16(f.type_size);
                    b.put_i32(f.type_modifier);
                    b.put_i16(f.format as i16);
                }
                Ok(())
            }),
            BackendMessage::DataRow { values } => tagged(buf, b'D', |b| {
                put_count(b, values.len())?;
                for value in values {
                    match value {
                        None => b.put_i32(-1),
                        Some(v) => {
                            b.put_i32(v.len() as i32);
                            b.put_slice(v);
                        }
                    }
                }
                Ok(())
            }),
            BackendMessage::CommandComplete { tag } => tagged(buf, b'C', |b| put_cstr(b, tag)),
            BackendMessage::EmptyQueryResponse => tagged(buf, b'I', |_| Ok(())),
            BackendMessage::ParseComplete => tagged(buf, b'1', |_| Ok(())),
            BackendMessage::BindComplete => tagged(buf, b'2', |_| Ok(())),
            BackendMessage::CloseComplete => tagged(buf, b'3', |_| Ok(())),
            BackendMessage::NoData => tagged(buf, b'n', |_| Ok(())),
            BackendMessage::PortalSuspended => tagged(buf, b's', |_| Ok(())),
            BackendMessage::ParameterDescription { type_oids } => tagged(buf, b't', |b| {
                put_count(b, type_oids.len())?;
                for oid in type_oids {
                    b.put_i32(oid.as_i32());
                }
                Ok(())
            }),
            BackendMessage::ReadyForQuery { status } => tagged(buf, b'Z', |b| {
                b.put_u8(status.as_byte());
                Ok(())
            }),
            BackendMessage::ParameterStatus { name, value } => tagged(buf, b'S', |b| {
                put_cstr(b, name)?;
                put_cstr(b, value)
            }),
            BackendMessage::ErrorResponse(err) => tagged(buf, b'E', |b| put_error_fields(b, err)),
            BackendMessage::NoticeResponse(err) => tagged(buf, b'N', |b| put_error_fields(b, err)),
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => tagged(buf, b'A', |b| {
                b.put_i32(*process_id);
                put_cstr(b, channel)?;
                put_cstr(b, payload)
            }),
            BackendMessage::CopyInResponse(format) => {
                tagged(buf, b'G', |b| put_copy_format(b, format))
            }
            BackendMessage::CopyOutResponse(format) => {
                tagged(buf, b'H', |b| put_copy_format(b, format))
            }
            BackendMessage::CopyData(data) => tagged(buf, b'd', |b| {
                b.put_slice(data);
                Ok(())
            }),
            BackendMessage::CopyDone => tagged(buf, b'c', |_| Ok(())),
            BackendMessage::AsciiRow { .. }
            | BackendMessage::BinaryRow { .. }
            | BackendMessage::CursorResponse { .. } => Err(PgError::Unsupported(format!(
                "{} exists only in protocol 2",
                self.name()
            ))),
        }
    }

    fn encode_v2(&self, buf: &mut BytesMut) -> PgResult<()> {
        match self {
            BackendMessage::Authentication(req) => {
                buf.put_u8(b'R');
                req.put_body(buf);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                buf.put_u8(b'K');
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
            }
            BackendMessage::RowDescription(desc) => {
                buf.put_u8(b'T');
                put_count(buf, desc.len())?;
                for f in desc.iter() {
                    put_cstr(buf, &f.name)?;
                    buf.put_i32(f.type_oid.as_i32());
                    buf.put_i16(f.type_size);
                    buf.put_i32(f.type_modifier);
                }
            }
            BackendMessage::AsciiRow { values } | BackendMessage::BinaryRow { values } => {
                let ascii = matches!(self, BackendMessage::AsciiRow { .. });
                buf.put_u8(if ascii { b'D' } else { b'B' });
                let mut bitmap = vec![0u8; values.len().div_ceil(8)];
                for (i, v) in values.iter().enumerate() {
                    if v.is_some() {
                        bitmap[i / 8] |= 0x80 >> (i % 8);
                    }
                }
                buf.put_slice(&bitmap);
                for v in values.iter().flatten() {
                    let len = v.len() as i32;
                    buf.put_i32(if ascii { len + 4 } else { len });
                    buf.put_slice(v);
                }
            }
            BackendMessage::CommandComplete { tag } => {
                buf.put_u8(b'C');
                put_cstr(buf, tag)?;
            }
            BackendMessage::EmptyQueryResponse => {
                buf.put_u8(b'I');
                buf.put_u8(0);
            }
            BackendMessage::CursorResponse { name } => {
                buf.put_u8(b'P');
                put_cstr(buf, name)?;
            }
            BackendMessage::ReadyForQuery { .. } => buf.put_u8(b'Z'),
            BackendMessage::ErrorResponse(err) => {
                buf.put_u8(b'E');
                put_cstr(buf, &err.to_legacy())?;
            }
            BackendMessage::NoticeResponse(err) => {
                buf.put_u8(b'N');
                put_cstr(buf, &err.to_legacy())?;
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                ..
            } => {
                buf.put_u8(b'A');
                buf.put_i32(*process_id);
                put_cstr(buf, channel)?;
            }
            BackendMessage::CopyInResponse(_) => buf.put_u8(b'G'),
            BackendMessage::CopyOutResponse(_) => buf.put_u8(b'H'),
            // Protocol 2 copy-out is raw text lines ended by `\.`.
            BackendMessage::CopyData(data) => buf.put_slice(data),
            BackendMessage::CopyDone => buf.put_slice(super::protocol::COPY_TERMINATOR),
            other => {
                return Err(PgError::Unsupported(format!(
                    "{} requires protocol version 3",
                    other.name()
                )))
            }
        }
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

fn put_error_fields(buf: &mut BytesMut, err: &BackendError) -> PgResult<()> {
    for (tag, value) in err.fields() {
        buf.put_u8(tag);
        put_cstr(buf, value)?;
    }
    buf.put_u8(0);
    Ok(())
}

fn put_copy_format(buf: &mut BytesMut, format: &CopyFormat) -> PgResult<()> {
    buf.put_i8(format.binary as i8);
    put_count(buf, format.column_formats.len())?;
    for f in &format.column_formats {
        buf.put_i16(*f as i16);
    }
    Ok(())
}

enum V2Error {
    Incomplete,
    Invalid(PgError),
}

/// Non-consuming reader over a protocol 2 receive buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], V2Error> {
        let end = self.pos.checked_add(n).ok_or(V2Error::Incomplete)?;
        if end > self.buf.len() {
            return Err(V2Error::Incomplete);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, V2Error> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, V2Error> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, V2Error> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstring(&mut self) -> Result<String, V2Error> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(V2Error::Incomplete)?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_v3(msg: &BackendMessage) -> BackendMessage {
        let mut encoded = msg.encode(ProtocolVersion::V3).unwrap().freeze();
        let tag = encoded.get_u8();
        let len = encoded.get_i32() as usize;
        assert_eq!(encoded.len(), len - 4);
        BackendMessage::decode_v3(tag, encoded).unwrap()
    }

    fn frame_v2(msg: &BackendMessage, row_fields: Option<usize>) -> BackendMessage {
        let encoded = msg.encode(ProtocolVersion::V2).unwrap();
        let (decoded, used) = BackendMessage::decode_v2(&encoded, row_fields)
            .unwrap()
            .expect("complete message");
        assert_eq!(used, encoded.len());
        decoded
    }

    fn values(items: &[Option<&'static [u8]>]) -> RowValues {
        items.iter().map(|v| v.map(Bytes::from_static)).collect()
    }

    #[test]
    fn test_decode_auth_ok() {
        let body = Bytes::from_static(&[0, 0, 0, 0]);
        assert_eq!(
            BackendMessage::decode_v3(b'R', body).unwrap(),
            BackendMessage::Authentication(AuthenticationRequest::Ok)
        );
    }

    #[test]
    fn test_decode_auth_md5() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 1, 2, 3, 4]);
        assert_eq!(
            BackendMessage::decode_v3(b'R', body).unwrap(),
            BackendMessage::Authentication(AuthenticationRequest::Md5 {
                salt: [1, 2, 3, 4]
            })
        );
    }

    #[test]
    fn test_decode_auth_sasl_is_unknown() {
        let body = Bytes::from_static(b"\0\0\0\x0aSCRAM-SHA-256\0\0");
        assert_eq!(
            BackendMessage::decode_v3(b'R', body).unwrap(),
            BackendMessage::Authentication(AuthenticationRequest::Unknown(10))
        );
    }

    #[test]
    fn test_decode_truncated_body_is_error() {
        let body = Bytes::from_static(&[0, 0, 0, 5, 1]);
        assert!(BackendMessage::decode_v3(b'R', body).is_err());
        assert!(BackendMessage::decode_v3(b'K', Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn test_v3_round_trips() {
        let desc = RowDescription::new(vec![FieldDescription {
            name: "id".into(),
            table_oid: 16384,
            column_attr: 1,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: Format::Text,
        }]);
        let error = BackendError {
            severity: "ERROR".into(),
            code: "22012".into(),
            message: "division by zero".into(),
            hint: Some("don't".into()),
            routine: Some("int4div".into()),
            ..Default::default()
        };
        let messages = vec![
            BackendMessage::Authentication(AuthenticationRequest::Crypt { salt: [9, 8] }),
            BackendMessage::Authentication(AuthenticationRequest::GssContinue {
                data: Bytes::from_static(b"token"),
            }),
            BackendMessage::BackendKeyData {
                process_id: 77,
                secret_key: 1234,
            },
            BackendMessage::RowDescription(desc),
            BackendMessage::DataRow {
                values: values(&[Some(&b"1"[..]), None, Some(&b""[..])]),
            },
            BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            },
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::CloseComplete,
            BackendMessage::NoData,
            BackendMessage::PortalSuspended,
            BackendMessage::ParameterDescription {
                type_oids: vec![Oid::INT4, Oid::TEXT],
            },
            BackendMessage::ReadyForQuery {
                status: TransactionStatus::InTransaction,
            },
            BackendMessage::ParameterStatus {
                name: "server_version".into(),
                value: "16.2".into(),
            },
            BackendMessage::ErrorResponse(error.clone()),
            BackendMessage::NoticeResponse(error),
            BackendMessage::NotificationResponse {
                process_id: 5,
                channel: "jobs".into(),
                payload: "42".into(),
            },
            BackendMessage::CopyInResponse(CopyFormat {
                binary: false,
                column_formats: vec![Format::Text, Format::Text],
            }),
            BackendMessage::CopyOutResponse(CopyFormat {
                binary: true,
                column_formats: vec![Format::Binary],
            }),
            BackendMessage::CopyData(Bytes::from_static(b"1\tone\n")),
            BackendMessage::CopyDone,
        ];
        for msg in messages {
            assert_eq!(frame_v3(&msg), msg);
        }
    }

    #[test]
    fn test_v2_round_trips() {
        let desc = RowDescription::new(vec![
            FieldDescription {
                name: "a".into(),
                table_oid: 0,
                column_attr: 0,
                type_oid: Oid::TEXT,
                type_size: -1,
                type_modifier: -1,
                format: Format::Text,
            },
            FieldDescription {
                name: "b".into(),
                table_oid: 0,
                column_attr: 0,
                type_oid: Oid::INT4,
                type_size: 4,
                type_modifier: -1,
                format: Format::Text,
            },
        ]);
        let plain = vec![
            BackendMessage::Authentication(AuthenticationRequest::Md5 { salt: [1, 2, 3, 4] }),
            BackendMessage::BackendKeyData {
                process_id: 1,
                secret_key: 2,
            },
            BackendMessage::RowDescription(desc),
            BackendMessage::CommandComplete {
                tag: "INSERT 0 1".into(),
            },
            BackendMessage::EmptyQueryResponse,
            BackendMessage::CursorResponse {
                name: "blank".into(),
            },
            BackendMessage::ReadyForQuery {
                status: TransactionStatus::Idle,
            },
            BackendMessage::ErrorResponse(BackendError::from_legacy("ERROR:  boom\n")),
            BackendMessage::NotificationResponse {
                process_id: 3,
                channel: "jobs".into(),
                payload: String::new(),
            },
            BackendMessage::CopyInResponse(CopyFormat::default()),
        ];
        for msg in plain {
            assert_eq!(frame_v2(&msg, None), msg);
        }

        let ascii = BackendMessage::AsciiRow {
            values: values(&[Some(&b"hello"[..]), None]),
        };
        assert_eq!(frame_v2(&ascii, Some(2)), ascii);
        let binary = BackendMessage::BinaryRow {
            values: values(&[None, Some(&[0u8, 0, 0, 7][..])]),
        };
        assert_eq!(frame_v2(&binary, Some(2)), binary);
    }

    #[test]
    fn test_v2_ascii_row_layout() {
        // Nine fields so the bitmap spans two bytes.
        let mut items: Vec<Option<&'static [u8]>> = vec![None; 9];
        items[0] = Some(&b"x"[..]);
        items[8] = Some(&b"yz"[..]);
        let encoded = BackendMessage::AsciiRow {
            values: values(&items),
        }
        .encode(ProtocolVersion::V2)
        .unwrap();
        assert_eq!(encoded[0], b'D');
        assert_eq!(&encoded[1..3], &[0x80, 0x80]);
        // length includes itself
        assert_eq!(&encoded[3..7], &5i32.to_be_bytes());
        assert_eq!(encoded[7], b'x');
    }

    #[test]
    fn test_v2_incomplete_returns_none() {
        let encoded = BackendMessage::CommandComplete {
            tag: "SELECT 3".into(),
        }
        .encode(ProtocolVersion::V2)
        .unwrap();
        for cut in 0..encoded.len() {
            assert!(BackendMessage::decode_v2(&encoded[..cut], None)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_v2_row_without_description_is_error() {
        assert!(BackendMessage::decode_v2(b"D\x80\0\0\0\x05x", None).is_err());
    }

    #[test]
    fn test_v3_only_messages_rejected_for_v2() {
        assert!(matches!(
            BackendMessage::ParseComplete.encode(ProtocolVersion::V2),
            Err(PgError::Unsupported(_))
        ));
        assert!(matches!(
            BackendMessage::AsciiRow {
                values: RowValues::new()
            }
            .encode(ProtocolVersion::V3),
            Err(PgError::Unsupported(_))
        ));
    }
}

//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use super::state::{Operation, StateKind};
use super::types::ProtocolVersion;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS negotiation or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed or the requested method is not supported.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The backend reported one or more errors for the request cycle.
    #[error("{0}")]
    Backend(ErrorList),

    /// The operation is not legal in the connector's current protocol state.
    #[error("{operation} is not allowed while the connector is {state}")]
    InvalidState {
        operation: Operation,
        state: StateKind,
    },

    /// Connection is closed or was never opened.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Invalid connection settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No connector became available within the pool timeout.
    #[error("Timeout while waiting for a connector from the pool (max pool size {max_pool_size}, waited {waited:?})")]
    PoolExhausted {
        max_pool_size: usize,
        waited: Duration,
    },

    /// Timeout while connecting.
    #[error("Operation timed out")]
    Timeout,

    /// COPY sub-protocol misuse.
    #[error("COPY error: {0}")]
    Copy(String),

    /// Feature not available with the negotiated protocol version or server.
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl PgError {
    /// Whether this error invalidates the connector that produced it.
    ///
    /// Backend errors leave the session usable once ReadyForQuery has been
    /// seen; I/O and framing failures do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Tls(_) | PgError::Protocol(_) | PgError::ConnectionClosed
        )
    }

    /// Backend errors carried by this error, if any.
    pub fn backend_errors(&self) -> &[BackendError] {
        match self {
            PgError::Backend(list) => &list.0,
            _ => &[],
        }
    }

    /// SQLSTATE of the first backend error.
    pub fn code(&self) -> Option<&str> {
        self.backend_errors().first().map(|e| e.code.as_str())
    }

    /// True when the first backend error was decoded from a protocol 2
    /// error string while a protocol 3 startup was in progress.
    pub(crate) fn is_legacy_protocol_error(&self) -> bool {
        self.backend_errors()
            .first()
            .is_some_and(|e| e.protocol_version == ProtocolVersion::V2)
    }
}

/// Ordered list of backend errors collected during one request cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorList(pub Vec<BackendError>);

impl ErrorList {
    pub fn iter(&self) -> std::slice::Iter<'_, BackendError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(first) => {
                write!(f, "{}", first)?;
                if self.0.len() > 1 {
                    write!(f, " (and {} more)", self.0.len() - 1)?;
                }
                Ok(())
            }
            None => write!(f, "backend reported an error"),
        }
    }
}

impl From<Vec<BackendError>> for ErrorList {
    fn from(errors: Vec<BackendError>) -> Self {
        ErrorList(errors)
    }
}

/// Structured ErrorResponse/NoticeResponse contents.
///
/// Protocol 3 fills the tagged fields; protocol 2 only carries a single
/// string, split into severity and message where possible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
    /// Protocol version of the wire format this error was decoded from.
    pub protocol_version: ProtocolVersion,
}

impl BackendError {
    /// Build from protocol 3 tagged fields.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').cloned(),
            internal_position: fields.get(&b'p').cloned(),
            internal_query: fields.get(&b'q').cloned(),
            where_: fields.get(&b'W').cloned(),
            file: fields.get(&b'F').cloned(),
            line: fields.get(&b'L').cloned(),
            routine: fields.get(&b'R').cloned(),
            protocol_version: ProtocolVersion::V3,
        }
    }

    /// Tagged fields in wire order, for encoding.
    pub fn fields(&self) -> Vec<(u8, &str)> {
        let mut out = vec![
            (b'S', self.severity.as_str()),
            (b'C', self.code.as_str()),
            (b'M', self.message.as_str()),
        ];
        let optional = [
            (b'D', &self.detail),
            (b'H', &self.hint),
            (b'P', &self.position),
            (b'p', &self.internal_position),
            (b'q', &self.internal_query),
            (b'W', &self.where_),
            (b'F', &self.file),
            (b'L', &self.line),
            (b'R', &self.routine),
        ];
        for (tag, value) in optional {
            if let Some(v) = value {
                out.push((tag, v.as_str()));
            }
        }
        out
    }

    /// Build from a protocol 2 error string such as `"FATAL:  message\n"`.
    pub fn from_legacy(text: &str) -> Self {
        let text = text.trim_end_matches('\n');
        let (severity, message) = match text.split_once(':') {
            Some((sev, rest))
                if !sev.is_empty() && sev.chars().all(|c| c.is_ascii_uppercase()) =>
            {
                (sev.to_string(), rest.trim_start().to_string())
            }
            _ => (String::new(), text.to_string()),
        };
        Self {
            severity,
            message,
            protocol_version: ProtocolVersion::V2,
            ..Default::default()
        }
    }

    /// Render back into the protocol 2 single-string form.
    pub fn to_legacy(&self) -> String {
        if self.severity.is_empty() {
            format!("{}\n", self.message)
        } else {
            format!("{}:  {}\n", self.severity, self.message)
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{}: {}", self.severity, self.message)?;
        } else {
            write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        }
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

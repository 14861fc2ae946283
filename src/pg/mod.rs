//! PostgreSQL wire protocol client core.
//!
//! This module provides a connector that:
//! - Speaks frontend/backend protocol 3.0, falling back to 2.0 once
//! - Buffers each request cycle's reply in a mediator
//! - Streams rows and COPY data without buffering when asked to
//! - Polls for asynchronous notifications in the background
//!
//! Architecture:
//! - `protocol` / `backend` / `codec`: wire messages and framing
//! - `state` / `session`: protocol state machine and the drain loop
//! - `connector`: connection lifecycle and request cycles
//! - `copy` / `reader`: COPY streams and forward-only rows
//! - `notification`: poller and the gate it shares with foreground work
//! - `pool`: connector pool keyed by normalized settings

pub mod auth;
pub mod backend;
pub mod codec;
pub mod connector;
pub mod copy;
pub mod error;
pub mod mediator;
pub mod notification;
pub mod pool;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod settings;
pub mod state;
pub mod statement;
pub mod stream;
pub mod types;

#[cfg(test)]
mod mock_backend;

// Public API re-exports for library consumers
pub use auth::{Authenticator, Md5Digest, NegotiateProvider, PasswordDigest};
pub use backend::{BackendMessage, FieldDescription, RowDescription};
pub use connector::{CancelToken, Connector};
pub use copy::{CopyFormat, CopyInStream, CopyOutStream};
pub use error::{BackendError, ErrorList, PgError, PgResult};
pub use mediator::{CompletedResponse, Response, ResultSet, Row};
pub use notification::{ConnectorEvent, Notification, PauseScope};
pub use pool::{ConnectorPool, PoolStats, PooledConnector, SharedConnector};
pub use reader::RowStream;
pub use session::SessionInfo;
pub use settings::{ConnectionSettings, SslMode};
pub use state::{Operation, ProtocolState, StateKind};
pub use statement::PreparedStatement;
pub use types::{Format, Oid, ProtocolVersion, ServerVersion, TransactionStatus};

//! Per-connector protocol session.
//!
//! A [`Session`] owns the socket, both buffers, the decoder, the current
//! [`ProtocolState`] and the mediator. It sits behind an async mutex shared
//! by the connector, its streams and the notification poller. Metadata that
//! callers read synchronously lives next to it in [`SessionInfo`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, warn};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::auth::Authenticator;
use super::backend::{BackendMessage, RowDescription};
use super::codec::MessageDecoder;
use super::error::{PgError, PgResult};
use super::mediator::Mediator;
use super::notification::ConnectorEvent;
use super::protocol::{FrontendMessage, TerminateMessage};
use super::settings::ConnectionSettings;
use super::state::{ProtocolState, StateKind};
use super::statement::StatementCache;
use super::stream::{read_into, PgStream};
use super::types::{Oid, ProtocolVersion, ServerVersion, TransactionStatus};

pub(crate) type SharedSession = Arc<tokio::sync::Mutex<Session>>;
pub(crate) type SharedInfo = Arc<RwLock<SessionInfo>>;

/// Synchronously readable connector metadata.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub protocol_version: ProtocolVersion,
    pub server_version: Option<ServerVersion>,
    pub process_id: i32,
    pub secret_key: i32,
    /// Latest ParameterStatus values.
    pub parameters: HashMap<String, String>,
    pub transaction_status: TransactionStatus,
    /// `pg_type` snapshot: oid to type name.
    pub type_table: HashMap<Oid, String>,
    pub state: StateKind,
    pub broken: bool,
    pub supports_prepare: bool,
    pub supports_savepoint: bool,
}

impl SessionInfo {
    /// Derive capability flags from the server version.
    pub(crate) fn apply_capabilities(&mut self) {
        let version = self.server_version.unwrap_or_default();
        self.supports_prepare = version >= ServerVersion::new(7, 3, 0);
        self.supports_savepoint = version >= ServerVersion::new(8, 0, 0);
    }
}

/// A request cycle left open by a stream dropped before its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unfinished {
    CopyIn,
    CopyOut,
    Rows,
}

pub(crate) struct Session {
    pub(crate) stream: Option<PgStream>,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) decoder: MessageDecoder,
    pub(crate) state: ProtocolState,
    pub(crate) mediator: Mediator,
    /// Description used for rows when the current cycle carried none.
    pub(crate) last_description: Option<Arc<RowDescription>>,
    pub(crate) unfinished: Option<Unfinished>,
    pub(crate) encoding_fix_pending: bool,
    pub(crate) statements: StatementCache,
    pub(crate) settings: Arc<ConnectionSettings>,
    pub(crate) auth: Authenticator,
    pub(crate) info: SharedInfo,
    pub(crate) events: broadcast::Sender<ConnectorEvent>,
}

impl Session {
    pub(crate) fn new(
        settings: Arc<ConnectionSettings>,
        auth: Authenticator,
        info: SharedInfo,
        events: broadcast::Sender<ConnectorEvent>,
    ) -> Self {
        Self {
            stream: None,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
            decoder: MessageDecoder::new(ProtocolVersion::V3),
            state: ProtocolState::Closed,
            mediator: Mediator::new(),
            last_description: None,
            unfinished: None,
            encoding_fix_pending: false,
            statements: StatementCache::new(settings.statement_cache_capacity),
            settings,
            auth,
            info,
            events,
        }
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.decoder.version()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Attach a fresh transport and switch framing to `version`.
    pub(crate) fn attach(&mut self, stream: PgStream, version: ProtocolVersion) {
        self.stream = Some(stream);
        self.read_buf.clear();
        self.write_buf.clear();
        self.decoder.set_version(version);
        self.mediator.reset();
        self.last_description = None;
        self.unfinished = None;
        self.encoding_fix_pending = false;
        self.statements.clear();
        {
            let mut info = self.info.write();
            info.protocol_version = version;
            info.broken = false;
        }
        self.set_state(ProtocolState::Connected);
    }

    pub(crate) fn set_state(&mut self, state: ProtocolState) {
        self.info.write().state = state.kind();
        self.state = state;
    }

    /// Encode `msg` into the write buffer.
    pub(crate) fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        msg.encode_to(self.version(), &mut self.write_buf)
    }

    /// Write out everything buffered by [`send`](Self::send).
    pub(crate) async fn flush(&mut self) -> PgResult<()> {
        let stream = self.stream.as_mut().ok_or(PgError::ConnectionClosed)?;
        if !self.write_buf.is_empty() {
            stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn send_flush<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.send(msg)?;
        self.flush().await
    }

    /// Next complete backend message, reading the socket as needed.
    pub(crate) async fn next_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(msg);
            }
            let stream = self.stream.as_mut().ok_or(PgError::ConnectionClosed)?;
            read_into(stream, &mut self.read_buf).await?;
        }
    }

    /// Next complete message already in the read buffer.
    pub(crate) fn try_next_message(&mut self) -> PgResult<Option<BackendMessage>> {
        self.decoder.decode(&mut self.read_buf)
    }

    /// Read more bytes from the socket, waiting up to `wait`. `Ok(false)`
    /// on timeout.
    pub(crate) async fn read_within(&mut self, wait: Duration) -> PgResult<bool> {
        let stream = self.stream.as_mut().ok_or(PgError::ConnectionClosed)?;
        match tokio::time::timeout(wait, read_into(stream, &mut self.read_buf)).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Drop the transport after a fatal error and mark the session broken.
    pub(crate) fn invalidate(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.unfinished = None;
        self.info.write().broken = true;
        self.set_state(ProtocolState::Closed);
    }

    /// Invalidate on fatal errors, pass the result through unchanged.
    pub(crate) fn guard<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() && self.is_open() {
                warn!("Connector to {} broken: {}", self.settings.display_target(), err);
                self.invalidate();
            }
        }
        result
    }

    /// Send Terminate (best effort) and close the transport.
    pub(crate) async fn terminate(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let mut buf = BytesMut::new();
            if TerminateMessage.encode_to(self.version(), &mut buf).is_ok() {
                if let Err(err) = stream.write_all(&buf).await {
                    debug!("Terminate not delivered: {}", err);
                }
            }
            let _ = stream.shutdown().await;
        }
        self.read_buf.clear();
        self.write_buf.clear();
        self.unfinished = None;
        self.statements.clear();
        self.set_state(ProtocolState::Closed);
    }

    /// Publish to subscribers; having none is fine.
    pub(crate) fn publish(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }
}

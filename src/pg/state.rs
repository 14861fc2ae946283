//! Protocol state machine.
//!
//! The current state is a plain tag stored on the session; all mutable data
//! lives on the session itself. [`ProtocolState::permits`] is the transition
//! table: an operation the current state does not list is rejected before
//! anything is written to the socket. The drain loop below is the one place
//! backend messages are dispatched.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};

use super::auth::{AuthResponse, Credentials};
use super::backend::{AuthenticationRequest, BackendMessage, RowValues};
use super::copy::CopyFormat;
use super::error::{ErrorList, PgError, PgResult};
use super::mediator::Row;
use super::notification::{ConnectorEvent, Notification};
use super::protocol::{CopyDoneMessage, CopyFailMessage, GssResponseMessage, PasswordMessage};
use super::session::{Session, Unfinished};
use super::types::{ProtocolVersion, ServerVersion};

// ============================================================================
// States and operations
// ============================================================================

/// Connection state. Only the copy states carry data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProtocolState {
    #[default]
    Closed,
    /// Transport open, nothing sent.
    Connected,
    /// Startup packet sent, authenticating.
    Startup,
    Ready,
    CopyIn(CopyFormat),
    CopyOut(CopyFormat),
}

/// Data-free tag of a [`ProtocolState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StateKind {
    #[default]
    Closed,
    Connected,
    Startup,
    Ready,
    CopyIn,
    CopyOut,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Closed => "closed",
            StateKind::Connected => "connected",
            StateKind::Startup => "starting up",
            StateKind::Ready => "ready",
            StateKind::CopyIn => "in COPY IN",
            StateKind::CopyOut => "in COPY OUT",
        };
        f.write_str(name)
    }
}

/// Everything a caller or the poller can ask of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Startup,
    Query,
    Parse,
    Bind,
    Describe,
    Execute,
    Sync,
    Flush,
    CloseStatement,
    CopyData,
    CopyDone,
    CopyFail,
    CopyRead,
    Poll,
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "Open",
            Operation::Startup => "Startup",
            Operation::Query => "Query",
            Operation::Parse => "Parse",
            Operation::Bind => "Bind",
            Operation::Describe => "Describe",
            Operation::Execute => "Execute",
            Operation::Sync => "Sync",
            Operation::Flush => "Flush",
            Operation::CloseStatement => "Close statement",
            Operation::CopyData => "CopyData",
            Operation::CopyDone => "CopyDone",
            Operation::CopyFail => "CopyFail",
            Operation::CopyRead => "COPY read",
            Operation::Poll => "Notification poll",
            Operation::Close => "Close",
        };
        f.write_str(name)
    }
}

impl ProtocolState {
    pub fn kind(&self) -> StateKind {
        match self {
            ProtocolState::Closed => StateKind::Closed,
            ProtocolState::Connected => StateKind::Connected,
            ProtocolState::Startup => StateKind::Startup,
            ProtocolState::Ready => StateKind::Ready,
            ProtocolState::CopyIn(_) => StateKind::CopyIn,
            ProtocolState::CopyOut(_) => StateKind::CopyOut,
        }
    }

    /// Transition table.
    pub fn permits(&self, op: Operation) -> bool {
        use Operation::*;
        match self {
            ProtocolState::Closed => matches!(op, Open | Close),
            ProtocolState::Connected => matches!(op, Startup | Close),
            ProtocolState::Startup => matches!(op, Close),
            ProtocolState::Ready => matches!(
                op,
                Query
                    | Parse
                    | Bind
                    | Describe
                    | Execute
                    | Sync
                    | Flush
                    | CloseStatement
                    | Poll
                    | Close
            ),
            ProtocolState::CopyIn(_) => matches!(op, CopyData | CopyDone | CopyFail | Close),
            ProtocolState::CopyOut(_) => matches!(op, CopyRead | Close),
        }
    }

    pub fn check(&self, op: Operation) -> PgResult<()> {
        if self.permits(op) {
            Ok(())
        } else {
            Err(PgError::InvalidState {
                operation: op,
                state: self.kind(),
            })
        }
    }

    /// Negotiated format while in a copy state.
    pub fn copy_format(&self) -> Option<&CopyFormat> {
        match self {
            ProtocolState::CopyIn(f) | ProtocolState::CopyOut(f) => Some(f),
            _ => None,
        }
    }
}

// ============================================================================
// Drain loop
// ============================================================================

/// What a drain waits for. ReadyForQuery always ends a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Until {
    ReadyForQuery,
    ParseComplete,
    BindComplete,
    CloseComplete,
    /// RowDescription or NoData.
    Describe,
    /// CommandComplete, EmptyQueryResponse or PortalSuspended.
    Execute,
    /// Hand each row back instead of buffering it.
    NextRow,
    /// Hand each COPY OUT payload back instead of buffering it.
    CopyData,
    /// Only what is already buffered; never reads the socket.
    Available,
}

impl Until {
    fn is_extended_step(self) -> bool {
        matches!(
            self,
            Until::ParseComplete
                | Until::BindComplete
                | Until::CloseComplete
                | Until::Describe
                | Until::Execute
        )
    }
}

/// How a drain ended.
#[derive(Debug)]
pub(crate) enum Drained {
    Ready,
    /// The awaited reply arrived.
    Reached,
    /// An extended-query step failed; the caller must Sync.
    Error,
    Row(Row),
    CopyIn,
    CopyOut,
    CopyData(Bytes),
    CopyDone,
    /// Buffer exhausted in `Until::Available` mode.
    Idle,
}

fn is_utf8_encoding(name: &str) -> bool {
    name.eq_ignore_ascii_case("UTF8") || name.eq_ignore_ascii_case("UNICODE")
}

impl Session {
    /// Validate `op` against the current state and start a fresh cycle.
    ///
    /// A cycle abandoned by a dropped stream is finished first.
    pub(crate) async fn begin(&mut self, op: Operation) -> PgResult<()> {
        if self.unfinished.is_some() {
            self.recover().await?;
        }
        self.state.check(op)?;
        self.mediator.reset();
        Ok(())
    }

    /// Read and dispatch backend messages until `until` is satisfied.
    ///
    /// Fatal errors invalidate the session before being returned.
    pub(crate) async fn drain(&mut self, until: Until) -> PgResult<Drained> {
        let result = self.drain_inner(until).await;
        self.guard(result)
    }

    async fn drain_inner(&mut self, until: Until) -> PgResult<Drained> {
        loop {
            let msg = if until == Until::Available {
                match self.try_next_message()? {
                    Some(msg) => msg,
                    None => return Ok(Drained::Idle),
                }
            } else {
                self.next_message().await?
            };

            match msg {
                BackendMessage::ErrorResponse(error) => {
                    debug!("Backend error: {}", error);
                    self.mediator.add_error(error);
                    if matches!(self.state, ProtocolState::Connected | ProtocolState::Startup) {
                        return Err(PgError::Backend(ErrorList(self.mediator.take_errors())));
                    }
                    if until.is_extended_step() {
                        return Ok(Drained::Error);
                    }
                }
                BackendMessage::NoticeResponse(notice) => {
                    debug!("Backend notice: {}", notice);
                    self.publish(ConnectorEvent::Notice(notice.clone()));
                    self.mediator.add_notice(notice);
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    let notification = Notification {
                        process_id,
                        channel,
                        payload,
                    };
                    self.publish(ConnectorEvent::Notification(notification.clone()));
                    self.mediator.add_notification(notification);
                }
                BackendMessage::Authentication(request) => self.authenticate(request).await?,
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    let mut info = self.info.write();
                    info.process_id = process_id;
                    info.secret_key = secret_key;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.on_parameter_status(name, value)
                }
                BackendMessage::RowDescription(desc) => {
                    let desc = Arc::new(desc);
                    self.last_description = Some(desc.clone());
                    self.mediator.begin_result(desc);
                    if until == Until::Describe {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::NoData => {
                    self.mediator.set_no_data();
                    if until == Until::Describe {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::ParameterDescription { type_oids } => {
                    self.mediator.set_parameter_description(type_oids)
                }
                BackendMessage::DataRow { values }
                | BackendMessage::AsciiRow { values }
                | BackendMessage::BinaryRow { values } => {
                    let row = self.make_row(values)?;
                    if until == Until::NextRow {
                        return Ok(Drained::Row(row));
                    }
                    self.mediator.add_row(row);
                }
                BackendMessage::CommandComplete { tag } => {
                    self.mediator.complete(tag);
                    if until == Until::Execute {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::EmptyQueryResponse => {
                    if until == Until::Execute {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::PortalSuspended => {
                    self.mediator.set_portal_suspended();
                    if until == Until::Execute {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::CursorResponse { .. } => {}
                BackendMessage::ParseComplete => {
                    if until == Until::ParseComplete {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::BindComplete => {
                    if until == Until::BindComplete {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::CloseComplete => {
                    if until == Until::CloseComplete {
                        return Ok(Drained::Reached);
                    }
                }
                BackendMessage::ReadyForQuery { status } => {
                    if self.version() == ProtocolVersion::V3 {
                        self.info.write().transaction_status = status;
                    }
                    self.set_state(ProtocolState::Ready);
                    return Ok(Drained::Ready);
                }
                BackendMessage::CopyInResponse(format) => {
                    self.set_state(ProtocolState::CopyIn(format));
                    return Ok(Drained::CopyIn);
                }
                BackendMessage::CopyOutResponse(format) => {
                    self.set_state(ProtocolState::CopyOut(format));
                    if until != Until::CopyData {
                        return Ok(Drained::CopyOut);
                    }
                }
                BackendMessage::CopyData(data) => {
                    if !matches!(self.state, ProtocolState::CopyOut(_)) {
                        return Err(PgError::Protocol(
                            "CopyData received outside COPY OUT".to_string(),
                        ));
                    }
                    if until == Until::CopyData {
                        return Ok(Drained::CopyData(data));
                    }
                    self.mediator.push_copy_data(data);
                }
                BackendMessage::CopyDone => {
                    self.set_state(ProtocolState::Ready);
                    if until == Until::CopyData {
                        return Ok(Drained::CopyDone);
                    }
                }
            }
        }
    }

    async fn authenticate(&mut self, request: AuthenticationRequest) -> PgResult<()> {
        if self.state != ProtocolState::Startup {
            return Err(PgError::Protocol(
                "Authentication request outside startup".to_string(),
            ));
        }
        let settings = self.settings.clone();
        let creds = Credentials {
            host: &settings.host,
            user: &settings.user,
            password: settings.password.as_deref(),
            integrated_security: settings.integrated_security,
        };
        if request == AuthenticationRequest::Ok {
            debug!("Authenticated as {}", settings.user);
        }
        match self.auth.respond(&request, &creds)? {
            None => Ok(()),
            Some(AuthResponse::Password(password)) => {
                self.send(&PasswordMessage { password })?;
                self.flush().await
            }
            Some(AuthResponse::Token(data)) => {
                self.send(&GssResponseMessage { data })?;
                self.flush().await
            }
        }
    }

    fn on_parameter_status(&mut self, name: String, value: String) {
        match name.as_str() {
            "client_encoding" if !is_utf8_encoding(&value) => {
                debug!("Server reports client_encoding {}, will switch to UTF8", value);
                self.encoding_fix_pending = true;
            }
            "server_version" => {
                self.info.write().server_version = ServerVersion::parse(&value);
            }
            _ => {}
        }
        self.publish(ConnectorEvent::ParameterStatus {
            name: name.clone(),
            value: value.clone(),
        });
        self.info.write().parameters.insert(name, value);
    }

    fn make_row(&self, values: RowValues) -> PgResult<Row> {
        let description = self
            .mediator
            .current_description()
            .or(self.last_description.as_ref())
            .cloned()
            .ok_or_else(|| {
                PgError::Protocol("Row data received without a RowDescription".to_string())
            })?;
        if description.len() != values.len() {
            return Err(PgError::Protocol(format!(
                "Row has {} fields but its description has {}",
                values.len(),
                description.len()
            )));
        }
        Ok(Row::new(description, values))
    }

    /// Finish a cycle left open by a stream that was dropped early.
    pub(crate) async fn recover(&mut self) -> PgResult<()> {
        let Some(unfinished) = self.unfinished.take() else {
            return Ok(());
        };
        warn!("Recovering from an abandoned {:?} cycle", unfinished);

        if unfinished == Unfinished::CopyIn && matches!(self.state, ProtocolState::CopyIn(_)) {
            if self.version() == ProtocolVersion::V2 {
                // Protocol 2 has no way to abort a COPY IN without
                // committing what was sent.
                self.invalidate();
                return Err(PgError::Copy(
                    "COPY IN abandoned under protocol 2; connection discarded".to_string(),
                ));
            }
            let sent = self.send(&CopyFailMessage {
                reason: "COPY stream dropped before completion".to_string(),
            });
            self.guard(sent)?;
            let flushed = self.flush().await;
            self.guard(flushed)?;
        }

        // A row stream may still have a CopyInResponse pending; drain_to_ready
        // refuses it instead of waiting on a server that wants data.
        if self.state != ProtocolState::Ready || unfinished != Unfinished::CopyIn {
            self.drain_to_ready().await?;
        }
        self.mediator.reset();
        Ok(())
    }

    /// Send the handshake's follow-up `SET CLIENT_ENCODING` if one is due.
    pub(crate) fn take_encoding_fix(&mut self) -> bool {
        std::mem::take(&mut self.encoding_fix_pending)
    }

    /// Reply to a CopyInResponse the caller has no data for.
    pub(crate) async fn refuse_copy_in(&mut self) -> PgResult<()> {
        match self.version() {
            ProtocolVersion::V3 => self.send(&CopyFailMessage {
                reason: "no copy source supplied".to_string(),
            })?,
            ProtocolVersion::V2 => {
                info!("COPY IN without a source under protocol 2; sending empty data");
                self.send(&CopyDoneMessage)?;
            }
        }
        self.flush().await
    }
}

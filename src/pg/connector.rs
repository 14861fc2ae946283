//! PostgreSQL connector implementation.
//!
//! A [`Connector`] is one physical session. It handles:
//! - transport setup and the startup/authentication handshake
//! - the single protocol 3 to 2 fallback
//! - simple and extended query cycles
//! - prepared statement caching
//! - out-of-band cancellation

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, OwnedMutexGuard};

use super::auth::Authenticator;
use super::error::{PgError, PgResult};
use super::mediator::Response;
use super::notification::{spawn_poller, ConnectorEvent, NotificationGate, PauseScope, PollerHandle};
use super::protocol::*;
use super::reader::RowStream;
use super::session::{Session, SessionInfo, SharedInfo, SharedSession, Unfinished};
use super::settings::{check_search_path, ConnectionSettings};
use super::state::{Drained, Operation, ProtocolState, StateKind, Until};
use super::statement::PreparedStatement;
use super::stream;
use super::types::{Format, Oid, ProtocolVersion, ServerVersion, TransactionStatus};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Cycle guard
// ============================================================================

/// Exclusive access to the session for one request cycle: notifications
/// paused, session locked. Fields drop in order, so the lock goes first.
pub(crate) struct Cycle {
    pub(crate) session: OwnedMutexGuard<Session>,
    _scope: PauseScope,
}

// ============================================================================
// Connector
// ============================================================================

/// One physical client/server session and its protocol state.
pub struct Connector {
    settings: Arc<ConnectionSettings>,
    session: SharedSession,
    info: SharedInfo,
    gate: NotificationGate,
    events: broadcast::Sender<ConnectorEvent>,
    poller: Option<PollerHandle>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info.read();
        f.debug_struct("Connector")
            .field("target", &self.settings.display_target())
            .field("state", &info.state)
            .field("protocol_version", &info.protocol_version)
            .field("process_id", &info.process_id)
            .field("broken", &info.broken)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Create a closed connector.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self::with_authenticator(settings, Authenticator::default())
    }

    /// Create a closed connector with custom authentication collaborators.
    pub fn with_authenticator(settings: ConnectionSettings, auth: Authenticator) -> Self {
        let settings = Arc::new(settings);
        let info: SharedInfo = Arc::new(RwLock::new(SessionInfo::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Session::new(settings.clone(), auth, info.clone(), events.clone());
        Self {
            settings,
            session: Arc::new(tokio::sync::Mutex::new(session)),
            info,
            gate: NotificationGate::new(),
            events,
            poller: None,
        }
    }

    /// Create and open a connector.
    pub async fn connect(settings: ConnectionSettings) -> PgResult<Self> {
        let mut connector = Self::new(settings);
        connector.open().await?;
        Ok(connector)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Drive the connector from Closed to Ready.
    ///
    /// On failure the transport is closed and the connector is marked broken;
    /// it must be discarded.
    pub async fn open(&mut self) -> PgResult<()> {
        self.settings.validate()?;
        {
            let _scope = self.gate.pause().await;
            let mut session = self.session.lock().await;
            session.state.check(Operation::Open)?;

            if let Err(err) = open_session(&mut session).await {
                session.terminate().await;
                self.info.write().broken = true;
                debug!("Open of {} failed: {}", self.settings.display_target(), err);
                return Err(err);
            }
        }

        info!(
            "Connected to {} (protocol {}, backend pid {})",
            self.settings.display_target(),
            self.protocol_version(),
            self.backend_pid()
        );

        if self.settings.sync_notification {
            self.poller = Some(spawn_poller(
                self.session.clone(),
                self.gate.clone(),
                self.settings.notification_poll_interval,
            ));
        }
        Ok(())
    }

    /// Close from any state. Sends Terminate if the socket is still usable.
    pub async fn close(&mut self) -> PgResult<()> {
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        let _scope = self.gate.pause().await;
        let mut session = self.session.lock().await;
        let was_open = session.is_open();
        session.terminate().await;
        self.info.write().parameters.clear();
        if was_open {
            info!("Closed connection to {}", self.settings.display_target());
        }
        Ok(())
    }

    /// Run a trivial query; any failure means the connector is unusable.
    pub async fn is_valid(&mut self) -> bool {
        if self.is_broken() || self.state() != StateKind::Ready {
            return false;
        }
        match self.simple_query("SELECT 1").await {
            Ok(_) => true,
            Err(err) => {
                debug!("Validation of {} failed: {}", self.settings.display_target(), err);
                false
            }
        }
    }

    /// Token that can cancel this connector's current command from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        let info = self.info.read();
        CancelToken {
            settings: self.settings.clone(),
            process_id: info.process_id,
            secret_key: info.secret_key,
        }
    }

    /// Ask the server to cancel the command in flight. Fire and forget.
    pub async fn cancel_request(&self) -> PgResult<()> {
        self.cancel_token().cancel().await
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> StateKind {
        self.info.read().state
    }

    pub fn is_broken(&self) -> bool {
        self.info.read().broken
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.info.read().protocol_version
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.info.read().server_version
    }

    pub fn backend_pid(&self) -> i32 {
        self.info.read().process_id
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.info.read().transaction_status
    }

    pub fn parameter(&self, name: &str) -> Option<String> {
        self.info.read().parameters.get(name).cloned()
    }

    pub fn parameters(&self) -> HashMap<String, String> {
        self.info.read().parameters.clone()
    }

    pub fn supports_prepare(&self) -> bool {
        self.info.read().supports_prepare
    }

    pub fn supports_savepoint(&self) -> bool {
        self.info.read().supports_savepoint
    }

    /// Type name for `oid` from the snapshot taken at open.
    pub fn type_name(&self, oid: Oid) -> Option<String> {
        self.info.read().type_table.get(&oid).cloned()
    }

    pub fn type_table(&self) -> HashMap<Oid, String> {
        self.info.read().type_table.clone()
    }

    /// Snapshot of all session metadata.
    pub fn info(&self) -> SessionInfo {
        self.info.read().clone()
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Receive notifications, notices and parameter changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events.subscribe()
    }

    /// Keep the poller off the socket until the scope is dropped.
    pub async fn pause_notifications(&self) -> PauseScope {
        self.gate.pause().await
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Enter a request cycle for `op`.
    pub(crate) async fn enter(&self, op: Operation) -> PgResult<Cycle> {
        let scope = self.gate.pause().await;
        let mut session = self.session.clone().lock_owned().await;
        session.begin(op).await?;
        Ok(Cycle {
            session,
            _scope: scope,
        })
    }

    // ------------------------------------------------------------------------
    // Simple query protocol
    // ------------------------------------------------------------------------

    /// Send a Query and drain to ReadyForQuery.
    pub async fn query(&mut self, msg: &QueryMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Query).await?;
        cycle.session.simple_cycle(msg).await
    }

    /// Run `sql` with the simple query protocol.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Response> {
        self.query(&QueryMessage::new(sql)).await
    }

    /// Run `sql` and read its rows one at a time.
    pub async fn query_streaming(&mut self, sql: &str) -> PgResult<RowStream<'_>> {
        let mut cycle = self.enter(Operation::Query).await?;
        let session = &mut cycle.session;
        session.last_description = None;
        let sent = session.send_flush(&QueryMessage::new(sql)).await;
        session.guard(sent)?;
        session.unfinished = Some(Unfinished::Rows);
        Ok(RowStream::new(cycle, PhantomData))
    }

    // ------------------------------------------------------------------------
    // Extended query protocol (protocol 3 only)
    // ------------------------------------------------------------------------

    /// Parse, then wait for ParseComplete.
    pub async fn parse(&mut self, msg: &ParseMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Parse).await?;
        cycle.session.extended_step(msg, Until::ParseComplete).await
    }

    /// Bind, then wait for BindComplete.
    pub async fn bind(&mut self, msg: &BindMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Bind).await?;
        cycle.session.extended_step(msg, Until::BindComplete).await
    }

    /// Describe, then wait for the RowDescription or NoData.
    pub async fn describe(&mut self, msg: &DescribeMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Describe).await?;
        cycle.session.extended_step(msg, Until::Describe).await
    }

    /// Execute, then wait for completion or suspension.
    pub async fn execute(&mut self, msg: &ExecuteMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Execute).await?;
        cycle.session.extended_step(msg, Until::Execute).await
    }

    /// Close a statement or portal, then wait for CloseComplete.
    pub async fn close_statement(&mut self, msg: &CloseMessage) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::CloseStatement).await?;
        cycle.session.extended_step(msg, Until::CloseComplete).await
    }

    /// Sync and drain to ReadyForQuery.
    pub async fn sync(&mut self) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Sync).await?;
        let session = &mut cycle.session;
        let sent = session.send_flush(&SyncMessage).await;
        session.guard(sent)?;
        session.drain_to_ready().await?;
        session.mediator.take_response().into_result()
    }

    /// Send Flush and collect whatever the server has already answered.
    pub async fn flush(&mut self) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Flush).await?;
        let session = &mut cycle.session;
        let sent = session.send_flush(&FlushMessage).await;
        session.guard(sent)?;
        while !matches!(session.drain(Until::Available).await?, Drained::Idle) {}
        session.mediator.take_response().into_result()
    }

    /// Parse and describe `sql` under a cached name.
    ///
    /// Statements evicted from the cache are closed in the same round trip.
    pub async fn prepare(
        &mut self,
        sql: &str,
        param_types: &[Oid],
    ) -> PgResult<Arc<PreparedStatement>> {
        let mut cycle = self.enter(Operation::Parse).await?;
        let session = &mut cycle.session;
        if let Some(stmt) = session.statements.get_and_touch(sql) {
            return Ok(stmt);
        }
        if session.version() == ProtocolVersion::V2 {
            return Err(PgError::Unsupported(
                "Prepared statements require protocol 3.0".to_string(),
            ));
        }
        if !self.info.read().supports_prepare {
            return Err(PgError::Unsupported(
                "Server does not support prepared statements".to_string(),
            ));
        }

        let name = session.statements.next_statement_name();
        for old in session.statements.take_pending_close() {
            debug!("Closing evicted statement {}", old);
            session.send(&CloseMessage {
                kind: b'S',
                name: old,
            })?;
        }
        session.send(&ParseMessage {
            name: name.clone(),
            query: sql.to_string(),
            param_types: param_types.to_vec(),
        })?;
        session.send(&DescribeMessage::statement(name.clone()))?;
        session.send(&SyncMessage)?;
        let flushed = session.flush().await;
        session.guard(flushed)?;
        session.drain_to_ready().await?;
        let response = session.mediator.take_response().into_result()?;

        let stmt = PreparedStatement {
            name,
            query: sql.to_string(),
            param_types: response
                .parameter_description
                .unwrap_or_else(|| param_types.to_vec()),
            description: response.row_description,
        };
        session.statements.insert(stmt.clone());
        Ok(Arc::new(stmt))
    }

    /// Bind text parameters to a prepared statement, execute and sync.
    pub async fn execute_prepared(
        &mut self,
        stmt: &PreparedStatement,
        params: &[Option<&[u8]>],
    ) -> PgResult<Response> {
        let mut cycle = self.enter(Operation::Bind).await?;
        let session = &mut cycle.session;
        session.last_description = stmt.description.clone();
        session.send(&BindMessage {
            portal: String::new(),
            statement: stmt.name.clone(),
            param_formats: vec![Format::Text],
            params: params
                .iter()
                .map(|p| p.map(Bytes::copy_from_slice))
                .collect(),
            result_formats: vec![Format::Text],
        })?;
        session.send(&ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        })?;
        session.send(&SyncMessage)?;
        let flushed = session.flush().await;
        session.guard(flushed)?;
        session.drain_to_ready().await?;
        session.mediator.take_response().into_result()
    }

    /// Number of statements in this connector's cache.
    pub async fn cached_statements(&self) -> usize {
        self.session.lock().await.statements.len()
    }
}

// ============================================================================
// Handshake
// ============================================================================

async fn open_session(session: &mut Session) -> PgResult<()> {
    let settings = session.settings.clone();
    let pinned = settings.protocol_version;
    let first = pinned.unwrap_or(ProtocolVersion::V3);

    match handshake(session, first).await {
        Err(err)
            if pinned.is_none()
                && first == ProtocolVersion::V3
                && err.is_legacy_protocol_error() =>
        {
            info!(
                "{} does not speak protocol 3.0, retrying with 2.0",
                settings.display_target()
            );
            session.terminate().await;
            session.mediator.reset();
            handshake(session, ProtocolVersion::V2).await?;
        }
        other => other?,
    }

    after_startup(session).await
}

async fn handshake(session: &mut Session, version: ProtocolVersion) -> PgResult<()> {
    let settings = session.settings.clone();
    let transport = stream::connect(&settings).await?;
    session.attach(transport, version);
    session.state.check(Operation::Startup)?;

    let mut options = Vec::new();
    if version == ProtocolVersion::V3 {
        if let Some(name) = &settings.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
    }
    let startup = StartupMessage {
        user: settings.user.clone(),
        database: settings.database.clone(),
        options,
    };
    let sent = session.send_flush(&startup).await;
    session.guard(sent)?;
    session.set_state(ProtocolState::Startup);

    session.drain_to_ready().await
}

/// Work done once the handshake reached ReadyForQuery.
async fn after_startup(session: &mut Session) -> PgResult<()> {
    let settings = session.settings.clone();
    let version = session.version();

    if version == ProtocolVersion::V2 {
        // Protocol 2 reports neither server_version nor client_encoding.
        let response = session.run_simple("select version();").await?;
        let text = response.rows().next().and_then(|r| r.get_str(0).map(|s| s.into_owned()));
        session.info.write().server_version = text.as_deref().and_then(ServerVersion::parse);
        session.run_simple("SET CLIENT_ENCODING TO 'UNICODE'").await?;
    } else if session.take_encoding_fix() {
        session.run_simple("SET CLIENT_ENCODING TO 'UTF8'").await?;
    }
    session.info.write().apply_capabilities();

    if let Some(path) = &settings.search_path {
        check_search_path(path)?;
        session.run_simple(&format!("SET SEARCH_PATH TO {}", path)).await?;
    }

    if settings.load_type_table {
        let response = session.run_simple("SELECT oid, typname FROM pg_type").await?;
        let table: HashMap<Oid, String> = response
            .rows()
            .filter_map(|row| {
                let oid = row.get_str(0)?.parse::<u32>().ok()?;
                Some((Oid(oid as i32), row.get_str(1)?.into_owned()))
            })
            .collect();
        debug!("Loaded {} backend types", table.len());
        session.info.write().type_table = table;
    }
    Ok(())
}

// ============================================================================
// Cycles
// ============================================================================

impl Session {
    /// Begin a simple query cycle, run it, return the response.
    pub(crate) async fn run_simple(&mut self, sql: &str) -> PgResult<Response> {
        self.begin(Operation::Query).await?;
        self.simple_cycle(&QueryMessage::new(sql)).await
    }

    pub(crate) async fn simple_cycle(&mut self, msg: &QueryMessage) -> PgResult<Response> {
        let sent = self.send_flush(msg).await;
        self.guard(sent)?;
        self.drain_to_ready().await?;
        self.mediator.take_response().into_result()
    }

    /// Drain to ReadyForQuery. A COPY IN nobody asked for is refused, COPY
    /// OUT data is buffered in the response.
    pub(crate) async fn drain_to_ready(&mut self) -> PgResult<()> {
        loop {
            match self.drain(Until::ReadyForQuery).await? {
                Drained::Ready => return Ok(()),
                Drained::CopyIn => {
                    let refused = self.refuse_copy_in().await;
                    self.guard(refused)?;
                }
                _ => {}
            }
        }
    }

    /// Write one extended-query message plus Flush and wait for its reply.
    /// A failed step is resynchronized with Sync before returning.
    pub(crate) async fn extended_step<M: FrontendMessage>(
        &mut self,
        msg: &M,
        until: Until,
    ) -> PgResult<Response> {
        self.send(msg)?;
        self.send(&FlushMessage)?;
        let flushed = self.flush().await;
        self.guard(flushed)?;

        loop {
            match self.drain(until).await? {
                Drained::Error => {
                    let sent = self.send_flush(&SyncMessage).await;
                    self.guard(sent)?;
                    self.drain_to_ready().await?;
                    break;
                }
                Drained::CopyIn => {
                    let refused = self.refuse_copy_in().await;
                    self.guard(refused)?;
                }
                Drained::CopyOut => {}
                _ => break,
            }
        }
        self.mediator.take_response().into_result()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Everything needed to cancel a connector's command from another task.
#[derive(Debug, Clone)]
pub struct CancelToken {
    settings: Arc<ConnectionSettings>,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Open a throwaway connection and send CancelRequest. No reply is read.
    pub async fn cancel(&self) -> PgResult<()> {
        let mut transport = stream::connect(&self.settings).await?;
        let request = CancelRequestMessage {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .encode(ProtocolVersion::V3)?;
        transport.write_all(&request).await?;
        transport.flush().await?;
        let _ = transport.shutdown().await;
        debug!("Sent cancel request for backend {}", self.process_id);
        Ok(())
    }
}

//! Scripted backend for tests.
//!
//! Speaks enough of both protocol versions over a loopback socket to drive
//! a connector end to end. Queries are answered from a small fixed
//! repertoire, and what clients send is recorded for assertions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::auth::{md5_password, Md5Digest};
use super::backend::{
    AuthenticationRequest, BackendMessage, FieldDescription, RowDescription, RowValues,
};
use super::copy::CopyFormat;
use super::error::{BackendError, PgError, PgResult};
use super::protocol::{Frontend, COPY_TERMINATOR};
use super::settings::ConnectionSettings;
use super::types::{Format, Oid, ProtocolVersion, TransactionStatus};

/// Which startup packets the server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// Protocol 3 and 2.
    Modern,
    /// Protocol 2 only; a v3 startup gets a bare `FATAL` string.
    LegacyOnly,
    /// Rejects every startup.
    Neither,
}

#[derive(Debug, Clone)]
pub(crate) struct MockConfig {
    pub dialect: Dialect,
    /// Require MD5 authentication with this password.
    pub password: Option<String>,
    pub client_encoding: String,
    pub server_version: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Modern,
            password: None,
            client_encoding: "UTF8".to_string(),
            server_version: "9.6.2".to_string(),
        }
    }
}

/// Everything the server observed, shared by all its sessions.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub startups: AtomicUsize,
    pub sessions: AtomicUsize,
    pub terminations: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
    pub cancels: Mutex<Vec<(i32, i32)>>,
    pub copy_failures: Mutex<Vec<String>>,
    /// Rows received by COPY FROM STDIN, replayed by COPY TO STDOUT.
    pub table: Mutex<Vec<u8>>,
    next_pid: AtomicI32,
    cancelled: Notify,
}

impl MockState {
    pub fn saw_query(&self, sql: &str) -> bool {
        self.queries.lock().iter().any(|q| q == sql)
    }
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    pub state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_config(MockConfig::default()).await
    }

    pub async fn with_config(config: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let config = Arc::new(config);

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        if let Err(err) = serve(socket, &config, &state).await {
                            debug!("mock session ended: {}", err);
                        }
                    });
                }
            })
        };
        Self { addr, state, task }
    }

    /// Settings pointing at this server, with a short timeout.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings::new("127.0.0.1", "tester")
            .port(self.addr.port())
            .database("testdb")
            .timeout(Duration::from_secs(5))
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Session
// ============================================================================

async fn serve(socket: TcpStream, config: &MockConfig, state: &Arc<MockState>) -> PgResult<()> {
    let (reader, writer) = socket.into_split();
    let mut conn = Conn {
        reader,
        writer: Arc::new(tokio::sync::Mutex::new(writer)),
        buf: BytesMut::new(),
        version: ProtocolVersion::V3,
        pid: 0,
        tx: TransactionStatus::Idle,
        server_version: config.server_version.clone(),
        statements: HashMap::new(),
        portals: HashMap::new(),
    };

    let (code, first) = loop {
        if conn.buf.len() >= 8 {
            let code = i32::from_be_bytes([conn.buf[4], conn.buf[5], conn.buf[6], conn.buf[7]]);
            if let Some(msg) = Frontend::decode_startup(&mut conn.buf)? {
                break (code, msg);
            }
        }
        if !conn.fill().await? {
            return Ok(());
        }
    };

    let startup = match first {
        Frontend::CancelRequest(req) => {
            state.cancels.lock().push((req.process_id, req.secret_key));
            state.cancelled.notify_one();
            return Ok(());
        }
        Frontend::Startup(msg) => msg,
        other => {
            return Err(PgError::Protocol(format!(
                "unexpected startup packet {:?}",
                other
            )))
        }
    };
    state.startups.fetch_add(1, Ordering::SeqCst);

    let version = ProtocolVersion::from_code(code)
        .ok_or_else(|| PgError::Protocol(format!("unknown protocol {}", code)))?;
    let accepted = match config.dialect {
        Dialect::Modern => true,
        Dialect::LegacyOnly => version == ProtocolVersion::V2,
        Dialect::Neither => false,
    };
    // Old servers answer in the old format whatever the client asked for.
    conn.version = if accepted { version } else { ProtocolVersion::V2 };
    if !accepted {
        conn.send(&[failure("FATAL", "0A000", "unsupported frontend protocol")])
            .await?;
        return Ok(());
    }

    if let Some(password) = &config.password {
        let salt = [7, 1, 8, 2];
        conn.send(&[BackendMessage::Authentication(AuthenticationRequest::Md5 { salt })])
            .await?;
        let expected = md5_password(&Md5Digest, &startup.user, password, &salt);
        match conn.next().await? {
            Some(Frontend::Password(p)) if p.password == expected => {}
            _ => {
                let message = format!("password authentication failed for user \"{}\"", startup.user);
                conn.send(&[failure("FATAL", "28P01", &message)]).await?;
                return Ok(());
            }
        }
    }

    conn.pid = 1000 + state.next_pid.fetch_add(1, Ordering::SeqCst);
    let mut hello = vec![BackendMessage::Authentication(AuthenticationRequest::Ok)];
    if version == ProtocolVersion::V3 {
        let mut reported = vec![
            ("server_version".to_string(), config.server_version.clone()),
            ("client_encoding".to_string(), config.client_encoding.clone()),
        ];
        reported.extend(
            startup
                .options
                .iter()
                .filter(|(key, _)| key == "application_name")
                .cloned(),
        );
        hello.extend(
            reported
                .into_iter()
                .map(|(name, value)| BackendMessage::ParameterStatus { name, value }),
        );
    }
    hello.push(BackendMessage::BackendKeyData {
        process_id: conn.pid,
        secret_key: conn.pid * 7,
    });
    hello.push(BackendMessage::ReadyForQuery {
        status: TransactionStatus::Idle,
    });
    state.sessions.fetch_add(1, Ordering::SeqCst);
    conn.send(&hello).await?;

    conn.run(state).await
}

struct Conn {
    reader: OwnedReadHalf,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    buf: BytesMut,
    version: ProtocolVersion,
    pid: i32,
    tx: TransactionStatus,
    server_version: String,
    statements: HashMap<String, String>,
    portals: HashMap<String, (String, Vec<Option<Bytes>>)>,
}

impl Conn {
    async fn fill(&mut self) -> PgResult<bool> {
        Ok(self.reader.read_buf(&mut self.buf).await? > 0)
    }

    async fn next(&mut self) -> PgResult<Option<Frontend>> {
        loop {
            if let Some(msg) = Frontend::decode(&mut self.buf, self.version)? {
                return Ok(Some(msg));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    async fn send(&self, msgs: &[BackendMessage]) -> PgResult<()> {
        let mut buf = BytesMut::new();
        for msg in msgs {
            msg.encode_to(self.version, &mut buf)?;
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        Ok(())
    }

    fn row(&self, values: Vec<Option<Bytes>>) -> BackendMessage {
        let values: RowValues = values.into_iter().collect();
        match self.version {
            ProtocolVersion::V3 => BackendMessage::DataRow { values },
            ProtocolVersion::V2 => BackendMessage::AsciiRow { values },
        }
    }

    async fn run(&mut self, state: &Arc<MockState>) -> PgResult<()> {
        // Extended-query messages after an error are skipped up to Sync.
        let mut failed = false;
        while let Some(msg) = self.next().await? {
            if failed && !matches!(msg, Frontend::Sync | Frontend::Terminate) {
                continue;
            }
            match msg {
                Frontend::Query(q) => self.simple(&q.query, state).await?,
                Frontend::Parse(p) => {
                    if p.query.starts_with("SELEC ") {
                        failed = true;
                        self.send(&[failure("ERROR", "42601", "syntax error at or near \"SELEC\"")])
                            .await?;
                    } else {
                        self.statements.insert(p.name, p.query);
                        self.send(&[BackendMessage::ParseComplete]).await?;
                    }
                }
                Frontend::Bind(b) => match self.statements.get(&b.statement).cloned() {
                    Some(query) => {
                        self.portals.insert(b.portal, (query, b.params));
                        self.send(&[BackendMessage::BindComplete]).await?;
                    }
                    None => {
                        failed = true;
                        let message = format!("prepared statement \"{}\" does not exist", b.statement);
                        self.send(&[failure("ERROR", "26000", &message)]).await?;
                    }
                },
                Frontend::Describe(d) => {
                    let query = if d.kind == b'S' {
                        self.statements.get(&d.name).cloned()
                    } else {
                        self.portals.get(&d.name).map(|(q, _)| q.clone())
                    };
                    let Some(query) = query else {
                        failed = true;
                        self.send(&[failure("ERROR", "26000", "no such statement or portal")])
                            .await?;
                        continue;
                    };
                    let params = query.matches('$').count();
                    let mut out = Vec::new();
                    if d.kind == b'S' {
                        out.push(BackendMessage::ParameterDescription {
                            type_oids: vec![Oid::TEXT; params],
                        });
                    }
                    out.push(match plan(&query, &vec![None; params], &self.server_version) {
                        Outcome::Rows(columns, _, _) => BackendMessage::RowDescription(describe(&columns)),
                        _ => BackendMessage::NoData,
                    });
                    self.send(&out).await?;
                }
                Frontend::Execute(e) => {
                    let Some((query, params)) = self.portals.get(&e.portal).cloned() else {
                        failed = true;
                        self.send(&[failure("ERROR", "34000", "portal does not exist")]).await?;
                        continue;
                    };
                    state.queries.lock().push(query.clone());
                    let mut out = Vec::new();
                    match plan(&query, &params, &self.server_version) {
                        Outcome::Rows(_, rows, tag) => {
                            out.extend(rows.into_iter().map(|r| self.row(r)));
                            out.push(BackendMessage::CommandComplete { tag });
                        }
                        Outcome::Fail(err) => {
                            failed = true;
                            out.push(BackendMessage::ErrorResponse(err));
                        }
                        Outcome::Done(tag) => out.push(BackendMessage::CommandComplete { tag }),
                        _ => out.push(BackendMessage::EmptyQueryResponse),
                    }
                    self.send(&out).await?;
                }
                Frontend::Close(c) => {
                    if c.kind == b'S' {
                        self.statements.remove(&c.name);
                    } else {
                        self.portals.remove(&c.name);
                    }
                    self.send(&[BackendMessage::CloseComplete]).await?;
                }
                Frontend::Sync => {
                    failed = false;
                    self.portals.remove("");
                    self.send(&[BackendMessage::ReadyForQuery { status: self.tx }])
                        .await?;
                }
                Frontend::Flush => {}
                Frontend::Terminate => {
                    state.terminations.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                // Stray copy traffic after a copy already ended.
                Frontend::CopyData(_) | Frontend::CopyDone | Frontend::CopyFail(_) => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message {:?}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    async fn simple(&mut self, sql: &str, state: &Arc<MockState>) -> PgResult<()> {
        state.queries.lock().push(sql.to_string());
        let mut out = Vec::new();
        if sql.eq_ignore_ascii_case("SELECT notice()") {
            out.push(BackendMessage::NoticeResponse(BackendError {
                severity: "WARNING".to_string(),
                code: "01000".to_string(),
                message: "careful".to_string(),
                protocol_version: self.version,
                ..Default::default()
            }));
        }

        match plan(sql, &[], &self.server_version) {
            Outcome::Rows(columns, rows, tag) => {
                out.push(BackendMessage::RowDescription(describe(&columns)));
                out.extend(rows.into_iter().map(|r| self.row(r)));
                out.push(BackendMessage::CommandComplete { tag });
            }
            Outcome::Done(tag) => {
                match tag.as_str() {
                    "BEGIN" => self.tx = TransactionStatus::InTransaction,
                    "COMMIT" | "ROLLBACK" => self.tx = TransactionStatus::Idle,
                    _ => {}
                }
                out.push(BackendMessage::CommandComplete { tag });
            }
            Outcome::Fail(err) => {
                if self.tx != TransactionStatus::Idle {
                    self.tx = TransactionStatus::Failed;
                }
                out.push(BackendMessage::ErrorResponse(err));
            }
            Outcome::Notify(channel, payload) => {
                out.push(BackendMessage::CommandComplete {
                    tag: "NOTIFY".to_string(),
                });
                out.push(BackendMessage::NotificationResponse {
                    process_id: self.pid,
                    channel,
                    payload,
                });
            }
            Outcome::NotifyLater(channel, payload, split) => {
                out.push(BackendMessage::CommandComplete {
                    tag: "SELECT 1".to_string(),
                });
                let msg = BackendMessage::NotificationResponse {
                    process_id: self.pid,
                    channel,
                    payload,
                };
                let writer = Arc::clone(&self.writer);
                let version = self.version;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let Ok(buf) = msg.encode(version) else {
                        return;
                    };
                    let mut writer = writer.lock().await;
                    if split {
                        // Header and part of the body first, the rest later.
                        let (head, tail) = buf.split_at(7);
                        let _ = writer.write_all(head).await;
                        let _ = writer.flush().await;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        let _ = writer.write_all(tail).await;
                    } else {
                        let _ = writer.write_all(&buf).await;
                    }
                });
            }
            Outcome::Sleep => {
                let waited =
                    tokio::time::timeout(Duration::from_secs(10), state.cancelled.notified()).await;
                out.push(match waited {
                    Ok(()) => failure("ERROR", "57014", "canceling statement due to user request"),
                    Err(_) => BackendMessage::CommandComplete {
                        tag: "SELECT 1".to_string(),
                    },
                });
            }
            Outcome::CopyIn => {
                self.send(&[BackendMessage::CopyInResponse(copy_format())])
                    .await?;
                self.copy_in(state, &mut out).await?;
            }
            Outcome::CopyOut => {
                let data = state.table.lock().clone();
                out.push(BackendMessage::CopyOutResponse(copy_format()));
                let mut lines = 0;
                for line in data.split_inclusive(|b| *b == b'\n') {
                    out.push(BackendMessage::CopyData(Bytes::copy_from_slice(line)));
                    lines += 1;
                }
                out.push(BackendMessage::CopyDone);
                out.push(BackendMessage::CommandComplete {
                    tag: format!("COPY {}", lines),
                });
            }
        }

        out.push(BackendMessage::ReadyForQuery { status: self.tx });
        self.send(&out).await
    }

    async fn copy_in(&mut self, state: &MockState, out: &mut Vec<BackendMessage>) -> PgResult<()> {
        let mut received = Vec::new();
        match self.version {
            ProtocolVersion::V3 => loop {
                match self.next().await? {
                    Some(Frontend::CopyData(m)) => received.extend_from_slice(&m.data),
                    Some(Frontend::CopyDone) => break,
                    Some(Frontend::CopyFail(m)) => {
                        let message = format!("COPY from stdin failed: {}", m.reason);
                        out.push(failure("ERROR", "57014", &message));
                        state.copy_failures.lock().push(m.reason);
                        return Ok(());
                    }
                    Some(Frontend::Flush) | Some(Frontend::Sync) => {}
                    Some(other) => {
                        return Err(PgError::Protocol(format!(
                            "unexpected message during COPY IN: {:?}",
                            other
                        )))
                    }
                    None => return Err(PgError::ConnectionClosed),
                }
            },
            ProtocolVersion::V2 => loop {
                if let Some(pos) = find(&self.buf, COPY_TERMINATOR) {
                    received.extend_from_slice(&self.buf[..pos]);
                    self.buf.advance(pos + COPY_TERMINATOR.len());
                    break;
                }
                if !self.fill().await? {
                    return Err(PgError::ConnectionClosed);
                }
            },
        }
        let lines = received.iter().filter(|b| **b == b'\n').count();
        state.table.lock().extend_from_slice(&received);
        out.push(BackendMessage::CommandComplete {
            tag: format!("COPY {}", lines),
        });
        Ok(())
    }
}

// ============================================================================
// Query repertoire
// ============================================================================

enum Outcome {
    /// Column names, rows and the completion tag.
    Rows(Vec<String>, Vec<Vec<Option<Bytes>>>, String),
    Done(String),
    Fail(BackendError),
    Notify(String, String),
    /// Answer now, deliver the notification a little later, optionally
    /// in two writes.
    NotifyLater(String, String, bool),
    /// Block until a cancel request arrives.
    Sleep,
    CopyIn,
    CopyOut,
}

fn plan(sql: &str, params: &[Option<Bytes>], server_version: &str) -> Outcome {
    let sql = sql.trim();
    let upper = sql.to_ascii_uppercase();
    let text = |s: &str| Some(Bytes::copy_from_slice(s.as_bytes()));
    let single = |column: &str, value: Option<Bytes>| {
        Outcome::Rows(vec![column.to_string()], vec![vec![value]], "SELECT 1".to_string())
    };

    if upper.starts_with("SELECT $") {
        let columns = vec!["?column?".to_string(); params.len()];
        return Outcome::Rows(columns, vec![params.to_vec()], "SELECT 1".to_string());
    }
    if let Some(n) = upper
        .strip_prefix("SELECT GENERATE_SERIES(1, ")
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(|n| n.parse::<usize>().ok())
    {
        let rows = (1..=n).map(|i| vec![text(&i.to_string())]).collect();
        return Outcome::Rows(vec!["generate_series".to_string()], rows, format!("SELECT {}", n));
    }
    if upper.starts_with("SELECT PG_SLEEP(") {
        return Outcome::Sleep;
    }
    let split = upper.starts_with("SELECT PG_NOTIFY_SPLIT(");
    if split || upper.starts_with("SELECT PG_NOTIFY_LATER(") {
        let quoted: Vec<&str> = sql.split('\'').collect();
        if quoted.len() >= 4 {
            return Outcome::NotifyLater(quoted[1].to_string(), quoted[3].to_string(), split);
        }
    }
    if let Some(rest) = sql.strip_prefix("NOTIFY ") {
        let (channel, payload) = rest.split_once(',').unwrap_or((rest, ""));
        return Outcome::Notify(
            channel.trim().to_string(),
            payload.trim().trim_matches('\'').to_string(),
        );
    }
    if upper.starts_with("COPY ") && upper.ends_with("FROM STDIN") {
        return Outcome::CopyIn;
    }
    if upper.starts_with("COPY ") && upper.ends_with("TO STDOUT") {
        return Outcome::CopyOut;
    }

    match upper.as_str() {
        "SELECT 1" | "SELECT NOTICE()" => single("?column?", text("1")),
        "SELECT NULL" => single("?column?", None),
        "SELECT VERSION();" | "SELECT VERSION()" => single(
            "version",
            text(&format!("PostgreSQL {} on x86_64-pc-linux-gnu", server_version)),
        ),
        "SELECT OID, TYPNAME FROM PG_TYPE" => Outcome::Rows(
            vec!["oid".to_string(), "typname".to_string()],
            [("16", "bool"), ("23", "int4"), ("25", "text")]
                .iter()
                .map(|(oid, name)| vec![text(oid), text(name)])
                .collect(),
            "SELECT 3".to_string(),
        ),
        "SELECT 1/0" => Outcome::Fail(BackendError {
            severity: "ERROR".to_string(),
            code: "22012".to_string(),
            message: "division by zero".to_string(),
            ..Default::default()
        }),
        _ if upper.starts_with("INSERT") => Outcome::Done("INSERT 0 1".to_string()),
        _ => Outcome::Done(
            upper
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        ),
    }
}

fn describe(columns: &[String]) -> RowDescription {
    RowDescription::new(
        columns
            .iter()
            .map(|name| FieldDescription {
                name: name.clone(),
                table_oid: 0,
                column_attr: 0,
                type_oid: Oid::TEXT,
                type_size: -1,
                type_modifier: -1,
                format: Format::Text,
            })
            .collect(),
    )
}

fn copy_format() -> CopyFormat {
    CopyFormat {
        binary: false,
        column_formats: vec![Format::Text; 2],
    }
}

fn failure(severity: &str, code: &str, message: &str) -> BackendMessage {
    BackendMessage::ErrorResponse(BackendError {
        severity: severity.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        ..Default::default()
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

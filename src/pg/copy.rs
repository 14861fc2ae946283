//! COPY sub-protocol.
//!
//! `start_copy_in` and `start_copy_out` return push and pull streams that
//! hold the connector's session for their whole life, so no other operation
//! can run while a copy is active. `copy_in_from` and `copy_out_to` pump an
//! `AsyncRead` source or `AsyncWrite` sink through those streams.

use std::marker::PhantomData;

use bytes::Bytes;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::connector::{Connector, Cycle};
use super::error::{ErrorList, PgError, PgResult};
use super::mediator::Response;
use super::protocol::{CopyDataMessage, CopyDoneMessage, CopyFailMessage, QueryMessage};
use super::session::{Session, Unfinished};
use super::state::{Drained, Operation, Until};
use super::types::{Format, ProtocolVersion};

/// Chunk size used when pumping a source into COPY IN.
pub const COPY_CHUNK_SIZE: usize = 8192;

/// Format negotiated by CopyInResponse/CopyOutResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyFormat {
    /// Overall binary format; text otherwise.
    pub binary: bool,
    /// Per-column format codes.
    pub column_formats: Vec<Format>,
}

impl CopyFormat {
    pub fn column_count(&self) -> usize {
        self.column_formats.len()
    }
}

fn backend_failure(session: &mut Session) -> Option<PgError> {
    if session.mediator.has_errors() {
        Some(PgError::Backend(ErrorList(session.mediator.take_errors())))
    } else {
        None
    }
}

// ============================================================================
// COPY IN
// ============================================================================

/// Push stream for COPY FROM STDIN.
pub struct CopyInStream<'a> {
    cycle: Cycle,
    format: CopyFormat,
    done: bool,
    _connector: PhantomData<&'a mut Connector>,
}

impl CopyInStream<'_> {
    pub fn format(&self) -> &CopyFormat {
        &self.format
    }

    /// Forward `data` to the server as one CopyData message.
    pub async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        if self.done {
            return Err(PgError::Copy("COPY IN stream already finished".to_string()));
        }
        let session = &mut self.cycle.session;
        session.state.check(Operation::CopyData)?;
        let sent = session
            .send_flush(&CopyDataMessage {
                data: Bytes::copy_from_slice(data),
            })
            .await;
        session.guard(sent)
    }

    /// Send CopyDone and wait for the server to finish the command.
    pub async fn finish(mut self) -> PgResult<Response> {
        if self.done {
            return Err(PgError::Copy("COPY IN stream already finished".to_string()));
        }
        let session = &mut self.cycle.session;
        session.state.check(Operation::CopyDone)?;
        let sent = session.send_flush(&CopyDoneMessage).await;
        session.guard(sent)?;
        session.drain_to_ready().await?;
        self.done = true;
        session.unfinished = None;
        session.mediator.take_response().into_result()
    }

    /// Abort with CopyFail. The server always answers with an error; the
    /// errors it reported are returned. Protocol 2 cannot abort a copy, so
    /// the connection is discarded instead.
    pub async fn cancel(mut self, reason: &str) -> PgResult<ErrorList> {
        if self.done {
            return Err(PgError::Copy("COPY IN stream already finished".to_string()));
        }
        let session = &mut self.cycle.session;
        session.state.check(Operation::CopyFail)?;
        if session.version() == ProtocolVersion::V2 {
            self.done = true;
            session.invalidate();
            return Err(PgError::Copy(
                "COPY IN cannot be cancelled under protocol 2; connection discarded".to_string(),
            ));
        }
        let sent = session
            .send_flush(&CopyFailMessage {
                reason: reason.to_string(),
            })
            .await;
        session.guard(sent)?;
        session.drain_to_ready().await?;
        self.done = true;
        session.unfinished = None;
        Ok(ErrorList(session.mediator.take_errors()))
    }
}

// ============================================================================
// COPY OUT
// ============================================================================

/// Pull stream for COPY TO STDOUT.
pub struct CopyOutStream<'a> {
    cycle: Cycle,
    format: CopyFormat,
    done: bool,
    _connector: PhantomData<&'a mut Connector>,
}

impl CopyOutStream<'_> {
    pub fn format(&self) -> &CopyFormat {
        &self.format
    }

    /// Next CopyData payload, or `None` once the server ended the copy.
    pub async fn read(&mut self) -> PgResult<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let session = &mut self.cycle.session;
        loop {
            match session.drain(Until::CopyData).await {
                Ok(Drained::CopyData(data)) => return Ok(Some(data)),
                Ok(Drained::CopyDone) => {
                    let ready = session.drain_to_ready().await;
                    self.done = true;
                    ready?;
                    session.unfinished = None;
                    return match backend_failure(session) {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
                // An error ended the copy early.
                Ok(Drained::Ready) => {
                    self.done = true;
                    session.unfinished = None;
                    return match backend_failure(session) {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Err(err);
                }
            }
        }
    }

    /// Read to the end and return the completion response.
    pub async fn finish(mut self) -> PgResult<Response> {
        while self.read().await?.is_some() {}
        Ok(self.cycle.session.mediator.take_response())
    }
}

// ============================================================================
// Connector entry points
// ============================================================================

impl Connector {
    /// Run a `COPY ... FROM STDIN` statement and return the push stream.
    pub async fn start_copy_in(&mut self, sql: &str) -> PgResult<CopyInStream<'_>> {
        let mut cycle = self.enter(Operation::Query).await?;
        let session = &mut cycle.session;
        let sent = session.send_flush(&QueryMessage::new(sql)).await;
        session.guard(sent)?;

        loop {
            match session.drain(Until::ReadyForQuery).await? {
                Drained::CopyIn => break,
                Drained::Ready => {
                    session.mediator.take_response().into_result()?;
                    return Err(PgError::Copy(format!(
                        "Statement did not start COPY IN: {}",
                        sql
                    )));
                }
                _ => {}
            }
        }

        let format = session.state.copy_format().cloned().unwrap_or_default();
        debug!("COPY IN started ({} columns)", format.column_count());
        session.unfinished = Some(Unfinished::CopyIn);
        Ok(CopyInStream {
            cycle,
            format,
            done: false,
            _connector: PhantomData,
        })
    }

    /// Run a `COPY ... TO STDOUT` statement and return the pull stream.
    pub async fn start_copy_out(&mut self, sql: &str) -> PgResult<CopyOutStream<'_>> {
        let mut cycle = self.enter(Operation::Query).await?;
        let session = &mut cycle.session;
        let sent = session.send_flush(&QueryMessage::new(sql)).await;
        session.guard(sent)?;

        loop {
            match session.drain(Until::ReadyForQuery).await? {
                Drained::CopyOut => break,
                Drained::CopyIn => {
                    let refused = session.refuse_copy_in().await;
                    session.guard(refused)?;
                }
                Drained::Ready => {
                    session.mediator.take_response().into_result()?;
                    return Err(PgError::Copy(format!(
                        "Statement did not start COPY OUT: {}",
                        sql
                    )));
                }
                _ => {}
            }
        }

        let format = session.state.copy_format().cloned().unwrap_or_default();
        debug!("COPY OUT started ({} columns)", format.column_count());
        session.unfinished = Some(Unfinished::CopyOut);
        Ok(CopyOutStream {
            cycle,
            format,
            done: false,
            _connector: PhantomData,
        })
    }

    /// COPY IN fed from `source` in fixed-size chunks.
    ///
    /// A read failure on the source aborts the copy with CopyFail.
    pub async fn copy_in_from<R>(&mut self, sql: &str, mut source: R) -> PgResult<Response>
    where
        R: AsyncRead + Unpin,
    {
        let mut stream = self.start_copy_in(sql).await?;
        let mut chunk = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            let n = match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    if let Err(cancel_err) = stream.cancel(&format!("source read failed: {}", err)).await {
                        debug!("CopyFail after source error failed: {}", cancel_err);
                    }
                    return Err(PgError::Io(err));
                }
            };
            stream.write(&chunk[..n]).await?;
        }
        stream.finish().await
    }

    /// COPY OUT drained into `sink`.
    pub async fn copy_out_to<W>(&mut self, sql: &str, mut sink: W) -> PgResult<Response>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.start_copy_out(sql).await?;
        while let Some(data) = stream.read().await? {
            sink.write_all(&data).await?;
        }
        sink.flush().await?;
        stream.finish().await
    }
}

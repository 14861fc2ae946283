//! Forward-only row streaming.
//!
//! Buffered reads go through [`Response`]; a [`RowStream`] instead hands out
//! rows as they are decoded, keeping the connector locked until the cycle
//! reaches ReadyForQuery. A stream dropped early leaves the cycle marked
//! unfinished and the connector's next operation drains it.

use std::marker::PhantomData;
use std::sync::Arc;

use super::backend::RowDescription;
use super::connector::{Connector, Cycle};
use super::error::{ErrorList, PgError, PgResult};
use super::mediator::{Response, Row};
use super::state::{Drained, Until};

/// Rows of one simple query, read one at a time.
pub struct RowStream<'a> {
    cycle: Cycle,
    done: bool,
    _connector: PhantomData<&'a mut Connector>,
}

impl<'a> RowStream<'a> {
    pub(crate) fn new(cycle: Cycle, marker: PhantomData<&'a mut Connector>) -> Self {
        Self {
            cycle,
            done: false,
            _connector: marker,
        }
    }

    /// Description of the rows currently being read.
    pub fn description(&self) -> Option<&Arc<RowDescription>> {
        self.cycle.session.last_description.as_ref()
    }

    /// Next row, or `None` once the server is ready for the next query.
    ///
    /// Backend errors for the cycle are returned when the end is reached.
    pub async fn next_row(&mut self) -> PgResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }
        let session = &mut self.cycle.session;
        loop {
            let drained = match session.drain(Until::NextRow).await {
                Ok(drained) => drained,
                Err(err) => {
                    self.done = true;
                    if !session.is_open() {
                        session.unfinished = None;
                    }
                    return Err(err);
                }
            };
            match drained {
                Drained::Row(row) => return Ok(Some(row)),
                Drained::Ready => {
                    self.done = true;
                    session.unfinished = None;
                    if session.mediator.has_errors() {
                        return Err(PgError::Backend(ErrorList(session.mediator.take_errors())));
                    }
                    return Ok(None);
                }
                Drained::CopyIn => {
                    let refused = session.refuse_copy_in().await;
                    session.guard(refused)?;
                }
                _ => {}
            }
        }
    }

    /// Skip any remaining rows and return the rest of the cycle's response
    /// (completion tags, notices, notifications).
    pub async fn finish(mut self) -> PgResult<Response> {
        while self.next_row().await?.is_some() {}
        Ok(self.cycle.session.mediator.take_response())
    }
}

//! Per-cycle response buffering.
//!
//! The [`Mediator`] collects everything the backend says between a request
//! and the end of its reply: errors, notices, notifications, result sets and
//! command completions. It is reset before every request and emptied into a
//! [`Response`] afterwards, so nothing leaks from one cycle into the next.

use std::sync::Arc;

use bytes::Bytes;

use super::backend::{RowDescription, RowValues};
use super::error::{BackendError, ErrorList, PgError, PgResult};
use super::notification::Notification;
use super::types::Oid;

// ============================================================================
// Rows
// ============================================================================

/// One row of raw field values, paired with the description it was read
/// under. Rows are immutable once read from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    description: Arc<RowDescription>,
    values: RowValues,
}

impl Row {
    pub(crate) fn new(description: Arc<RowDescription>, values: RowValues) -> Self {
        Self {
            description,
            values,
        }
    }

    pub fn description(&self) -> &Arc<RowDescription> {
        &self.description
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw bytes of field `index`; `None` for NULL or out of range.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn is_null(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(None))
    }

    /// Field `index` as text (lossy for non-UTF-8 bytes).
    pub fn get_str(&self, index: usize) -> Option<std::borrow::Cow<'_, str>> {
        self.get(index).map(String::from_utf8_lossy)
    }

    /// Raw bytes of the first field named `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&[u8]> {
        self.description.index_of(name).and_then(|i| self.get(i))
    }

    pub fn values(&self) -> &[Option<Bytes>] {
        &self.values
    }
}

// ============================================================================
// Completion
// ============================================================================

/// A CommandComplete tag and what can be read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedResponse {
    pub tag: String,
    pub rows_affected: u64,
    /// OID reported by a single-row INSERT into a table with OIDs.
    pub last_inserted_oid: Option<Oid>,
}

impl CompletedResponse {
    pub fn new(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            rows_affected: parse_rows_affected(&tag),
            last_inserted_oid: parse_inserted_oid(&tag),
            tag,
        }
    }

    /// First word of the tag, e.g. `INSERT`.
    pub fn command(&self) -> &str {
        self.tag.split_whitespace().next().unwrap_or("")
    }
}

/// Parse rows affected from a PostgreSQL command tag.
pub fn parse_rows_affected(tag: &str) -> u64 {
    // Common formats:
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3" -> 3 rows
    // - "DELETE 2" -> 2 rows
    // - "SELECT 10" -> 10 rows
    // - "COPY 7" / "MOVE 1" / "FETCH 4"

    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["COPY", n]
        | ["MOVE", n]
        | ["FETCH", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

fn parse_inserted_oid(tag: &str) -> Option<Oid> {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", oid, _] => oid
            .parse::<i32>()
            .ok()
            .filter(|oid| *oid != 0)
            .map(Oid::from_i32),
        _ => None,
    }
}

// ============================================================================
// Result sets and responses
// ============================================================================

/// Rows of one statement together with their description.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub description: Arc<RowDescription>,
    pub rows: Vec<Row>,
    pub completed: Option<CompletedResponse>,
}

impl ResultSet {
    fn new(description: Arc<RowDescription>) -> Self {
        Self {
            description,
            rows: Vec::new(),
            completed: None,
        }
    }
}

/// Everything buffered during one request cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub errors: Vec<BackendError>,
    pub notices: Vec<BackendError>,
    pub notifications: Vec<Notification>,
    pub result_sets: Vec<ResultSet>,
    pub completed: Vec<CompletedResponse>,
    /// From a statement Describe.
    pub parameter_description: Option<Vec<Oid>>,
    /// From a Describe; `None` with `described` set means NoData.
    pub row_description: Option<Arc<RowDescription>>,
    pub described: bool,
    /// COPY OUT payload received while no pull stream was open.
    pub copy_out: Vec<Bytes>,
    /// Execute stopped at its row limit.
    pub portal_suspended: bool,
}

impl Response {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fail with every collected error if there is at least one.
    ///
    /// Rows buffered alongside an error are discarded with the response.
    pub fn into_result(self) -> PgResult<Response> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(PgError::Backend(ErrorList(self.errors)))
        }
    }

    /// Rows affected by the last completed command.
    pub fn rows_affected(&self) -> u64 {
        self.completed.last().map(|c| c.rows_affected).unwrap_or(0)
    }

    /// All rows of all result sets, in order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.result_sets.iter().flat_map(|rs| rs.rows.iter())
    }
}

// ============================================================================
// Mediator
// ============================================================================

/// Buffers for one request/response cycle.
#[derive(Debug, Default)]
pub struct Mediator {
    errors: Vec<BackendError>,
    notices: Vec<BackendError>,
    notifications: Vec<Notification>,
    result_sets: Vec<ResultSet>,
    completed: Vec<CompletedResponse>,
    parameter_description: Option<Vec<Oid>>,
    row_description: Option<Arc<RowDescription>>,
    described: bool,
    copy_out: Vec<Bytes>,
    portal_suspended: bool,
    /// Result set being assembled.
    pending: Option<ResultSet>,
}

impl Mediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything from the previous cycle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_error(&mut self, error: BackendError) {
        self.errors.push(error);
    }

    pub fn add_notice(&mut self, notice: BackendError) {
        self.notices.push(notice);
    }

    pub fn add_notification(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[BackendError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<BackendError> {
        std::mem::take(&mut self.errors)
    }

    /// A RowDescription opens a new result set.
    pub fn begin_result(&mut self, description: Arc<RowDescription>) {
        self.close_pending();
        self.row_description = Some(description.clone());
        self.described = true;
        self.pending = Some(ResultSet::new(description));
    }

    /// Description rows are currently being read under, if any.
    pub fn current_description(&self) -> Option<&Arc<RowDescription>> {
        self.pending.as_ref().map(|rs| &rs.description)
    }

    /// Append a row. Rows arriving without a RowDescription in this cycle
    /// (Execute after an earlier Describe) open a result set under the
    /// row's own description.
    pub fn add_row(&mut self, row: Row) {
        let pending = self
            .pending
            .get_or_insert_with(|| ResultSet::new(row.description.clone()));
        pending.rows.push(row);
    }

    /// CommandComplete closes the pending result set and records the tag.
    pub fn complete(&mut self, tag: String) {
        let completed = CompletedResponse::new(tag);
        if let Some(mut rs) = self.pending.take() {
            rs.completed = Some(completed.clone());
            self.result_sets.push(rs);
        }
        self.completed.push(completed);
    }

    pub fn set_no_data(&mut self) {
        self.row_description = None;
        self.described = true;
    }

    pub fn set_parameter_description(&mut self, type_oids: Vec<Oid>) {
        self.parameter_description = Some(type_oids);
    }

    pub fn push_copy_data(&mut self, data: Bytes) {
        self.copy_out.push(data);
    }

    pub fn set_portal_suspended(&mut self) {
        self.portal_suspended = true;
    }

    fn close_pending(&mut self) {
        if let Some(rs) = self.pending.take() {
            if !rs.rows.is_empty() {
                self.result_sets.push(rs);
            }
        }
    }

    /// Hand the buffers to the caller, leaving the mediator empty.
    pub fn take_response(&mut self) -> Response {
        self.close_pending();
        let m = std::mem::take(self);
        Response {
            errors: m.errors,
            notices: m.notices,
            notifications: m.notifications,
            result_sets: m.result_sets,
            completed: m.completed,
            parameter_description: m.parameter_description,
            row_description: m.row_description,
            described: m.described,
            copy_out: m.copy_out,
            portal_suspended: m.portal_suspended,
        }
    }
}

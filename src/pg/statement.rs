//! Prepared statement naming and caching.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side prepared statement
//! - `StatementCache`: O(1) LRU cache of prepared statements per connector

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::backend::RowDescription;
use super::types::Oid;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement parsed by the server under a connector-scoped name.
///
/// Created by Parse and executed any number of times via Bind + Execute.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    /// Server-side name (e.g. `_p1`)
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result description, `None` for statements that return no rows
    pub description: Option<Arc<RowDescription>>,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            description: None,
        }
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        self.description.as_ref().is_some_and(|d| !d.is_empty())
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements, keyed by SQL text.
///
/// Evicted statements are remembered until the connector's next cycle
/// closes them on the server.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
    next_statement: u32,
    next_portal: u32,
    /// Evicted statement names not yet closed on the server
    pending_close: Vec<String>,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.cache.len())
            .field("cap", &self.cache.cap())
            .field("pending_close", &self.pending_close)
            .finish()
    }
}

impl StatementCache {
    /// Create a cache holding at most `capacity` statements (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_statement: 0,
            next_portal: 0,
            pending_close: Vec::new(),
        }
    }

    /// Look up by query text without touching LRU order.
    pub fn get(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(query).map(Arc::clone)
    }

    /// Look up and mark as recently used.
    pub fn get_and_touch(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(query).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, query: &str) -> bool {
        self.cache.contains(query)
    }

    /// Insert a statement. If the cache is full the least recently used
    /// entry is evicted; its name is queued for closing and returned.
    pub fn insert(&mut self, statement: PreparedStatement) -> Option<String> {
        let query = statement.query.clone();
        let name = statement.name.clone();
        // push() hands back either the LRU victim or the entry replaced
        // under the same key; both are unreachable afterwards.
        let evicted = self
            .cache
            .push(query, Arc::new(statement))
            .map(|(_, old)| old.name.clone())
            .filter(|old| *old != name);
        if let Some(name) = &evicted {
            self.pending_close.push(name.clone());
        }
        evicted
    }

    /// Remove a statement; its server-side name is queued for closing.
    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        let removed = self.cache.pop(query);
        if let Some(stmt) = &removed {
            self.pending_close.push(stmt.name.clone());
        }
        removed
    }

    /// Names to close on the server before the next cycle.
    pub fn take_pending_close(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_close)
    }

    /// Next unique statement name for this connector.
    pub fn next_statement_name(&mut self) -> String {
        self.next_statement += 1;
        format!("_p{}", self.next_statement)
    }

    /// Next unique portal name for this connector.
    pub fn next_portal_name(&mut self) -> String {
        self.next_portal += 1;
        format!("_c{}", self.next_portal)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget all statements, e.g. after reconnecting. Nothing is closed on
    /// the server because the session that owned them is gone.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.pending_close.clear();
        self.next_statement = 0;
        self.next_portal = 0;
    }

    /// All cached statement names.
    pub fn statement_names(&self) -> Vec<String> {
        self.cache.iter().map(|(_, stmt)| stmt.name.clone()).collect()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        // Default capacity of 100 statements per connector
        Self::new(100)
    }
}

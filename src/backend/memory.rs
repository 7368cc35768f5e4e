//! In-process document store backend.
//!
//! A `MemoryBackend` holds named collections of JSON records shared by every
//! connection it creates. Statement text names a collection:
//!
//! - `query`/`open_cursor`: returns the collection's documents in insertion order,
//!   optionally filtered by a JSON object bound as the first parameter
//!   (field equality on every key).
//! - `execute`: appends every bound JSON object as a document.
//!
//! Writes inside a transaction are staged per connection and become visible to
//! other connections only on commit. Latency, capabilities and per-call faults
//! are configurable, which makes the backend the fixture for exercising retry,
//! circuit breaking and partial failure.

use super::{Connection, ConnectionFactory};
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, Capabilities, QueryParam, Record, Statement};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const BACKEND_NAME: &str = "memory";

/// Backend call sites where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Connect,
    Ping,
    Query,
    Execute,
    Insert,
    Fetch,
    Begin,
    Commit,
}

/// An injected failure: which calls fail and how the failure is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    skip: u64,
    times: Option<u64>,
    transient: bool,
}

impl Fault {
    /// Fail with a retryable error (connection reset, serialization failure).
    pub fn transient() -> Self {
        Self {
            skip: 0,
            times: None,
            transient: true,
        }
    }

    /// Fail with an error retrying cannot fix.
    pub fn fatal() -> Self {
        Self {
            transient: false,
            ..Self::transient()
        }
    }

    /// Let the first `calls` calls through before failing.
    pub fn after(mut self, calls: u64) -> Self {
        self.skip = calls;
        self
    }

    /// Fail at most `times` calls, then recover.
    pub fn times(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    fn fires(&self, call: u64) -> bool {
        call > self.skip && self.times.is_none_or(|t| call <= self.skip + t)
    }

    fn error(&self, point: FaultPoint) -> DbError {
        let message = format!("injected {point:?} fault");
        match (point, self.transient) {
            (FaultPoint::Connect | FaultPoint::Ping, true) => DbError::connection(message),
            (FaultPoint::Connect | FaultPoint::Ping, false) => DbError::connection_fatal(message),
            (_, true) => DbError::query_transient(message, None),
            (_, false) => DbError::query(message, None),
        }
    }
}

#[derive(Debug)]
struct ArmedFault {
    fault: Fault,
    seen: u64,
}

#[derive(Debug, Clone)]
struct Settings {
    capabilities: Capabilities,
    latency: Duration,
}

type Collections = HashMap<String, Vec<Record>>;

#[derive(Debug)]
struct Store {
    name: String,
    collections: Mutex<Collections>,
    settings: Mutex<Settings>,
    faults: DashMap<FaultPoint, ArmedFault>,
    calls: DashMap<FaultPoint, u64>,
    next_connection: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Store {
    fn collections(&self) -> MutexGuard<'_, Collections> {
        self.collections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> Settings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check(&self, point: FaultPoint) -> DbResult<()> {
        *self.calls.entry(point).or_insert(0) += 1;
        if let Some(mut armed) = self.faults.get_mut(&point) {
            armed.seen += 1;
            if armed.fault.fires(armed.seen) {
                return Err(armed.fault.error(point));
            }
        }
        Ok(())
    }
}

/// Tracks one in-progress backend call.
struct InFlight(Arc<Store>);

impl InFlight {
    fn enter(store: &Arc<Store>) -> Self {
        let now = store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        store.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(store))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulate a round trip: count the call, wait out the latency, apply faults.
async fn round_trip(store: &Arc<Store>, point: FaultPoint) -> DbResult<InFlight> {
    let guard = InFlight::enter(store);
    let latency = store.settings().latency;
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    store.check(point)?;
    Ok(guard)
}

/// Factory and shared state of an in-memory document store.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<Store>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            store: Arc::new(Store {
                name: name.into(),
                collections: Mutex::new(HashMap::new()),
                settings: Mutex::new(Settings {
                    capabilities: Capabilities::default(),
                    latency: Duration::ZERO,
                }),
                faults: DashMap::new(),
                calls: DashMap::new(),
                next_connection: AtomicU64::new(1),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        self.store
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .capabilities = capabilities;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Delay applied to every backend call, including connect.
    pub fn set_latency(&self, latency: Duration) {
        self.store
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latency = latency;
    }

    pub fn name(&self) -> &str {
        &self.store.name
    }

    /// Arm a fault at `point`, replacing any fault already armed there.
    pub fn inject(&self, point: FaultPoint, fault: Fault) {
        self.store
            .faults
            .insert(point, ArmedFault { fault, seen: 0 });
    }

    pub fn clear_fault(&self, point: FaultPoint) {
        self.store.faults.remove(&point);
    }

    pub fn clear_faults(&self) {
        self.store.faults.clear();
    }

    /// Number of calls made at `point`, failed ones included.
    pub fn calls(&self, point: FaultPoint) -> u64 {
        self.store.calls.get(&point).map(|c| *c).unwrap_or(0)
    }

    pub fn connections_opened(&self) -> u64 {
        self.store.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.store.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.store.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous backend calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.store.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Insert committed documents directly, bypassing connections and faults.
    pub fn seed(&self, collection: &str, records: impl IntoIterator<Item = Record>) {
        self.store
            .collections()
            .entry(collection.to_string())
            .or_default()
            .extend(records);
    }

    /// Committed documents of a collection.
    pub fn documents(&self, collection: &str) -> Vec<Record> {
        self.store
            .collections()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.store
            .collections()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        self.store.settings().capabilities
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let _call = round_trip(&self.store, FaultPoint::Connect).await?;
        let id = self.store.next_connection.fetch_add(1, Ordering::SeqCst);
        self.store.opened.fetch_add(1, Ordering::SeqCst);
        debug!(store = %self.store.name, connection_id = id, "Opened memory connection");
        Ok(Box::new(MemoryConnection {
            id,
            store: Arc::clone(&self.store),
            capabilities: self.capabilities(),
            cursor: None,
            staged: None,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct Cursor {
    collection: String,
    filter: Option<Record>,
    position: usize,
}

#[derive(Debug, Default)]
struct Staged {
    writes: Collections,
    savepoints: Vec<(String, Collections)>,
}

/// One session against a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    store: Arc<Store>,
    capabilities: Capabilities,
    cursor: Option<Cursor>,
    staged: Option<Staged>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> DbResult<()> {
        if self.closed {
            return Err(DbError::connection_fatal(format!(
                "memory connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    /// Documents visible to this connection, committed first then staged.
    fn visible<'a>(
        committed: &'a Collections,
        staged: Option<&'a Staged>,
        collection: &str,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        let committed = committed.get(collection).into_iter().flatten();
        let staged = staged
            .and_then(|s| s.writes.get(collection))
            .into_iter()
            .flatten();
        committed.chain(staged)
    }

    fn append(&mut self, collection: &str, documents: Vec<Record>) -> u64 {
        let written = documents.len() as u64;
        match self.staged.as_mut() {
            Some(staged) => staged
                .writes
                .entry(collection.to_string())
                .or_default()
                .extend(documents),
            None => self
                .store
                .collections()
                .entry(collection.to_string())
                .or_default()
                .extend(documents),
        }
        written
    }

    fn staged_mut(&mut self) -> DbResult<&mut Staged> {
        self.staged
            .as_mut()
            .ok_or_else(|| DbError::invalid_input("no transaction in progress"))
    }
}

fn collection_name(stmt: &Statement) -> DbResult<&str> {
    let name = stmt.text.trim();
    if name.is_empty() {
        return Err(DbError::invalid_input("statement must name a collection"));
    }
    Ok(name)
}

fn filter_of(stmt: &Statement) -> Option<Record> {
    match stmt.params.first() {
        Some(QueryParam::Json(JsonValue::Object(filter))) => Some(filter.clone()),
        _ => None,
    }
}

fn matches(record: &Record, filter: Option<&Record>) -> bool {
    filter.is_none_or(|f| f.iter().all(|(k, v)| record.get(k) == Some(v)))
}

fn documents_of(stmt: &Statement) -> DbResult<Vec<Record>> {
    stmt.params
        .iter()
        .map(|param| match param {
            QueryParam::Json(JsonValue::Object(doc)) => Ok(doc.clone()),
            other => Err(DbError::invalid_input(format!(
                "memory documents must be JSON objects, got {}",
                other.type_name()
            ))),
        })
        .collect()
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn ping(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        let _call = round_trip(&self.store, FaultPoint::Ping).await?;
        Ok(())
    }

    async fn execute(&mut self, stmt: &Statement) -> DbResult<u64> {
        self.ensure_open()?;
        let collection = collection_name(stmt)?;
        let documents = documents_of(stmt)?;
        let _call = round_trip(&self.store, FaultPoint::Execute).await?;
        Ok(self.append(collection, documents))
    }

    async fn query(&mut self, stmt: &Statement) -> DbResult<Vec<Record>> {
        self.ensure_open()?;
        let collection = collection_name(stmt)?;
        let filter = filter_of(stmt);
        let _call = round_trip(&self.store, FaultPoint::Query).await?;
        let committed = self.store.collections();
        Ok(Self::visible(&committed, self.staged.as_ref(), collection)
            .filter(|r| matches(r, filter.as_ref()))
            .cloned()
            .collect())
    }

    async fn open_cursor(&mut self, stmt: &Statement) -> DbResult<()> {
        self.ensure_open()?;
        if self.cursor.is_some() {
            return Err(DbError::invalid_input("a cursor is already open on this connection"));
        }
        let collection = collection_name(stmt)?.to_string();
        let _call = round_trip(&self.store, FaultPoint::Query).await?;
        self.cursor = Some(Cursor {
            collection,
            filter: filter_of(stmt),
            position: 0,
        });
        Ok(())
    }

    async fn fetch_cursor(&mut self, max: usize) -> DbResult<Vec<Record>> {
        self.ensure_open()?;
        if self.cursor.is_none() {
            return Err(DbError::invalid_input("no cursor is open on this connection"));
        }
        let _call = round_trip(&self.store, FaultPoint::Fetch).await?;
        let Some(cursor) = self.cursor.as_mut() else {
            return Err(DbError::invalid_input("no cursor is open on this connection"));
        };
        let committed = self.store.collections();
        let batch: Vec<Record> = Self::visible(&committed, self.staged.as_ref(), &cursor.collection)
            .filter(|r| matches(r, cursor.filter.as_ref()))
            .skip(cursor.position)
            .take(max)
            .cloned()
            .collect();
        cursor.position += batch.len();
        Ok(batch)
    }

    async fn close_cursor(&mut self) -> DbResult<()> {
        self.cursor = None;
        Ok(())
    }

    async fn insert_many(&mut self, target: &str, records: &[Record]) -> DbResult<u64> {
        self.ensure_open()?;
        if target.trim().is_empty() {
            return Err(DbError::invalid_input("insert target must name a collection"));
        }
        let _call = round_trip(&self.store, FaultPoint::Insert).await?;
        Ok(self.append(target.trim(), records.to_vec()))
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        if !self.capabilities.transactions {
            return Err(DbError::capability(BACKEND_NAME, "transactions"));
        }
        if self.staged.is_some() {
            return Err(DbError::invalid_input("transaction already in progress"));
        }
        let _call = round_trip(&self.store, FaultPoint::Begin).await?;
        self.staged = Some(Staged::default());
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.staged_mut()?;
        let _call = round_trip(&self.store, FaultPoint::Commit).await?;
        if let Some(staged) = self.staged.take() {
            let mut committed = self.store.collections();
            for (collection, documents) in staged.writes {
                committed.entry(collection).or_default().extend(documents);
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.staged_mut()?;
        self.staged = None;
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_open()?;
        if !self.capabilities.savepoints {
            return Err(DbError::capability(BACKEND_NAME, "savepoints"));
        }
        let staged = self.staged_mut()?;
        let snapshot = staged.writes.clone();
        staged.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_open()?;
        if !self.capabilities.savepoints {
            return Err(DbError::capability(BACKEND_NAME, "savepoints"));
        }
        let staged = self.staged_mut()?;
        let Some(pos) = staged.savepoints.iter().rposition(|(n, _)| n == name) else {
            return Err(DbError::invalid_input(format!("unknown savepoint '{name}'")));
        };
        // The savepoint itself survives, later ones are released
        staged.savepoints.truncate(pos + 1);
        staged.writes = staged.savepoints[pos].1.clone();
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        if !self.closed {
            self.closed = true;
            self.cursor = None;
            self.staged = None;
            self.store.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }
}

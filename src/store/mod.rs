//! Embedded store engines and the process-wide engine registry.
//!
//! Every agent identity gets one SQLite database (`agents/<code>/agent.db`)
//! holding all skill tables plus the framework tables.  Engines are cached
//! by store URL; the runtime owns their lifetime and skills never close
//! them.

pub mod migrate;
pub mod repo;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::{FrameworkError, Result};

/// Default busy-wait timeout before a locked store call gives up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// Opt-in timeout for skills with heavier write patterns.
pub const HEAVY_WRITE_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-engine construction options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub busy_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl EngineOptions {
    /// The 30-second profile for write-heavy skills.
    pub fn heavy_write() -> Self {
        Self {
            busy_timeout: HEAVY_WRITE_BUSY_TIMEOUT,
        }
    }
}

/// A cached handle to one embedded store.
///
/// Cross-thread use is allowed; SQLite serializes writes via WAL
/// journaling and the busy timeout absorbs short lock contention.
pub struct StoreEngine {
    url: String,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEngine").field("url", &self.url).finish()
    }
}

impl StoreEngine {
    /// Open (or create) a store at `url` and apply the
    /// durable-enough, fast-enough pragma profile.
    fn open(url: &str, opts: &EngineOptions) -> Result<Self> {
        let conn = if url == ":memory:" || url.starts_with("file::memory:") {
            Connection::open(url)
        } else {
            let path = Path::new(url);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FrameworkError::Config(format!("cannot create store dir: {e}")))?;
            }
            Connection::open(path)
        }
        .map_err(FrameworkError::from_store)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(FrameworkError::from_store)?;
        conn.busy_timeout(opts.busy_timeout)
            .map_err(FrameworkError::from_store)?;

        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Lock the underlying connection.
    ///
    /// Prefer [`StoreEngine::with_conn`]; this exists for the
    /// unit-of-work layer which needs to hold the session across a scope.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    /// Run a closure against the connection, classifying errors.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.lock();
        f(&conn).map_err(FrameworkError::from_store)
    }

    /// Execute a single statement, returning the affected row count.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        self.with_conn(|conn| conn.execute(sql, params))
    }

    /// Run a query and collect each row as a JSON object keyed by column
    /// name.  This is the dynamic path used by the RPC surface and the
    /// restricted context; typed access goes through [`repo`].
    pub fn query_json(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<serde_json::Value>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let names: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(|s| s.to_string())
                .collect();
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = serde_json::Map::new();
                for (idx, name) in names.iter().enumerate() {
                    obj.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
                }
                out.push(serde_json::Value::Object(obj));
            }
            Ok(out)
        })
    }

    /// Run `f` inside a single transaction; commit on `Ok`, roll back on
    /// `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(FrameworkError::from_store)?;
        let out = f(&tx).map_err(FrameworkError::from_store)?;
        tx.commit().map_err(FrameworkError::from_store)?;
        Ok(out)
    }
}

fn value_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> serde_json::Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::from(hex::encode(b)),
    }
}

// ── Engine registry ─────────────────────────────────────────

/// Cache of open engines keyed by store URL.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Mutex<HashMap<String, Arc<StoreEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry; [`EngineRegistry::dispose_all`] on it is
    /// part of runtime teardown.
    pub fn global() -> &'static EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::new)
    }

    /// Return the cached engine for `url`, opening it on first request.
    pub fn get_engine(&self, url: &str) -> Result<Arc<StoreEngine>> {
        self.get_engine_with(url, &EngineOptions::default())
    }

    /// Like [`EngineRegistry::get_engine`] with explicit options.
    /// Options apply only when the engine is first opened.
    pub fn get_engine_with(&self, url: &str, opts: &EngineOptions) -> Result<Arc<StoreEngine>> {
        let mut engines = self.engines.lock().expect("engine registry poisoned");
        if let Some(engine) = engines.get(url) {
            return Ok(engine.clone());
        }
        let engine = Arc::new(StoreEngine::open(url, opts)?);
        info!(url, "opened store engine");
        engines.insert(url.to_string(), engine.clone());
        Ok(engine)
    }

    /// Release one cached handle. Outstanding `Arc`s keep the connection
    /// alive until dropped.
    pub fn dispose(&self, url: &str) {
        let mut engines = self.engines.lock().expect("engine registry poisoned");
        if engines.remove(url).is_some() {
            debug!(url, "disposed store engine");
        }
    }

    /// Release every cached handle. Idempotent; safe at process exit.
    pub fn dispose_all(&self) {
        let mut engines = self.engines.lock().expect("engine registry poisoned");
        if !engines.is_empty() {
            info!(count = engines.len(), "disposing all store engines");
        }
        engines.clear();
    }

    /// Number of live cached engines.
    pub fn len(&self) -> usize {
        self.engines.lock().expect("engine registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

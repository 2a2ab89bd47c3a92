//! Database engine - single connection, prioritised batch queue
//!
//! One worker thread owns the SQLite connection. Callers enqueue statements
//! and await a oneshot reply. Reads go to a read lane that is always drained
//! before the write lane; each lane is FIFO. A drain takes up to
//! `batch_size` jobs and runs them in one transaction, each job isolated in
//! a savepoint so a failing statement only fails its own caller.

use crate::config::EngineConfig;
use crate::lock;
use crate::value::{Row, Value};
use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

use super::stats::{StatsObserver, StatsSnapshot, WriteStats};

/// A SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Whether the statement only reads.
    pub fn is_read(&self) -> bool {
        let keyword: String = self
            .sql
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();
        matches!(keyword.as_str(), "SELECT" | "PRAGMA" | "WITH" | "EXPLAIN" | "VALUES")
    }
}

/// Uniform result shape for every statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: Option<usize>,
    pub insert_id: Option<i64>,
}

enum Work {
    Single(Statement),
    /// All-or-nothing sequence
    Script(Vec<Statement>),
}

struct Job {
    work: Work,
    read: bool,
    reply: oneshot::Sender<Result<RowSet>>,
}

#[derive(Default)]
struct Queue {
    reads: VecDeque<Job>,
    writes: VecDeque<Job>,
}

impl Queue {
    fn push(&mut self, job: Job) {
        if job.read {
            self.reads.push_back(job);
        } else {
            self.writes.push_back(job);
        }
    }

    /// Up to `max` jobs, reads first.
    fn take(&mut self, max: usize) -> Vec<Job> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            match self.reads.pop_front().or_else(|| self.writes.pop_front()) {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        batch
    }

    fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }
}

struct Shared {
    queue: Mutex<Queue>,
    stats: WriteStats,
    closed: AtomicBool,
}

struct Inner {
    shared: Arc<Shared>,
    wake: Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.wake.try_send(());
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!("database worker panicked");
            }
        }
    }
}

/// Handle to the engine. Cheap to clone; the worker stops when the last
/// handle is dropped, after draining whatever is still queued.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open the database named by `config` (in-memory when no path is set).
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let conn = match &config.database {
            Some(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        Self::with_connection(conn, config)
    }

    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    /// Hand an already-open connection to a new worker.
    pub fn with_connection(conn: Connection, config: &EngineConfig) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            stats: WriteStats::default(),
            closed: AtomicBool::new(false),
        });
        let (wake_tx, wake_rx) = channel::bounded(1);
        let worker = Worker {
            conn,
            shared: shared.clone(),
            wake: wake_rx,
            batch_size: config.batch_size.max(1),
            interval: Duration::from_millis(config.drain_interval_ms.max(1)),
        };
        let handle = std::thread::Builder::new()
            .name("lightcrud-db".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                wake: wake_tx,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Queue one statement and wait for its result.
    pub async fn execute(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<RowSet> {
        let statement = Statement::new(sql, params);
        let read = statement.is_read();
        self.submit(Work::Single(statement), read).await
    }

    pub async fn execute_statement(&self, statement: Statement) -> Result<RowSet> {
        let read = statement.is_read();
        self.submit(Work::Single(statement), read).await
    }

    /// Queue a sequence that commits as a unit. Returns the last statement's
    /// result; on failure nothing from the script is kept.
    pub async fn execute_script(&self, statements: Vec<Statement>) -> Result<RowSet> {
        self.submit(Work::Script(statements), false).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.shared.stats.snapshot()
    }

    pub fn observe(&self, observer: Arc<dyn StatsObserver>) {
        self.inner.shared.stats.observe(observer);
    }

    async fn submit(&self, work: Work, read: bool) -> Result<RowSet> {
        let shared = &self.inner.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(Error::EngineClosed);
        }

        let (reply, response) = oneshot::channel();
        if !read {
            shared.stats.record_queued();
        }
        lock(&shared.queue).push(Job { work, read, reply });
        // A full channel already means a wake-up is pending.
        let _ = self.inner.wake.try_send(());

        response.await.map_err(|_| Error::EngineClosed)?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("queued", &lock(&self.inner.shared.queue).len())
            .field("stats", &self.inner.shared.stats)
            .finish()
    }
}

struct Worker {
    conn: Connection,
    shared: Arc<Shared>,
    wake: Receiver<()>,
    batch_size: usize,
    interval: Duration,
}

impl Worker {
    fn run(mut self) {
        loop {
            let disconnected = matches!(
                self.wake.recv_timeout(self.interval),
                Err(RecvTimeoutError::Disconnected)
            );

            loop {
                let batch = lock(&self.shared.queue).take(self.batch_size);
                if batch.is_empty() {
                    break;
                }
                self.run_batch(batch);
            }

            if disconnected || self.shared.closed.load(Ordering::SeqCst) {
                break;
            }
        }
        tracing::debug!("database worker stopped");
    }

    fn run_batch(&mut self, batch: Vec<Job>) {
        let writes = batch.iter().filter(|job| !job.read).count() as u64;
        tracing::debug!(jobs = batch.len(), writes, "draining batch");

        if let Err(e) = self.conn.execute_batch("BEGIN") {
            let message = e.to_string();
            for job in batch {
                let _ = job.reply.send(Err(Error::Batch(message.clone())));
            }
            return;
        }

        let mut results: Vec<Result<RowSet>> = batch.iter().map(|job| self.run_isolated(&job.work)).collect();

        if let Err(e) = self.conn.execute_batch("COMMIT") {
            tracing::error!("batch commit failed: {}", e);
            let _ = self.conn.execute_batch("ROLLBACK");
            let message = e.to_string();
            for result in results.iter_mut().filter(|r| r.is_ok()) {
                *result = Err(Error::Batch(message.clone()));
            }
        }

        self.shared.stats.record_executed(writes);
        for (job, result) in batch.into_iter().zip(results) {
            let _ = job.reply.send(result);
        }
    }

    fn run_isolated(&self, work: &Work) -> Result<RowSet> {
        self.conn.execute_batch("SAVEPOINT job")?;
        let result = match work {
            Work::Single(statement) => run_statement(&self.conn, statement),
            Work::Script(statements) => statements
                .iter()
                .try_fold(RowSet::default(), |_, statement| run_statement(&self.conn, statement)),
        };
        let cleanup = match &result {
            Ok(_) => "RELEASE job",
            Err(e) => {
                tracing::warn!("statement failed: {}", e);
                "ROLLBACK TO job; RELEASE job"
            }
        };
        self.conn.execute_batch(cleanup)?;
        result
    }
}

fn run_statement(conn: &Connection, statement: &Statement) -> Result<RowSet> {
    let mut stmt = conn.prepare(&statement.sql)?;
    let params = rusqlite::params_from_iter(statement.params.iter());

    if stmt.column_count() > 0 {
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (i, name) in columns.iter().enumerate() {
                record.insert(name.clone(), row.get::<_, Value>(i)?);
            }
            records.push(record);
        }
        return Ok(RowSet {
            columns,
            rows: records,
            ..Default::default()
        });
    }

    let affected = stmt.execute(params)?;
    let is_insert = statement
        .sql
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"));
    Ok(RowSet {
        rows_affected: Some(affected),
        insert_id: (is_insert && affected > 0).then(|| conn.last_insert_rowid()),
        ..Default::default()
    })
}

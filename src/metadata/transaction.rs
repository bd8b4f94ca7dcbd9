//! Nested transactions via savepoints, retry-with-backoff, timeout-bounded
//! execution, and a bounded in-memory transaction log, exactly as described
//! for the metadata store.

use crate::errors::{EngineError, Result};
use crate::sql::SqlConn;
use crate::types::{now_ms, random_u128, TransactionLogRecord, TransactionStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type TransactionEvent = String;
pub type TransactionEventHook = Arc<dyn Fn(TransactionEventPayload) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransactionEventPayload {
    pub kind: TransactionEvent,
    pub tx_id: u128,
    pub depth: u32,
}

/// Options accepted by [`TransactionManager::transaction`].
#[derive(Clone)]
pub struct TxOptions {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: Option<u64>,
    pub is_retryable: Option<Arc<dyn Fn(&EngineError) -> bool + Send + Sync>>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay_ms: 10, timeout_ms: None, is_retryable: None }
    }
}

impl From<&crate::config::TransactionConfig> for TxOptions {
    fn from(cfg: &crate::config::TransactionConfig) -> Self {
        Self { max_retries: cfg.max_retries, retry_delay_ms: cfg.retry_delay_ms, timeout_ms: cfg.timeout_ms, is_retryable: None }
    }
}

struct ActiveTx {
    id: u128,
    started_at: Instant,
    timeout: Option<Duration>,
    depth: AtomicU32,
}

/// Owns the nested-transaction state machine for one [`SqlConn`]. The
/// metadata store holds one of these alongside its connection.
pub struct TransactionManager {
    conn: Arc<SqlConn>,
    active: Mutex<Option<ActiveTx>>,
    savepoint_counter: AtomicU32,
    op_counter: AtomicU64,
    log: Mutex<VecDeque<TransactionLogRecord>>,
    max_log_entries: usize,
    on_event: Mutex<Option<TransactionEventHook>>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(conn: Arc<SqlConn>, max_log_entries: usize) -> Self {
        Self {
            conn,
            active: Mutex::new(None),
            savepoint_counter: AtomicU32::new(0),
            op_counter: AtomicU64::new(0),
            log: Mutex::new(VecDeque::new()),
            max_log_entries,
            on_event: Mutex::new(None),
        }
    }

    pub fn set_event_hook(&self, hook: TransactionEventHook) {
        *self.on_event.lock() = Some(hook);
    }

    fn emit(&self, kind: &str, tx_id: u128, depth: u32) {
        if let Some(hook) = self.on_event.lock().as_ref() {
            let payload = TransactionEventPayload { kind: kind.to_string(), tx_id, depth };
            let hook = hook.clone();
            // Swallow panics the hook might raise, per the spec's "exceptions
            // from the hook are swallowed" clause.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(payload)));
        }
    }

    fn push_log(&self, record: TransactionLogRecord) {
        let mut log = self.log.lock();
        log.push_back(record);
        while log.len() > self.max_log_entries {
            log.pop_front();
        }
    }

    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.active.lock().is_some()
    }

    #[must_use]
    pub fn transaction_depth(&self) -> u32 {
        self.active.lock().as_ref().map_or(0, |tx| tx.depth.load(Ordering::Relaxed))
    }

    /// Clears any local transaction state without touching the underlying
    /// connection; used on connection loss, per the spec's
    /// `recoverTransactions` contract.
    pub fn recover(&self) {
        *self.active.lock() = None;
        self.savepoint_counter.store(0, Ordering::Relaxed);
    }

    fn check_timeout(&self) -> Result<()> {
        let mut active = self.active.lock();
        if let Some(tx) = active.as_ref()
            && let Some(timeout) = tx.timeout
            && tx.started_at.elapsed() >= timeout
        {
            let tx_id = tx.id;
            let _ = self.conn.with(|c| c.execute_batch("ROLLBACK"));
            *active = None;
            self.savepoint_counter.store(0, Ordering::Relaxed);
            drop(active);
            self.emit("timeout", tx_id, 0);
            self.push_log(TransactionLogRecord {
                id: tx_id,
                status: TransactionStatus::TimedOut,
                started_at: now_ms(),
                ended_at: Some(now_ms()),
                operation_count: self.op_counter.load(Ordering::Relaxed),
                retry_count: 0,
                rollback_reason: Some("timeout".to_string()),
            });
            return Err(EngineError::Timeout);
        }
        Ok(())
    }

    /// Marks one write-style operation against the current transaction (or
    /// a no-op if none is active).
    pub fn record_operation(&self) {
        self.op_counter.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = self.active.lock().as_ref() {
            self.emit("operation", tx.id, tx.depth.load(Ordering::Relaxed));
        }
    }

    /// Begins one nesting level: `BEGIN` at depth 0, a numbered `SAVEPOINT`
    /// otherwise. Returns the transaction id and, for nested levels, the
    /// savepoint number used (so the matching commit/rollback names the same
    /// savepoint).
    fn begin_level(&self, timeout_ms: Option<u64>) -> Result<(u128, Option<u32>)> {
        let mut active = self.active.lock();
        match active.as_mut() {
            None => {
                self.conn.with(|c| c.execute_batch("BEGIN"))?;
                let id = random_u128();
                *active = Some(ActiveTx {
                    id,
                    started_at: Instant::now(),
                    timeout: timeout_ms.map(Duration::from_millis),
                    depth: AtomicU32::new(1),
                });
                drop(active);
                self.emit("begin", id, 1);
                Ok((id, None))
            }
            Some(tx) => {
                let n = self.savepoint_counter.fetch_add(1, Ordering::Relaxed) + 1;
                self.conn.with(|c| c.execute_batch(&format!("SAVEPOINT sp_{n}")))?;
                let depth = tx.depth.fetch_add(1, Ordering::Relaxed) + 1;
                let id = tx.id;
                drop(active);
                self.emit("begin", id, depth);
                Ok((id, Some(n)))
            }
        }
    }

    fn commit_level(&self, savepoint: Option<u32>) -> Result<()> {
        let mut active = self.active.lock();
        let Some(tx) = active.as_mut() else { return Err(EngineError::NoTransaction) };
        let id = tx.id;
        match savepoint {
            None => {
                let depth = tx.depth.fetch_sub(1, Ordering::Relaxed) - 1;
                debug_assert_eq!(depth, 0);
                self.conn.with(|c| c.execute_batch("COMMIT"))?;
                *active = None;
                self.savepoint_counter.store(0, Ordering::Relaxed);
                drop(active);
                self.emit("commit", id, 0);
                self.push_log(TransactionLogRecord {
                    id,
                    status: TransactionStatus::Committed,
                    started_at: now_ms(),
                    ended_at: Some(now_ms()),
                    operation_count: self.op_counter.load(Ordering::Relaxed),
                    retry_count: 0,
                    rollback_reason: None,
                });
            }
            Some(n) => {
                let depth = tx.depth.fetch_sub(1, Ordering::Relaxed) - 1;
                self.conn.with(|c| c.execute_batch(&format!("RELEASE SAVEPOINT sp_{n}")))?;
                drop(active);
                self.emit("commit", id, depth);
            }
        }
        Ok(())
    }

    fn rollback_level(&self, savepoint: Option<u32>, reason: &str) -> Result<()> {
        let mut active = self.active.lock();
        let Some(tx) = active.as_mut() else { return Err(EngineError::NoTransaction) };
        let id = tx.id;
        match savepoint {
            None => {
                let depth = tx.depth.fetch_sub(1, Ordering::Relaxed) - 1;
                debug_assert_eq!(depth, 0);
                let _ = self.conn.with(|c| c.execute_batch("ROLLBACK"));
                *active = None;
                self.savepoint_counter.store(0, Ordering::Relaxed);
                drop(active);
                self.emit("rollback", id, 0);
                self.push_log(TransactionLogRecord {
                    id,
                    status: TransactionStatus::RolledBack,
                    started_at: now_ms(),
                    ended_at: Some(now_ms()),
                    operation_count: self.op_counter.load(Ordering::Relaxed),
                    retry_count: 0,
                    rollback_reason: Some(reason.to_string()),
                });
            }
            Some(n) => {
                let depth = tx.depth.fetch_sub(1, Ordering::Relaxed) - 1;
                let _ = self.conn.with(|c| c.execute_batch(&format!("ROLLBACK TO SAVEPOINT sp_{n}")));
                drop(active);
                self.emit("rollback", id, depth);
            }
        }
        Ok(())
    }

    fn default_retryable(err: &EngineError) -> bool {
        err.is_retryable()
    }

    /// Runs `f` inside a (possibly nested) transaction, retrying on a
    /// retryable failure with exponential backoff, honoring an optional
    /// timeout.
    ///
    /// # Errors
    /// Returns the last error from `f` once retries are exhausted, or
    /// `EngineError::Timeout` if the transaction's deadline elapses first.
    pub fn transaction<T>(&self, opts: &TxOptions, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            self.check_timeout()?;
            let depth_before = self.transaction_depth();
            let (_, savepoint) = self.begin_level(opts.timeout_ms)?;

            match f() {
                Ok(value) => {
                    self.commit_level(savepoint)?;
                    return Ok(value);
                }
                Err(e) => {
                    let _ = self.rollback_level(savepoint, &e.to_string());
                    let retryable = opts.is_retryable.as_ref().map_or_else(|| Self::default_retryable(&e), |p| p(&e));
                    if retryable && attempt < opts.max_retries {
                        self.emit("retry", 0, depth_before);
                        let backoff = opts.retry_delay_ms.saturating_mul(1u64 << attempt.min(16));
                        std::thread::sleep(Duration::from_millis(backoff));
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    #[must_use]
    pub fn log_snapshot(&self) -> Vec<TransactionLogRecord> {
        self.log.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        conn.with(|c| c.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")).unwrap();
        TransactionManager::new(conn, 100)
    }

    #[test]
    fn commit_persists_and_clears_state() {
        let mgr = manager();
        mgr.transaction(&TxOptions::default(), || {
            mgr.conn.with(|c| c.execute("INSERT INTO t(v) VALUES ('a')", [])).map_err(Into::into).map(|_| ())
        })
        .unwrap();
        assert!(!mgr.is_in_transaction());
        let count: i64 = mgr.conn.with(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rollback_on_error_discards_writes() {
        let mgr = manager();
        let opts = TxOptions { max_retries: 0, ..TxOptions::default() };
        let result: Result<()> = mgr.transaction(&opts, || {
            mgr.conn.with(|c| c.execute("INSERT INTO t(v) VALUES ('a')", [])).unwrap();
            Err(EngineError::InvalidArgument("boom".to_string()))
        });
        assert!(result.is_err());
        let count: i64 = mgr.conn.with(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn nested_transactions_use_savepoints() {
        let mgr = manager();
        mgr.transaction(&TxOptions::default(), || {
            mgr.conn.with(|c| c.execute("INSERT INTO t(v) VALUES ('outer')", [])).unwrap();
            mgr.transaction(&TxOptions::default(), || {
                mgr.conn.with(|c| c.execute("INSERT INTO t(v) VALUES ('inner')", [])).unwrap();
                Ok(())
            })
        })
        .unwrap();
        let count: i64 = mgr.conn.with(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn recover_clears_depth_and_id() {
        let mgr = manager();
        mgr.begin_level(None).unwrap();
        assert!(mgr.is_in_transaction());
        mgr.recover();
        assert!(!mgr.is_in_transaction());
        assert_eq!(mgr.transaction_depth(), 0);
    }

    #[test]
    fn log_is_bounded_to_max_entries() {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        conn.with(|c| c.execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY)")).unwrap();
        let mgr = TransactionManager::new(conn, 2);
        for _ in 0..5 {
            mgr.transaction(&TxOptions::default(), || Ok(())).unwrap();
        }
        assert!(mgr.log_snapshot().len() <= 2);
    }
}

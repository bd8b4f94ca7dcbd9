//! Schema-driven upsert engine atop the write-buffer LRU (C6): buffers
//! per-entity updates in memory and flushes them as batched single-row
//! writes, the way the teacher's document store buffers BSON documents
//! before a batched write.

use crate::buffer::{BufferConfig, EvictReason, SetOptions, WriteBuffer};
use crate::checkpoint::schema::{ColumnType, EntitySchema};
use crate::config::CheckpointConfig;
use crate::errors::{EngineError, Result};
use crate::sql::SqlConn;
use crate::types::now_ms;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    Count,
    Memory,
    Interval,
    Eviction,
    Manual,
}

impl CheckpointTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Memory => "memory",
            Self::Interval => "interval",
            Self::Eviction => "eviction",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub entity_count: usize,
    pub total_bytes: usize,
    pub duration_ms: u64,
    pub trigger: CheckpointTrigger,
}

/// Generic over a JSON-object-shaped entity, the same representation the
/// teacher's document store uses for schema-free payloads.
pub struct Checkpointer {
    conn: Arc<SqlConn>,
    schema: EntitySchema,
    buffer: Arc<WriteBuffer<Value>>,
    config: CheckpointConfig,
    last_checkpoint_ms: AtomicI64,
    interval_shutdown: AtomicBool,
    interval_thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

fn pk_as_string(value: &Value, pk_field: &str) -> Result<String> {
    value
        .get(pk_field)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| EngineError::InvalidArgument(format!("entity missing primary key field {pk_field}")))
}

fn column_sql_value(value: &Value, field: &str, ty: ColumnType) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    let Some(v) = value.get(field) else { return SqlValue::Null };
    match ty {
        ColumnType::Json => SqlValue::Text(v.to_string()),
        ColumnType::Text | ColumnType::Datetime => match v {
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Null => SqlValue::Null,
            other => SqlValue::Text(other.to_string()),
        },
        ColumnType::Integer => match v.as_i64() {
            Some(n) => SqlValue::Integer(n),
            None => SqlValue::Null,
        },
        ColumnType::Real => match v.as_f64() {
            Some(n) => SqlValue::Real(n),
            None => SqlValue::Null,
        },
        ColumnType::Blob => match v {
            Value::String(s) => SqlValue::Blob(s.clone().into_bytes()),
            _ => SqlValue::Null,
        },
    }
}

impl Checkpointer {
    #[must_use]
    pub fn new(conn: Arc<SqlConn>, schema: EntitySchema, buffer_config: BufferConfig, config: CheckpointConfig) -> Arc<Self> {
        let buffer = Arc::new(WriteBuffer::new(buffer_config));
        let checkpointer = Arc::new(Self {
            conn,
            schema,
            buffer,
            config,
            last_checkpoint_ms: AtomicI64::new(now_ms()),
            interval_shutdown: AtomicBool::new(false),
            interval_thread: parking_lot::Mutex::new(None),
        });
        checkpointer.install_eviction_hook();
        checkpointer
    }

    fn install_eviction_hook(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.buffer.set_evict_callback(Arc::new(move |_key, value, reason| {
            if reason != EvictReason::Count && reason != EvictReason::Size {
                return;
            }
            if let Some(this) = weak.upgrade() {
                let _ = this.upsert_one(value);
            }
        }));
    }

    /// Spawns a background thread that fires the `interval` checkpoint
    /// trigger. Cancellable via [`Self::stop_interval_timer`] so it never
    /// leaks past the checkpointer's lifetime.
    pub fn start_interval_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval_ms = self.config.interval_ms;
        let handle = std::thread::spawn(move || {
            while !this.interval_shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(interval_ms.max(1)));
                if this.interval_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let elapsed = now_ms() - this.last_checkpoint_ms.load(Ordering::Relaxed);
                if !this.buffer.dirty_entries().is_empty() && elapsed >= i64::try_from(interval_ms).unwrap_or(i64::MAX) {
                    let _ = this.checkpoint(CheckpointTrigger::Interval);
                }
            }
        });
        *self.interval_thread.lock() = Some(handle);
    }

    pub fn stop_interval_timer(&self) {
        self.interval_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.interval_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn pk_column(&self) -> &str {
        self.schema.columns.iter().find(|c| c.field == self.schema.primary_key).map_or(self.schema.primary_key.as_str(), |c| c.column.as_str())
    }

    /// Cache-first lookup; on miss, `SELECT * FROM table WHERE pk = ?`,
    /// inserted into the cache as clean.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        if let Some(cached) = self.buffer.get(id) {
            return Ok(Some(cached));
        }
        let pk_col = self.pk_column();
        let table = &self.schema.table;
        let row: Option<String> = self
            .conn
            .with(|c| {
                let sql = format!("SELECT * FROM {table} WHERE {pk_col} = ?1");
                c.query_row(&sql, [id], |r| row_to_json(r, &self.schema))
            })
            .ok();
        let Some(json_text) = row else { return Ok(None) };
        let value: Value = serde_json::from_str(&json_text)?;
        self.buffer.set(id, value.clone(), SetOptions { ttl: None, mark_dirty: false });
        Ok(Some(value))
    }

    /// Stamps birth/change timestamps and version=1 where configured, then
    /// stores the entity as dirty.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the entity has no primary key field.
    pub fn create(&self, mut entity: Value) -> Result<String> {
        let now = now_ms();
        if let Value::Object(map) = &mut entity {
            if let Some(field) = &self.schema.created_at_field {
                map.insert(field.clone(), Value::from(now));
            }
            if let Some(field) = &self.schema.updated_at_field {
                map.insert(field.clone(), Value::from(now));
            }
            if self.schema.has_version {
                map.insert("version".to_string(), Value::from(1));
            }
        }
        let id = pk_as_string(&entity, &self.schema.primary_key)?;
        self.buffer.set(&id, entity, SetOptions::dirty());
        self.maybe_auto_checkpoint()?;
        Ok(id)
    }

    /// Fetches, merges `patch` over the existing entity, stamps the change
    /// timestamp and bumps version, stores as dirty.
    ///
    /// # Errors
    /// Returns `NotFound` if no entity exists for `id`.
    pub fn update(&self, id: &str, patch: Value) -> Result<Value> {
        let Some(mut entity) = self.get(id)? else { return Err(EngineError::NotFound(id.to_string())) };
        if let (Value::Object(base), Value::Object(delta)) = (&mut entity, &patch) {
            for (k, v) in delta {
                base.insert(k.clone(), v.clone());
            }
        }
        let now = now_ms();
        if let Value::Object(map) = &mut entity {
            if let Some(field) = &self.schema.updated_at_field {
                map.insert(field.clone(), Value::from(now));
            }
            if self.schema.has_version {
                let next = map.get("version").and_then(Value::as_i64).unwrap_or(0) + 1;
                map.insert("version".to_string(), Value::from(next));
            }
        }
        self.buffer.set(id, entity.clone(), SetOptions::dirty());
        self.maybe_auto_checkpoint()?;
        Ok(entity)
    }

    /// Removes from cache and issues a `DELETE`.
    ///
    /// # Errors
    /// Propagates SQL errors.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.buffer.delete(id);
        let table = &self.schema.table;
        let pk_col = self.pk_column();
        self.conn.with(|c| c.execute(&format!("DELETE FROM {table} WHERE {pk_col} = ?1"), [id]))?;
        Ok(())
    }

    fn maybe_auto_checkpoint(&self) -> Result<()> {
        let stats = self.buffer.stats();
        if stats.dirty_count >= self.config.count_threshold {
            self.checkpoint(CheckpointTrigger::Count)?;
        } else if stats.bytes_ratio() >= self.config.memory_ratio {
            self.checkpoint(CheckpointTrigger::Memory)?;
        }
        Ok(())
    }

    fn upsert_one(&self, entity: &Value) -> Result<usize> {
        let columns = &self.schema.columns;
        let mut col_names: Vec<&str> = columns.iter().map(|c| c.column.as_str()).collect();
        if let Some(field) = &self.schema.checkpointed_at_field
            && !col_names.contains(&field.as_str())
        {
            col_names.push(field.as_str());
        }

        let mut entity = entity.clone();
        if let (Some(field), Value::Object(map)) = (&self.schema.checkpointed_at_field, &mut entity) {
            map.insert(field.clone(), Value::from(now_ms()));
        }

        let placeholders: Vec<String> = (1..=col_names.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = col_names.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        let pk_col = self.pk_column();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            self.schema.table,
            col_names.join(", "),
            placeholders.join(", "),
            pk_col,
            updates.join(", "),
        );

        let mut bytes = 0usize;
        let values: Vec<rusqlite::types::Value> = columns
            .iter()
            .map(|c| {
                let v = column_sql_value(&entity, &c.field, c.ty);
                if c.ty == ColumnType::Json {
                    bytes += serde_json::to_string(entity.get(&c.field).unwrap_or(&Value::Null)).map(|s| s.len()).unwrap_or(0);
                }
                v
            })
            .chain(self.schema.checkpointed_at_field.as_ref().map(|field| column_sql_value(&entity, field, ColumnType::Integer)))
            .collect();

        let affected = self.conn.with(|c| {
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            c.execute(&sql, params.as_slice())
        })?;
        Ok(affected.max(bytes))
    }

    /// Drains the dirty set, upserting each entity as one statement, marking
    /// keys clean.
    ///
    /// # Errors
    /// Propagates the first SQL error; entities upserted before the failure
    /// remain marked dirty only if they were not yet marked clean.
    pub fn checkpoint(&self, trigger: CheckpointTrigger) -> Result<CheckpointResult> {
        let start = std::time::Instant::now();
        let dirty = self.buffer.dirty_entries();
        let mut total_bytes = 0usize;
        let mut cleaned = Vec::with_capacity(dirty.len());
        for (id, entity) in &dirty {
            let bytes = self.upsert_one(entity)?;
            total_bytes += bytes;
            cleaned.push(id.clone());
        }
        self.buffer.mark_clean(&cleaned);
        self.last_checkpoint_ms.store(now_ms(), Ordering::Relaxed);
        Ok(CheckpointResult {
            entity_count: dirty.len(),
            total_bytes,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            trigger,
        })
    }
}

fn row_to_json(row: &rusqlite::Row, schema: &EntitySchema) -> rusqlite::Result<String> {
    let mut map = serde_json::Map::new();
    for col in &schema.columns {
        let text: Option<String> = row.get(col.column.as_str()).ok();
        if col.ty == ColumnType::Json {
            if let Some(t) = text {
                map.insert(col.field.clone(), serde_json::from_str(&t).unwrap_or(Value::Null));
            }
        } else if let Some(t) = text {
            map.insert(col.field.clone(), Value::String(t));
        } else if let Ok(n) = row.get::<_, i64>(col.column.as_str()) {
            map.insert(col.field.clone(), Value::from(n));
        }
    }
    Ok(serde_json::to_string(&Value::Object(map)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::schema::ColumnDef;
    use serde_json::json;

    fn checkpointer() -> Arc<Checkpointer> {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        conn.with(|c| c.execute_batch("CREATE TABLE sessions (id TEXT PRIMARY KEY, data TEXT, version INTEGER)")).unwrap();
        let schema = EntitySchema::new(
            "sessions",
            "id",
            vec![
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("data", ColumnType::Json),
                ColumnDef::new("version", ColumnType::Integer),
            ],
        )
        .with_version();
        Checkpointer::new(conn, schema, BufferConfig::default(), CheckpointConfig { count_threshold: 10, memory_ratio: 0.8, interval_ms: 5000 })
    }

    #[test]
    fn create_then_get_from_cache() {
        let cp = checkpointer();
        let id = cp.create(json!({"id": "s1", "data": {"x": 1}})).unwrap();
        let entity = cp.get(&id).unwrap().unwrap();
        assert_eq!(entity["data"]["x"], 1);
    }

    #[test]
    fn checkpoint_persists_and_marks_clean() {
        let cp = checkpointer();
        cp.create(json!({"id": "s1", "data": {"x": 1}})).unwrap();
        let result = cp.checkpoint(CheckpointTrigger::Manual).unwrap();
        assert_eq!(result.entity_count, 1);
        assert!(cp.buffer.dirty_entries().is_empty());
    }

    #[test]
    fn update_merges_and_bumps_version() {
        let cp = checkpointer();
        let id = cp.create(json!({"id": "s1", "data": {"x": 1}})).unwrap();
        cp.checkpoint(CheckpointTrigger::Manual).unwrap();
        let updated = cp.update(&id, json!({"data": {"x": 2}})).unwrap();
        assert_eq!(updated["data"]["x"], 2);
        assert_eq!(updated["version"], 2);
    }

    #[test]
    fn delete_removes_cache_and_row() {
        let cp = checkpointer();
        let id = cp.create(json!({"id": "s1", "data": {"x": 1}})).unwrap();
        cp.checkpoint(CheckpointTrigger::Manual).unwrap();
        cp.delete(&id).unwrap();
        assert!(cp.get(&id).unwrap().is_none());
    }

    #[test]
    fn count_threshold_triggers_auto_checkpoint() {
        let conn = Arc::new(SqlConn::open_in_memory().unwrap());
        conn.with(|c| c.execute_batch("CREATE TABLE sessions (id TEXT PRIMARY KEY, data TEXT)")).unwrap();
        let schema = EntitySchema::new("sessions", "id", vec![ColumnDef::new("id", ColumnType::Text), ColumnDef::new("data", ColumnType::Json)]);
        let cp = Checkpointer::new(conn, schema, BufferConfig::default(), CheckpointConfig { count_threshold: 2, memory_ratio: 0.99, interval_ms: 5000 });
        cp.create(json!({"id": "a", "data": 1})).unwrap();
        cp.create(json!({"id": "b", "data": 2})).unwrap();
        assert!(cp.buffer.dirty_entries().is_empty());
    }
}

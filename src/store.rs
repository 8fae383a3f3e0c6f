//! Durable Task Records
//!
//! One row per task id carrying every task field. SQLite backs the
//! production store; the in-memory store serves tests and ephemeral runs.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::complexity::Complexity;
use crate::escalation::Tier;
use crate::task::{Task, TaskStatus};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable task storage
pub trait TaskStore: Send + Sync {
    /// Insert or replace the record for `task.id`
    fn save(&self, task: &Task) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Every stored record, oldest first
    fn load_all(&self) -> Result<Vec<Task>, StoreError>;
}

/// SQLite-backed task store
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open or create the task database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        info!("Task store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                complexity TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_tier TEXT,
                result TEXT,
                error TEXT,
                context TEXT NOT NULL DEFAULT '{}',
                escalation_count INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_task(row: &Row<'_>) -> Result<Task, StoreError> {
        let id: String = row.get(0)?;
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };

        let complexity: String = row.get(2)?;
        let status: String = row.get(3)?;
        let tier: Option<String> = row.get(4)?;
        let context: String = row.get(7)?;
        let created_at: String = row.get(10)?;
        let completed_at: Option<String> = row.get(11)?;

        let assigned_tier = match tier {
            Some(t) => Some(Tier::parse(&t).ok_or_else(|| corrupt(format!("unknown tier '{}'", t)))?),
            None => None,
        };
        let context: HashMap<String, String> =
            serde_json::from_str(&context).map_err(|e| corrupt(format!("context: {}", e)))?;

        Ok(Task {
            prompt: row.get(1)?,
            complexity: Complexity::parse(&complexity)
                .ok_or_else(|| corrupt(format!("unknown complexity '{}'", complexity)))?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| corrupt(format!("unknown status '{}'", status)))?,
            assigned_tier,
            result: row.get(5)?,
            error: row.get(6)?,
            context,
            escalation_count: row.get(8)?,
            cost: row.get(9)?,
            created_at: parse_timestamp(&created_at).map_err(corrupt)?,
            completed_at: completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(corrupt)?,
            id,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, prompt, complexity, status, assigned_tier, result, error, \
     context, escalation_count, cost, created_at, completed_at FROM tasks";

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp '{}': {}", s, e))
}

impl TaskStore for SqliteTaskStore {
    fn save(&self, task: &Task) -> Result<(), StoreError> {
        let context = serde_json::to_string(&task.context).map_err(|e| StoreError::Corrupt {
            id: task.id.clone(),
            reason: e.to_string(),
        })?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tasks (id, prompt, complexity, status, assigned_tier, result, error,
                 context, escalation_count, cost, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.prompt,
                task.complexity.as_str(),
                task.status.as_str(),
                task.assigned_tier.map(|t| t.as_str()),
                task.result,
                task.error,
                context,
                task.escalation_count,
                task.cost,
                format_timestamp(&task.created_at),
                task.completed_at.as_ref().map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let task = stmt
            .query_row(params![id], |row| Ok(Self::row_to_task(row)))
            .optional()?;
        task.transpose()
    }

    fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY created_at ASC", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], |row| Ok(Self::row_to_task(row)))?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }
}

/// Non-durable store keeping records in a map
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, task: &Task) -> Result<(), StoreError> {
        self.records.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn load_all(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.records.lock().values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

//! Knowledge, activity and execution collaborators
//!
//! Dispatch consumes these through narrow traits. None of them may abort a
//! dispatch: [`Collaborators`] turns every failure into an empty or no-op
//! result and logs it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Collaborator failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{0} unavailable: {1}")]
    Unavailable(&'static str, String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl From<rusqlite::Error> for CollaboratorError {
    fn from(e: rusqlite::Error) -> Self {
        CollaboratorError::Unavailable("knowledge store", e.to_string())
    }
}

/// One ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub content: String,
    pub source: String,
    /// Higher is more relevant
    pub score: f64,
}

/// Completed work worth remembering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub task_id: String,
    pub tier: String,
    pub prompt: String,
    pub summary: String,
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    TimedOut,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
}

impl ExecutionOutput {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            status: ExecutionStatus::Unavailable,
            exit_code: None,
        }
    }
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, CollaboratorError>;
}

#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record(&self, activity: &Activity) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        language: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutput, CollaboratorError>;
}

/// Optional collaborators with degrade-on-failure wrappers
#[derive(Clone, Default)]
pub struct Collaborators {
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    activity: Option<Arc<dyn ActivityRecorder>>,
    executor: Option<Arc<dyn CodeExecutor>>,
}

impl Collaborators {
    /// No collaborators: searches are empty, records are no-ops
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_knowledge(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(store);
        self
    }

    pub fn with_activity(mut self, recorder: Arc<dyn ActivityRecorder>) -> Self {
        self.activity = Some(recorder);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Ranked entries, or empty when the store is missing or failing
    pub async fn search(&self, query: &str, limit: usize) -> Vec<KnowledgeEntry> {
        let Some(store) = &self.knowledge else {
            return Vec::new();
        };
        match store.search(query, limit).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Knowledge search degraded to empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether the activity was recorded
    pub async fn record(&self, activity: &Activity) -> bool {
        let Some(recorder) = &self.activity else {
            return false;
        };
        match recorder.record(activity).await {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!("Activity record skipped: {}", e);
                false
            }
        }
    }

    pub async fn execute(&self, code: &str, language: &str, timeout: Duration) -> ExecutionOutput {
        let Some(executor) = &self.executor else {
            return ExecutionOutput::unavailable("no executor configured");
        };
        match executor.execute(code, language, timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Code execution degraded: {}", e);
                ExecutionOutput::unavailable(e.to_string())
            }
        }
    }
}

/// SQLite activity log, searchable with FTS5
///
/// Completed work is recorded here and fed back as knowledge to later tasks.
pub struct SqliteActivityLog {
    conn: Mutex<Connection>,
}

impl SqliteActivityLog {
    pub fn open(path: &Path) -> Result<Self, CollaboratorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CollaboratorError::Unavailable("activity log", e.to_string()))?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CollaboratorError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CollaboratorError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                task_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                prompt TEXT NOT NULL,
                summary TEXT NOT NULL,
                cost REAL NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS activities_fts USING fts5(
                prompt,
                summary,
                content='activities',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS activities_ai AFTER INSERT ON activities BEGIN
                INSERT INTO activities_fts(rowid, prompt, summary)
                VALUES (new.rowid, new.prompt, new.summary);
            END;
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ActivityRecorder for SqliteActivityLog {
    async fn record(&self, activity: &Activity) -> Result<bool, CollaboratorError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO activities (task_id, tier, prompt, summary, cost, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                activity.task_id,
                activity.tier,
                activity.prompt,
                activity.summary,
                activity.cost,
                activity.recorded_at.to_rfc3339(),
            ],
        )?;
        debug!("Recorded activity for task {}", activity.task_id);
        Ok(true)
    }
}

#[async_trait]
impl KnowledgeStore for SqliteActivityLog {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, CollaboratorError> {
        // Quote each term so FTS5 syntax in prompts is inert
        let fts_query = query
            .split_whitespace()
            .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
            .filter(|w| w.len() > 2)
            .map(|w| format!("\"{}\"", w))
            .collect::<Vec<_>>()
            .join(" OR ");

        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT a.task_id, a.summary, bm25(activities_fts) AS score
            FROM activities_fts
            JOIN activities a ON activities_fts.rowid = a.rowid
            WHERE activities_fts MATCH ?1
            ORDER BY score
            LIMIT ?2
            "#,
        )?;

        let entries = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                Ok(KnowledgeEntry {
                    source: row.get(0)?,
                    content: row.get(1)?,
                    // bm25 is negative, lower is better
                    score: row.get::<_, f64>(2)?.abs(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

/// Runs snippets through local interpreters
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn interpreter(language: &str) -> Option<(&'static str, &'static str)> {
        match language.to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(("python3", "-c")),
            "bash" | "sh" | "shell" => Some(("sh", "-c")),
            "javascript" | "js" | "node" => Some(("node", "-e")),
            _ => None,
        }
    }
}

#[async_trait]
impl CodeExecutor for ProcessExecutor {
    async fn execute(
        &self,
        code: &str,
        language: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutput, CollaboratorError> {
        let (program, flag) = Self::interpreter(language)
            .ok_or_else(|| CollaboratorError::UnsupportedLanguage(language.to_string()))?;

        let child = Command::new(program)
            .arg(flag)
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(ExecutionOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                status: if output.status.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                },
                exit_code: output.status.code(),
            }),
            Ok(Err(e)) => Err(CollaboratorError::Unavailable("executor", format!("{}: {}", program, e))),
            Err(_) => Ok(ExecutionOutput {
                stdout: String::new(),
                stderr: format!("timed out after {:?}", timeout),
                status: ExecutionStatus::TimedOut,
                exit_code: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownStore;

    #[async_trait]
    impl KnowledgeStore for DownStore {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<KnowledgeEntry>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("knowledge store", "connection refused".into()))
        }
    }

    #[async_trait]
    impl ActivityRecorder for DownStore {
        async fn record(&self, _activity: &Activity) -> Result<bool, CollaboratorError> {
            Err(CollaboratorError::Unavailable("activity", "disk full".into()))
        }
    }

    fn activity(task_id: &str, prompt: &str, summary: &str) -> Activity {
        Activity {
            task_id: task_id.into(),
            tier: "llama".into(),
            prompt: prompt.into(),
            summary: summary.into(),
            cost: 0.0,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_collaborators_degrade() {
        let c = Collaborators::none();
        assert!(c.search("anything", 5).await.is_empty());
        assert!(!c.record(&activity("t", "p", "s")).await);
        let out = c.execute("print(1)", "python", Duration::from_secs(1)).await;
        assert_eq!(out.status, ExecutionStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_failing_collaborators_degrade() {
        let down = Arc::new(DownStore);
        let c = Collaborators::none()
            .with_knowledge(down.clone())
            .with_activity(down);
        assert!(c.search("anything", 5).await.is_empty());
        assert!(!c.record(&activity("t", "p", "s")).await);
    }

    #[tokio::test]
    async fn test_activity_log_search() {
        let log = Arc::new(SqliteActivityLog::open_in_memory().unwrap());
        let c = Collaborators::none()
            .with_knowledge(log.clone())
            .with_activity(log);

        assert!(c.record(&activity("t1", "summarize the deploy runbook", "Runbook covers rollback")).await);
        assert!(c.record(&activity("t2", "fix the login bug", "Null check added to session")).await);

        let hits = c.search("deploy rollback steps", 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "t1");

        // FTS syntax in the query is neutralised
        assert!(c.search("\"(* OR", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_process_executor() {
        let c = Collaborators::none().with_executor(Arc::new(ProcessExecutor));

        let out = c.execute("echo hello", "sh", Duration::from_secs(5)).await;
        assert_eq!(out.status, ExecutionStatus::Success);
        assert_eq!(out.stdout.trim(), "hello");

        let out = c.execute("exit 3", "sh", Duration::from_secs(5)).await;
        assert_eq!(out.status, ExecutionStatus::Failed);
        assert_eq!(out.exit_code, Some(3));

        let out = c.execute("1", "cobol", Duration::from_secs(5)).await;
        assert_eq!(out.status, ExecutionStatus::Unavailable);
    }
}

//! Task Queue
//!
//! In-memory work channel backed by a durable record per task.
//!
//! - Every mutation happens inside one critical section per queue
//! - Every mutation is persisted; a failed write is logged and the
//!   in-memory change stands
//! - `dequeue` is the only call that waits
//! - `load_pending` re-queues work interrupted by a crash

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::escalation::Tier;
use crate::store::{StoreError, TaskStore};
use crate::task::{Task, TaskStatus};

/// Queue errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Queue closed; task {0} cannot be rescheduled")]
    Closed(String),
}

/// Result of a startup recovery scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Pending/InProgress records put back on the work channel
    pub requeued: usize,
    /// Terminal or escalated records loaded as history
    pub history: usize,
}

/// Durable FIFO of tasks
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    tasks: Mutex<HashMap<String, Task>>,
    /// Ids currently on the work channel
    scheduled: Mutex<HashSet<String>>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<String>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            tasks: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(HashSet::new()),
            sender: Mutex::new(Some(tx)),
            receiver: AsyncMutex::new(rx),
        }
    }

    /// Persist a record, logging rather than failing on write errors
    fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save(task) {
            warn!(task_id = %task.id, status = %task.status, "Task persistence failed: {}", e);
        }
    }

    fn push(&self, id: &str) {
        let sent = match self.sender.lock().as_ref() {
            Some(tx) => tx.send(id.to_string()).is_ok(),
            None => false,
        };
        if sent {
            self.scheduled.lock().insert(id.to_string());
        } else {
            warn!(task_id = %id, "Queue closed, task not scheduled");
        }
    }

    /// Store a task, schedule it and persist it. Returns the task id.
    pub fn enqueue(&self, task: Task) -> String {
        let id = task.id.clone();
        {
            let mut tasks = self.tasks.lock();
            self.persist(&task);
            tasks.insert(id.clone(), task);
            self.push(&id);
        }
        debug!(task_id = %id, "Task enqueued");
        id
    }

    /// Wait for the next runnable task and mark it InProgress.
    ///
    /// Returns None once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let id = receiver.recv().await?;
            self.scheduled.lock().remove(&id);

            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&id) else {
                continue;
            };
            if !task.status.is_runnable() {
                // Cancelled while waiting
                debug!(task_id = %id, status = %task.status, "Skipping non-runnable task");
                continue;
            }

            task.status = TaskStatus::InProgress;
            let task = task.clone();
            self.persist(&task);
            return Some(task);
        }
    }

    fn transition<F>(&self, id: &str, to: TaskStatus, apply: F) -> Result<Task, QueueError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.lock();
        let task = Self::apply_transition(&mut tasks, id, to, apply)?;
        self.persist(&task);
        Ok(task)
    }

    fn apply_transition<F>(
        tasks: &mut HashMap<String, Task>,
        id: &str,
        to: TaskStatus,
        apply: F,
    ) -> Result<Task, QueueError>
    where
        F: FnOnce(&mut Task),
    {
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if !task.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to,
            });
        }

        task.status = to;
        apply(task);
        Ok(task.clone())
    }

    /// Mark a task Completed. Repeating the call overwrites the record.
    pub fn complete(&self, id: &str, result: &str, cost: f64) -> Result<Task, QueueError> {
        let task = self.transition(id, TaskStatus::Completed, |t| {
            t.result = Some(result.to_string());
            t.error = None;
            t.cost = cost;
            t.completed_at = Some(Utc::now());
        })?;
        info!(task_id = %id, cost, "Task completed");
        Ok(task)
    }

    /// Mark a task Failed. Repeating the call overwrites the record.
    pub fn fail(&self, id: &str, error: &str) -> Result<Task, QueueError> {
        let task = self.transition(id, TaskStatus::Failed, |t| {
            t.error = Some(error.to_string());
            t.completed_at = Some(Utc::now());
        })?;
        warn!(task_id = %id, "Task failed: {}", error);
        Ok(task)
    }

    /// Move a failed in-progress task one tier up and reschedule it.
    ///
    /// Fails with [`QueueError::Closed`] once the queue is closed; the task
    /// is left untouched so the caller can fail it instead.
    pub fn escalate(
        &self,
        id: &str,
        next_tier: Tier,
        error: &str,
        escalation_context: &str,
        cost: f64,
    ) -> Result<Task, QueueError> {
        let task = {
            let mut tasks = self.tasks.lock();
            let sender = self.sender.lock();
            let Some(tx) = sender.as_ref() else {
                return Err(QueueError::Closed(id.to_string()));
            };

            let task = Self::apply_transition(&mut tasks, id, TaskStatus::Escalated, |t| {
                t.escalation_count += 1;
                t.assigned_tier = Some(next_tier);
                t.error = Some(error.to_string());
                t.cost = cost;
                t.context.insert(
                    crate::task::context_keys::ESCALATION.to_string(),
                    escalation_context.to_string(),
                );
            })?;
            self.persist(&task);
            if tx.send(id.to_string()).is_ok() {
                self.scheduled.lock().insert(id.to_string());
            }
            task
        };
        info!(
            task_id = %id,
            tier = %next_tier,
            escalation_count = task.escalation_count,
            "Task escalated"
        );
        Ok(task)
    }

    /// Update non-status fields of an in-flight task and persist them
    pub fn update<F>(&self, id: &str, apply: F) -> Result<Task, QueueError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let status = task.status;
        apply(task);
        task.status = status;
        let task = task.clone();
        self.persist(&task);
        Ok(task)
    }

    /// Cancel a task that has not been picked up yet
    pub fn cancel(&self, id: &str) -> Result<Task, QueueError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        if task.status != TaskStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: TaskStatus::Failed,
            });
        }

        task.status = TaskStatus::Failed;
        task.error = Some("cancelled".to_string());
        task.completed_at = Some(Utc::now());
        let task = task.clone();
        self.persist(&task);
        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    /// Runnable tasks actually waiting on the work channel.
    ///
    /// Escalated records loaded as history are not counted; nothing will run them.
    pub fn pending_count(&self) -> usize {
        let tasks = self.tasks.lock();
        self.scheduled
            .lock()
            .iter()
            .filter(|id| tasks.get(*id).map_or(false, |t| t.status.is_runnable()))
            .count()
    }

    /// Completed and Failed tasks, oldest first
    pub fn history(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Reload durable records after a restart.
    ///
    /// Pending and InProgress records go back on the work channel as
    /// Pending; everything else is kept as read-only history.
    pub fn load_pending(&self) -> Result<RecoveryReport, StoreError> {
        let records = self.store.load_all()?;
        let mut report = RecoveryReport::default();

        let mut tasks = self.tasks.lock();
        for mut task in records {
            if tasks.contains_key(&task.id) {
                continue;
            }

            match task.status {
                TaskStatus::Pending | TaskStatus::InProgress => {
                    task.status = TaskStatus::Pending;
                    self.persist(&task);
                    let id = task.id.clone();
                    tasks.insert(id.clone(), task);
                    self.push(&id);
                    report.requeued += 1;
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated => {
                    tasks.insert(task.id.clone(), task);
                    report.history += 1;
                }
            }
        }

        info!(
            requeued = report.requeued,
            history = report.history,
            "Task queue recovered"
        );
        Ok(report)
    }

    /// Stop accepting work; idle dequeuers return None
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!("Task queue closed");
        }
    }
}

//! Dispatch Controller
//!
//! Turns a prompt into a resolved task:
//!
//! ```text
//! process(prompt) ──► classify ──► enqueue ──► worker ──► tier selection
//!                                                │
//!                     ┌──────────────────────────┘
//!                     ▼
//!            Local: Ollama via gateway
//!            Cloud: [local analysis] ──► CLI via gateway ──(fallback)──► API via gateway
//!                     │
//!          success ───┴─── failure ──► escalate (Full mode) ──► requeue
//!             │                              │
//!          complete                 chain exhausted ──► fail + action required
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Activity, Collaborators};
use crate::complexity::{self, Complexity};
use crate::escalation::{EscalationEngine, ExecutionMode, Tier, TierSpec};
use crate::providers::Provider;
use crate::queue::{QueueError, RecoveryReport, TaskQueue};
use crate::rate_limit::estimate_tokens;
use crate::resilience::{CallError, CallOptions, CallOutcome, ErrorKind, Fallback, GatewayError, ResilientGateway};
use crate::status::{EntryKind, StatusBoard, StatusSnapshot};
use crate::store::StoreError;
use crate::supervisor::ToolSupervisor;
use crate::task::{context_keys, Task, TaskStatus};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful, concise assistant. Answer the request directly.";

/// Knowledge entries appended to the system prompt
const KNOWLEDGE_LIMIT: usize = 3;

/// Longest summary stored per recorded activity
const ACTIVITY_SUMMARY_CHARS: usize = 500;

/// How much of the chain a request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Local tier only, never escalates
    Lite,
    /// Whole chain, escalation enabled
    #[default]
    Full,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Lite => "lite",
            DispatchMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "lite" => Some(DispatchMode::Lite),
            "full" => Some(DispatchMode::Full),
            _ => None,
        }
    }
}

/// What a caller gets back for one prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub complexity: Complexity,
    pub tier: Option<Tier>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cost: f64,
    pub escalation_count: u32,
    /// Set when Lite mode ran work above the local tier's ceiling
    pub recommendation: Option<String>,
}

impl From<Task> for DispatchResult {
    fn from(task: Task) -> Self {
        let recommendation = task
            .context_value(context_keys::RECOMMENDATION)
            .map(str::to_string);
        Self {
            task_id: task.id,
            status: task.status,
            complexity: task.complexity,
            tier: task.assigned_tier,
            result: task.result,
            error: task.error,
            cost: task.cost,
            escalation_count: task.escalation_count,
            recommendation,
        }
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No dispatch workers running; call start() first")]
    NotStarted,

    #[error("Dispatcher shut down before task {0} resolved")]
    Interrupted(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Providers behind the tier chain
#[derive(Clone)]
pub struct TierProviders {
    /// Local tier
    pub local: Arc<dyn Provider>,
    /// Cost-free cloud path
    pub cli: Arc<dyn Provider>,
    /// Paid cloud path
    pub api: Arc<dyn Provider>,
}

/// A submitted task and its resolution channel
pub struct Submission {
    pub task_id: String,
    receiver: oneshot::Receiver<Task>,
}

impl Submission {
    /// Wait until the task completes or fails
    pub async fn wait(self) -> Result<DispatchResult, DispatchError> {
        self.receiver
            .await
            .map(DispatchResult::from)
            .map_err(|_| DispatchError::Interrupted(self.task_id))
    }
}

/// Output of one tier run
struct Execution {
    text: String,
    cost: f64,
    analysis: Option<String>,
    recommendation: Option<String>,
}

struct Inner {
    queue: Arc<TaskQueue>,
    engine: EscalationEngine,
    gateway: Arc<ResilientGateway>,
    providers: TierProviders,
    supervisor: Arc<ToolSupervisor>,
    collaborators: Collaborators,
    board: Arc<StatusBoard>,
    system_prompt: String,
    waiters: Mutex<HashMap<String, oneshot::Sender<Task>>>,
}

/// Builder for [`DispatchController`]
pub struct DispatchBuilder {
    queue: Arc<TaskQueue>,
    engine: EscalationEngine,
    gateway: Arc<ResilientGateway>,
    providers: TierProviders,
    supervisor: Option<Arc<ToolSupervisor>>,
    collaborators: Collaborators,
    board: Option<Arc<StatusBoard>>,
    system_prompt: String,
}

impl DispatchBuilder {
    pub fn supervisor(mut self, supervisor: Arc<ToolSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn status_board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn build(self) -> DispatchController {
        let inner = Inner {
            queue: self.queue,
            engine: self.engine,
            gateway: self.gateway,
            providers: self.providers,
            supervisor: self
                .supervisor
                .unwrap_or_else(|| Arc::new(ToolSupervisor::new(Vec::new(), HashMap::new()))),
            collaborators: self.collaborators,
            board: self.board.unwrap_or_default(),
            system_prompt: self.system_prompt,
            waiters: Mutex::new(HashMap::new()),
        };
        DispatchController {
            inner: Arc::new(inner),
            workers: Mutex::new(Vec::new()),
        }
    }
}

/// Runs prompts through the tier chain
pub struct DispatchController {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchController {
    pub fn builder(
        queue: Arc<TaskQueue>,
        engine: EscalationEngine,
        gateway: Arc<ResilientGateway>,
        providers: TierProviders,
    ) -> DispatchBuilder {
        DispatchBuilder {
            queue,
            engine,
            gateway,
            providers,
            supervisor: None,
            collaborators: Collaborators::none(),
            board: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Spawn `n` dequeue loops
    pub fn start(&self, n: usize) {
        let mut workers = self.workers.lock();
        for worker_id in 0..n.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                debug!("Dispatch worker {} started", worker_id);
                while let Some(task) = inner.queue.dequeue().await {
                    inner.run_task(task).await;
                }
                debug!("Dispatch worker {} exiting", worker_id);
            }));
        }
        info!("Dispatch controller started with {} worker(s)", workers.len());
    }

    /// Re-queue work interrupted by a previous crash
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        self.inner.queue.load_pending()
    }

    /// Classify and enqueue a prompt without waiting for it
    pub fn submit(
        &self,
        prompt: &str,
        mode: DispatchMode,
        forced_tier: Option<Tier>,
    ) -> Result<Submission, DispatchError> {
        if self.workers.lock().is_empty() {
            return Err(DispatchError::NotStarted);
        }

        let complexity = complexity::classify(prompt);
        let mut task = Task::new(prompt, complexity).with_context(context_keys::MODE, mode.as_str());
        if let Some(tier) = forced_tier {
            task = task.with_context(context_keys::FORCED_TIER, tier.as_str());
        }

        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().insert(task.id.clone(), tx);
        let task_id = self.inner.queue.enqueue(task);

        info!(task_id = %task_id, complexity = %complexity, mode = mode.as_str(), "Task submitted");
        Ok(Submission {
            task_id,
            receiver: rx,
        })
    }

    /// Dispatch a prompt and wait for its resolution
    pub async fn process(
        &self,
        prompt: &str,
        mode: DispatchMode,
        forced_tier: Option<Tier>,
    ) -> Result<DispatchResult, DispatchError> {
        self.submit(prompt, mode, forced_tier)?.wait().await
    }

    /// Cancel a task that no worker has picked up yet
    pub fn cancel(&self, task_id: &str) -> Result<DispatchResult, DispatchError> {
        let task = self.inner.queue.cancel(task_id)?;
        self.inner.resolve(&task);
        Ok(task.into())
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.queue.get(task_id)
    }

    pub fn status_board(&self) -> &Arc<StatusBoard> {
        &self.inner.board
    }

    pub fn supervisor(&self) -> &Arc<ToolSupervisor> {
        &self.inner.supervisor
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = &self.inner;
        StatusSnapshot {
            pending_count: inner.queue.pending_count(),
            breakers: inner.gateway.breakers().snapshot(),
            tier_calls: inner.board.tier_calls(),
            accrued_cost: inner.board.accrued_cost(),
            rate_limits: inner.gateway.limiters().stats(),
            tools: inner.supervisor.status(),
            errors: inner.gateway.stats().snapshot(),
            action_required: inner
                .board
                .entries()
                .into_iter()
                .filter(|e| e.kind == EntryKind::ActionRequired)
                .collect(),
        }
    }

    /// Close the queue, let workers drain, stop every tool
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Dispatch worker ended abnormally: {}", e);
            }
        }
        self.inner.supervisor.stop_all().await;
        info!("Dispatch controller shut down");
    }
}

impl Inner {
    fn resolve(&self, task: &Task) {
        if let Some(tx) = self.waiters.lock().remove(&task.id) {
            // Receiver may have been dropped; nothing to do then
            let _ = tx.send(task.clone());
        }
    }

    fn select_tier(&self, task: &Task, mode: DispatchMode, forced: Option<Tier>) -> Tier {
        if let Some(tier) = forced {
            return tier;
        }
        if task.escalation_count > 0 {
            if let Some(tier) = task.assigned_tier {
                return tier;
            }
        }
        match mode {
            DispatchMode::Lite => Tier::Llama,
            DispatchMode::Full => self.engine.starting_tier(task.complexity),
        }
    }

    async fn run_task(&self, task: Task) {
        let mode = task
            .context_value(context_keys::MODE)
            .and_then(DispatchMode::parse)
            .unwrap_or_default();
        let forced = task
            .context_value(context_keys::FORCED_TIER)
            .and_then(Tier::parse);
        let tier = self.select_tier(&task, mode, forced);

        // Escalated reruns already have their entry; recovered ones may not
        if !self.board.has_entries_for(&task.id) {
            self.board
                .post(
                    &task.id,
                    EntryKind::InProgress,
                    Some(tier),
                    format!("{} task started on {}", task.complexity, tier),
                )
                .await;
        }

        let mut task = task;
        task.assigned_tier = Some(tier);
        if let Err(e) = self.queue.update(&task.id, |t| t.assigned_tier = Some(tier)) {
            warn!(task_id = %task.id, "Could not record tier: {}", e);
        }

        match self.execute(&task, mode, tier, forced.is_some()).await {
            Ok(run) => self.finish_success(task, tier, run).await,
            Err(err) => self.finish_failure(task, mode, forced.is_some(), tier, err).await,
        }
    }

    async fn execute(
        &self,
        task: &Task,
        mode: DispatchMode,
        tier: Tier,
        forced: bool,
    ) -> Result<Execution, CallError> {
        let spec = self.engine.spec(tier).cloned().ok_or_else(|| {
            CallError::new(ErrorKind::Configuration, format!("tier {} is not in the chain", tier))
        })?;
        let mut system = self.build_system_prompt(task).await;

        match self.engine.required_mode(tier) {
            ExecutionMode::Local => {
                let text = self.call_local(&spec, &task.prompt, &system).await?;
                let recommendation = (mode == DispatchMode::Lite && !spec.can_handle(task.complexity))
                    .then(|| {
                        format!(
                            "{} work exceeds the local tier's {} ceiling; rerun in full mode for a cloud tier",
                            task.complexity, spec.ceiling
                        )
                    });
                Ok(Execution {
                    text,
                    cost: spec.cost_per_call,
                    analysis: None,
                    recommendation,
                })
            }
            ExecutionMode::Cloud => {
                let mut analysis = None;
                if mode == DispatchMode::Full
                    && !forced
                    && task.escalation_count == 0
                    && task.complexity >= Complexity::Complex
                {
                    analysis = self.local_analysis(&task.prompt).await;
                    if let Some(notes) = &analysis {
                        system.push_str("\n\nLocal analysis:\n");
                        system.push_str(notes);
                    }
                }

                let (text, cost) = self.call_cloud(&spec, &task.prompt, &system).await?;
                Ok(Execution {
                    text,
                    cost,
                    analysis,
                    recommendation: None,
                })
            }
        }
    }

    async fn build_system_prompt(&self, task: &Task) -> String {
        let mut system = task
            .context_value(context_keys::SYSTEM_PROMPT)
            .unwrap_or(&self.system_prompt)
            .to_string();

        let knowledge = self.collaborators.search(&task.prompt, KNOWLEDGE_LIMIT).await;
        if !knowledge.is_empty() {
            system.push_str("\n\nRelevant prior work:");
            for entry in &knowledge {
                system.push_str("\n- ");
                system.push_str(&entry.content);
            }
        }

        if let Some(escalation) = task.context_value(context_keys::ESCALATION) {
            system.push_str("\n\nA previous tier could not finish this task. Hand-off:\n");
            system.push_str(escalation);
        }

        system
    }

    /// Local-tier notes for cloud work. Failure only costs the notes.
    async fn local_analysis(&self, prompt: &str) -> Option<String> {
        let spec = self.engine.spec(Tier::Llama)?.clone();
        let request = format!(
            "Analyze this request. Outline the key steps, risks and open questions. Do not solve it.\n\nRequest:\n{}",
            prompt
        );
        match self.call_local(&spec, &request, "").await {
            Ok(notes) => Some(notes),
            Err(e) => {
                warn!("Local analysis unavailable, continuing without it: {}", e);
                None
            }
        }
    }

    async fn call_local(&self, spec: &TierSpec, prompt: &str, system: &str) -> Result<String, CallError> {
        self.board.record_call(spec.tier);
        let provider = &self.providers.local;
        let model = spec.model.as_str();
        let tokens = estimate_tokens(prompt) + estimate_tokens(system);

        let outcome = self
            .gateway
            .call(provider.name(), CallOptions::new().tokens(tokens), move || async move {
                provider.invoke(prompt, model, system).await.into_result()
            })
            .await
            .map_err(gateway_failure)?;

        outcome
            .into_value()
            .ok_or_else(|| CallError::new(ErrorKind::Unknown, "local tier returned no value"))
    }

    /// CLI path first (one attempt), then exactly one hand-off to the paid API.
    ///
    /// Returns the text and the cost charged for it.
    async fn call_cloud(&self, spec: &TierSpec, prompt: &str, system: &str) -> Result<(String, f64), CallError> {
        self.board.record_call(spec.tier);
        let tokens = estimate_tokens(prompt) + estimate_tokens(system);

        let fallback = {
            let gateway = Arc::clone(&self.gateway);
            let api = Arc::clone(&self.providers.api);
            let prompt = prompt.to_string();
            let model = spec.model.clone();
            let system = system.to_string();

            Fallback::alternate(move || async move {
                let (api, prompt, model, system) = (&api, prompt.as_str(), model.as_str(), system.as_str());
                let outcome = gateway
                    .call(api.name(), CallOptions::new().tokens(tokens), move || async move {
                        api.invoke(prompt, model, system).await.into_result()
                    })
                    .await
                    .map_err(gateway_failure)?;
                outcome
                    .into_value()
                    .ok_or_else(|| CallError::new(ErrorKind::Unknown, "direct API returned no value"))
            })
        };

        let cli = &self.providers.cli;
        let model = spec.model.as_str();
        let outcome = self
            .gateway
            .call(
                cli.name(),
                CallOptions::new().attempts(1).fallback(fallback),
                move || async move { cli.invoke(prompt, model, system).await.into_result() },
            )
            .await
            .map_err(gateway_failure)?;

        match outcome {
            CallOutcome::Primary(text) => Ok((text, 0.0)),
            CallOutcome::Alternate(text) => {
                info!(tier = %spec.tier, "Served by direct API after CLI fallback");
                Ok((text, spec.cost_per_call))
            }
            CallOutcome::Degraded(text) => Ok((text, 0.0)),
            CallOutcome::Skipped | CallOutcome::Deferred => Err(CallError::new(
                ErrorKind::Unknown,
                format!("{} produced no result", spec.tier),
            )),
        }
    }

    async fn finish_success(&self, task: Task, tier: Tier, run: Execution) {
        let cost = task.cost + run.cost;
        if run.cost > 0.0 {
            self.board.add_cost(run.cost);
        }

        if run.analysis.is_some() || run.recommendation.is_some() {
            let update = self.queue.update(&task.id, |t| {
                if let Some(analysis) = &run.analysis {
                    t.context.insert(context_keys::ANALYSIS.to_string(), analysis.clone());
                }
                if let Some(rec) = &run.recommendation {
                    t.context.insert(context_keys::RECOMMENDATION.to_string(), rec.clone());
                }
            });
            if let Err(e) = update {
                warn!(task_id = %task.id, "Could not store task notes: {}", e);
            }
        }

        let done = match self.queue.complete(&task.id, &run.text, cost) {
            Ok(done) => done,
            Err(e) => {
                error!(task_id = %task.id, "Could not complete task: {}", e);
                return;
            }
        };

        self.board
            .post(
                &done.id,
                EntryKind::Completed,
                Some(tier),
                format!("Completed on {} (cost ${:.4})", tier, cost),
            )
            .await;

        let summary: String = run.text.chars().take(ACTIVITY_SUMMARY_CHARS).collect();
        self.collaborators
            .record(&Activity {
                task_id: done.id.clone(),
                tier: tier.as_str().to_string(),
                prompt: done.prompt.clone(),
                summary,
                cost,
                recorded_at: Utc::now(),
            })
            .await;

        self.resolve(&done);
    }

    async fn finish_failure(&self, task: Task, mode: DispatchMode, forced: bool, tier: Tier, err: CallError) {
        let message = err.to_string();

        // The queue record stays InProgress; this copy answers "would a
        // failure here escalate?"
        let mut failed = task.clone();
        failed.status = TaskStatus::Failed;
        failed.error = Some(message.clone());

        if mode == DispatchMode::Full && !forced && self.engine.should_escalate(&failed) {
            if let Some(next) = self.engine.next(tier) {
                let handoff = self.engine.build_context(&failed).to_json();
                match self.queue.escalate(&task.id, next, &message, &handoff, task.cost) {
                    Ok(_) => {
                        info!(task_id = %task.id, from = %tier, to = %next, "Escalating after: {}", message);
                        return;
                    }
                    Err(e) => warn!(task_id = %task.id, "Escalation not possible, failing task: {}", e),
                }
            }
        }

        let failed = match self.queue.fail(&task.id, &message) {
            Ok(t) => t,
            Err(e) => {
                error!(task_id = %task.id, "Could not fail task: {}", e);
                return;
            }
        };

        self.board
            .post(
                &failed.id,
                EntryKind::ActionRequired,
                Some(tier),
                format!(
                    "Failed on {} after {} escalation(s): {}",
                    tier, failed.escalation_count, message
                ),
            )
            .await;

        self.resolve(&failed);
    }
}

fn gateway_failure(e: GatewayError) -> CallError {
    CallError::new(e.kind(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(DispatchMode::parse("LITE"), Some(DispatchMode::Lite));
        assert_eq!(DispatchMode::parse("full"), Some(DispatchMode::Full));
        assert_eq!(DispatchMode::parse("turbo"), None);
        assert_eq!(DispatchMode::default(), DispatchMode::Full);
    }

    #[test]
    fn test_result_from_task() {
        let mut task = Task::new("hi", Complexity::Complex)
            .with_context(context_keys::RECOMMENDATION, "use full mode");
        task.status = TaskStatus::Completed;
        task.assigned_tier = Some(Tier::Llama);
        task.result = Some("hello".into());

        let result = DispatchResult::from(task);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.tier, Some(Tier::Llama));
        assert_eq!(result.recommendation.as_deref(), Some("use full mode"));
    }
}

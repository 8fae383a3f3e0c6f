//! Dispatch Scenario Tests
//!
//! End-to-end runs through the controller with scripted providers.
//! Time is paused so retry backoff costs nothing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tierdispatch::collaborators::{CollaboratorError, KnowledgeStore};
use tierdispatch::providers::{API_COMPONENT, CLI_COMPONENT, OLLAMA_COMPONENT};
use tierdispatch::resilience::ErrorKind;
use tierdispatch::{
    CircuitBreakerRegistry, Collaborators, Complexity, Config, DispatchController, DispatchError,
    DispatchMode, EntryKind, ErrorStats, EscalationEngine, KnowledgeEntry, MemoryTaskStore, Provider,
    ProviderResponse, RateLimiterRegistry, ResilientGateway, Task, TaskQueue, TaskStatus, TaskStore,
    Tier, TierProviders,
};

const SIMPLE_PROMPT: &str = "What is the capital of France?";
const COMPLEX_PROMPT: &str = "Refactor the payment module architecture";

/// Answers every call with the same response and records what it saw
struct ScriptedProvider {
    name: &'static str,
    response: ProviderResponse,
    calls: AtomicUsize,
    systems: Mutex<Vec<String>>,
    /// Each call waits for a permit when set
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedProvider {
    fn new(name: &'static str, response: ProviderResponse) -> Arc<Self> {
        Arc::new(Self {
            name,
            response,
            calls: AtomicUsize::new(0),
            systems: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    fn gated(name: &'static str, response: ProviderResponse, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            name,
            response,
            calls: AtomicUsize::new(0),
            systems: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    fn answering(name: &'static str, text: &str) -> Arc<Self> {
        Self::new(name, ProviderResponse::ok(text))
    }

    fn down(name: &'static str) -> Arc<Self> {
        Self::new(
            name,
            ProviderResponse::failed(ErrorKind::Connectivity, "connection refused"),
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn systems(&self) -> Vec<String> {
        self.systems.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _prompt: &str, _model: &str, system: &str) -> ProviderResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.systems.lock().push(system.to_string());
        if let Some(ref gate) = self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.response.clone()
    }
}

struct StaticKnowledge;

#[async_trait]
impl KnowledgeStore for StaticKnowledge {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, CollaboratorError> {
        Ok(vec![KnowledgeEntry {
            content: "Payments moved to the ledger service last quarter".into(),
            source: "activity".into(),
            score: 1.0,
        }]
        .into_iter()
        .take(limit)
        .collect())
    }
}

struct Harness {
    controller: DispatchController,
    local: Arc<ScriptedProvider>,
    cli: Arc<ScriptedProvider>,
    api: Arc<ScriptedProvider>,
    config: Config,
}

fn harness_with(
    local: Arc<ScriptedProvider>,
    cli: Arc<ScriptedProvider>,
    api: Arc<ScriptedProvider>,
    store: Arc<dyn TaskStore>,
    collaborators: Collaborators,
) -> Harness {
    let config = Config::from_lookup(|_| None).unwrap();
    let gateway = Arc::new(ResilientGateway::new(
        config.gateway_config(),
        Arc::new(CircuitBreakerRegistry::new(config.breaker.clone())),
        Arc::new(RateLimiterRegistry::new()),
        Arc::new(ErrorStats::new()),
    ));
    let providers = TierProviders {
        local: local.clone(),
        cli: cli.clone(),
        api: api.clone(),
    };
    let controller = DispatchController::builder(
        Arc::new(TaskQueue::new(store)),
        EscalationEngine::new(config.tier_chain()),
        gateway,
        providers,
    )
    .collaborators(collaborators)
    .build();

    Harness {
        controller,
        local,
        cli,
        api,
        config,
    }
}

fn harness(local: Arc<ScriptedProvider>, cli: Arc<ScriptedProvider>, api: Arc<ScriptedProvider>) -> Harness {
    harness_with(local, cli, api, Arc::new(MemoryTaskStore::new()), Collaborators::none())
}

#[tokio::test(start_paused = true)]
async fn test_simple_prompt_stays_local() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Paris"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(SIMPLE_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.complexity, Complexity::Simple);
    assert_eq!(result.tier, Some(Tier::Llama));
    assert_eq!(result.result.as_deref(), Some("Paris"));
    assert_eq!(result.cost, 0.0);
    assert_eq!(result.escalation_count, 0);
    assert_eq!(h.local.calls(), 1);
    assert_eq!(h.cli.calls(), 0);
    assert_eq!(h.api.calls(), 0);

    let kinds: Vec<EntryKind> = h
        .controller
        .status_board()
        .entries_for(&result.task_id)
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EntryKind::InProgress, EntryKind::Completed]);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_cli_falls_back_to_paid_api() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Steps: isolate gateway, migrate callers"),
        ScriptedProvider::new(CLI_COMPONENT, ProviderResponse::rate_limited("Claude usage limit reached")),
        ScriptedProvider::answering(API_COMPONENT, "Refactor plan"),
    );
    h.controller.start(1);

    let result = h.controller.process(COMPLEX_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.complexity, Complexity::Complex);
    assert_eq!(result.tier, Some(Tier::Sonnet));
    assert_eq!(result.result.as_deref(), Some("Refactor plan"));
    assert!((result.cost - h.config.sonnet_cost).abs() < f64::EPSILON);

    // Local analysis once, CLI exactly once, API exactly once
    assert_eq!(h.local.calls(), 1);
    assert_eq!(h.cli.calls(), 1);
    assert_eq!(h.api.calls(), 1);

    // Analysis reached the cloud tier and is kept on the task
    assert!(h.api.systems()[0].contains("isolate gateway"));
    let task = h.controller.task(&result.task_id).unwrap();
    assert!(task.context_value("analysis").is_some());

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.pending_count, 0);
    assert_eq!(snapshot.tier_calls["llama"], 1);
    assert_eq!(snapshot.tier_calls["sonnet"], 1);
    assert!((snapshot.accrued_cost - h.config.sonnet_cost).abs() < f64::EPSILON);
    assert_eq!(snapshot.errors.fallbacks, 1);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cli_success_is_free() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "notes"),
        ScriptedProvider::answering(CLI_COMPONENT, "Refactor plan from CLI"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(COMPLEX_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.cost, 0.0);
    assert_eq!(h.api.calls(), 0);
    assert_eq!(h.controller.snapshot().accrued_cost, 0.0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_analysis_does_not_block_cloud_tier() {
    let h = harness(
        ScriptedProvider::down(OLLAMA_COMPONENT),
        ScriptedProvider::answering(CLI_COMPONENT, "done"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(COMPLEX_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.tier, Some(Tier::Sonnet));
    let task = h.controller.task(&result.task_id).unwrap();
    assert!(task.context_value("analysis").is_none());

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_everything_down_exhausts_chain() {
    let h = harness(
        ScriptedProvider::down(OLLAMA_COMPONENT),
        ScriptedProvider::down(CLI_COMPONENT),
        ScriptedProvider::down(API_COMPONENT),
    );
    h.controller.start(1);

    let result = h.controller.process(SIMPLE_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.escalation_count, 2);
    assert_eq!(result.tier, Some(Tier::Opus));
    assert!(result.error.is_some());

    // Local tier used its full retry budget, CLI got one shot per cloud tier
    assert_eq!(h.local.calls(), 3);
    assert_eq!(h.cli.calls(), 2);

    // Later tiers received the hand-off
    assert!(h.cli.systems().iter().all(|s| s.contains("Hand-off")));

    let entries = h.controller.status_board().entries_for(&result.task_id);
    assert_eq!(entries.first().map(|e| e.kind), Some(EntryKind::InProgress));
    assert_eq!(entries.last().map(|e| e.kind), Some(EntryKind::ActionRequired));
    assert_eq!(
        entries.iter().filter(|e| e.kind == EntryKind::InProgress).count(),
        1
    );

    let snapshot = h.controller.snapshot();
    assert_eq!(snapshot.action_required.len(), 1);
    assert_eq!(snapshot.accrued_cost, 0.0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_escalation_recovers_on_next_tier() {
    let h = harness(
        ScriptedProvider::down(OLLAMA_COMPONENT),
        ScriptedProvider::answering(CLI_COMPONENT, "Paris"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(SIMPLE_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.tier, Some(Tier::Sonnet));
    assert_eq!(result.escalation_count, 1);
    assert_eq!(result.result.as_deref(), Some("Paris"));
    assert_eq!(result.cost, 0.0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lite_mode_recommends_full_for_complex_work() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "a rough refactor"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(COMPLEX_PROMPT, DispatchMode::Lite, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.tier, Some(Tier::Llama));
    assert!(result.recommendation.unwrap().contains("full mode"));
    assert_eq!(h.cli.calls(), 0);
    assert_eq!(h.api.calls(), 0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lite_mode_never_escalates() {
    let h = harness(
        ScriptedProvider::down(OLLAMA_COMPONENT),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let result = h.controller.process(SIMPLE_PROMPT, DispatchMode::Lite, None).await.unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.escalation_count, 0);
    assert_eq!(h.cli.calls(), 0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_forced_tier_skips_selection_and_escalation() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "unused"),
        ScriptedProvider::down(CLI_COMPONENT),
        ScriptedProvider::down(API_COMPONENT),
    );
    h.controller.start(1);

    let result = h
        .controller
        .process(COMPLEX_PROMPT, DispatchMode::Full, Some(Tier::Opus))
        .await
        .unwrap();

    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.tier, Some(Tier::Opus));
    assert_eq!(result.escalation_count, 0);
    // No local analysis for a forced tier
    assert_eq!(h.local.calls(), 0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_knowledge_is_added_to_system_prompt() {
    let h = harness_with(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Paris"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
        Arc::new(MemoryTaskStore::new()),
        Collaborators::none().with_knowledge(Arc::new(StaticKnowledge)),
    );
    h.controller.start(1);

    h.controller.process(SIMPLE_PROMPT, DispatchMode::Full, None).await.unwrap();

    assert!(h.local.systems()[0].contains("ledger service"));

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_pickup() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Paris"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    // Workers have not been polled yet; the task is still Pending
    let submission = h.controller.submit(SIMPLE_PROMPT, DispatchMode::Full, None).unwrap();
    let cancelled = h.controller.cancel(&submission.task_id).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Failed);

    let result = submission.wait().await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("cancelled"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.local.calls(), 0);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_submit_requires_workers() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Paris"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );

    let err = h.controller.process(SIMPLE_PROMPT, DispatchMode::Full, None).await;
    assert!(matches!(err, Err(DispatchError::NotStarted)));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_task_runs_to_completion() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut interrupted = Task::new(SIMPLE_PROMPT, Complexity::Simple);
    interrupted.status = TaskStatus::InProgress;
    store.save(&interrupted).unwrap();

    let h = harness_with(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "Paris"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
        store.clone(),
        Collaborators::none(),
    );

    let report = h.controller.recover().unwrap();
    assert_eq!(report.requeued, 1);
    h.controller.start(1);

    let mut status = TaskStatus::Pending;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = h.controller.task(&interrupted.id).unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(
        store.get(&interrupted.id).unwrap().unwrap().status,
        TaskStatus::Completed
    );

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovered_escalated_task_is_reported_in_progress() {
    let store = Arc::new(MemoryTaskStore::new());
    let mut interrupted = Task::new(SIMPLE_PROMPT, Complexity::Simple);
    interrupted.status = TaskStatus::InProgress;
    interrupted.assigned_tier = Some(Tier::Sonnet);
    interrupted.escalation_count = 1;
    store.save(&interrupted).unwrap();

    let h = harness_with(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "unused"),
        ScriptedProvider::answering(CLI_COMPONENT, "Paris"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
        store,
        Collaborators::none(),
    );

    assert_eq!(h.controller.recover().unwrap().requeued, 1);
    h.controller.start(1);

    let mut status = TaskStatus::Pending;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = h.controller.task(&interrupted.id).unwrap().status;
        if status.is_terminal() {
            break;
        }
    }
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(h.cli.calls(), 1);

    let kinds: Vec<EntryKind> = h
        .controller
        .status_board()
        .entries_for(&interrupted.id)
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EntryKind::InProgress, EntryKind::Completed]);

    h.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_during_shutdown_is_reported_not_escalated() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        ScriptedProvider::gated(
            OLLAMA_COMPONENT,
            ProviderResponse::failed(ErrorKind::Connectivity, "connection refused"),
            gate.clone(),
        ),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(1);

    let submission = h.controller.submit(SIMPLE_PROMPT, DispatchMode::Full, None).unwrap();
    let task_id = submission.task_id.clone();
    // Worker is now blocked inside the local call
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.local.calls(), 1);

    // Close the queue while the call is in flight, then let it fail
    tokio::join!(h.controller.shutdown(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.add_permits(10);
    });

    let result = tokio::time::timeout(Duration::from_secs(60), submission.wait())
        .await
        .expect("waiter was never resolved")
        .unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.escalation_count, 0);
    assert_eq!(result.tier, Some(Tier::Llama));
    assert_eq!(h.cli.calls(), 0);

    let entries = h.controller.status_board().entries_for(&task_id);
    assert_eq!(entries.last().map(|e| e.kind), Some(EntryKind::ActionRequired));
    assert_eq!(h.controller.task(&task_id).unwrap().status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_prompts() {
    let h = harness(
        ScriptedProvider::answering(OLLAMA_COMPONENT, "answer"),
        ScriptedProvider::answering(CLI_COMPONENT, "unused"),
        ScriptedProvider::answering(API_COMPONENT, "unused"),
    );
    h.controller.start(3);

    let submissions: Vec<_> = (0..6)
        .map(|i| {
            h.controller
                .submit(&format!("What is {} plus {}?", i, i), DispatchMode::Full, None)
                .unwrap()
        })
        .collect();

    let mut ids = HashSet::new();
    for submission in submissions {
        let result = submission.wait().await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        ids.insert(result.task_id);
    }
    assert_eq!(ids.len(), 6);
    assert_eq!(h.local.calls(), 6);
    assert_eq!(h.controller.snapshot().tier_calls["llama"], 6);

    h.controller.shutdown().await;
}

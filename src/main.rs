//! TierDispatch - Entry Point
//!
//! Modes:
//! - Default: dispatch one prompt and print the result
//! - --serve / -s: read prompts from stdin, one per line, print JSON results
//! - --status: print the operator snapshot after crash recovery

use std::sync::Arc;
use tierdispatch::{
    AnthropicApiProvider, CircuitBreakerRegistry, ClaudeCliProvider, Collaborators, Config,
    DispatchController, DispatchMode, ErrorStats, EscalationEngine, OllamaProvider, RateLimiterRegistry,
    ResilientGateway, SqliteActivityLog, SqliteTaskStore, TaskQueue, Tier, TierProviders, ToolSupervisor,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!("TierDispatch v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: tierdispatch [OPTIONS] <prompt...>");
    println!();
    println!("Options:");
    println!("  --lite             Local tier only, no escalation");
    println!("  --tier <t>         Force a tier: llama, sonnet or opus");
    println!("  --serve, -s        Read prompts from stdin, one per line");
    println!("  --status           Print the status snapshot as JSON");
    println!("  --help, -h         Show this help");
    println!();
    println!("Environment variables:");
    println!("  TIERDISPATCH_DB_PATH        Task database (default: <data dir>/tierdispatch/tasks.db)");
    println!("  OLLAMA_URL                  Local tier endpoint (default: http://localhost:11434)");
    println!("  LLAMA_MODEL                 Local tier model (default: llama3.2:3b)");
    println!("  CLAUDE_CLI                  CLI binary for the cost-free path (default: claude)");
    println!("  ANTHROPIC_API_KEY           Key for the paid direct API path");
    println!("  TIERDISPATCH_SONNET_MODEL   Mid tier model id");
    println!("  TIERDISPATCH_OPUS_MODEL     Top tier model id");
    println!("  TIERDISPATCH_MAX_ATTEMPTS   Attempts per call (default: 3)");
    println!("  TIERDISPATCH_BACKOFF        exponential, linear or constant");
    println!("  TIERDISPATCH_WORKERS        Concurrent dispatch workers (default: 2)");
    println!("  TIERDISPATCH_TOOLS          TOML tool table");
    println!("  RUST_LOG                    trace, debug, info, warn or error");
}

/// Wire every component from configuration
fn build_controller(config: &Config) -> anyhow::Result<DispatchController> {
    let store = Arc::new(SqliteTaskStore::open(&config.db_path)?);
    let queue = Arc::new(TaskQueue::new(store));

    let limiters = Arc::new(RateLimiterRegistry::new());
    limiters.register(tierdispatch::providers::API_COMPONENT, config.api_limits.clone());

    let gateway = Arc::new(ResilientGateway::new(
        config.gateway_config(),
        Arc::new(CircuitBreakerRegistry::new(config.breaker.clone())),
        limiters,
        Arc::new(ErrorStats::new()),
    ));

    let providers = TierProviders {
        local: Arc::new(OllamaProvider::new(&config.ollama_url)),
        cli: Arc::new(ClaudeCliProvider::new(&config.claude_cli)),
        api: Arc::new(AnthropicApiProvider::new(config.anthropic_api_key.as_deref())),
    };

    let collaborators = match SqliteActivityLog::open(&config.activity_db_path()) {
        Ok(log) => {
            let log = Arc::new(log);
            Collaborators::none().with_knowledge(log.clone()).with_activity(log)
        }
        Err(e) => {
            warn!("Activity log unavailable, continuing without it: {}", e);
            Collaborators::none()
        }
    };

    let supervisor = Arc::new(ToolSupervisor::from_process_env(config.load_tools()?));

    Ok(DispatchController::builder(
        queue,
        EscalationEngine::new(config.tier_chain()),
        gateway,
        providers,
    )
    .supervisor(supervisor)
    .collaborators(collaborators)
    .build())
}

async fn serve(controller: Arc<DispatchController>, mode: DispatchMode, forced: Option<Tier>) -> anyhow::Result<()> {
    for (name, result) in controller.supervisor().start_all() {
        if let Err(e) = result {
            warn!("Tool {} not started: {}", name, e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let prompt = line.trim().to_string();
                if prompt.is_empty() {
                    continue;
                }
                let submission = controller.submit(&prompt, mode, forced)?;
                tokio::spawn(async move {
                    match submission.wait().await {
                        Ok(result) => match serde_json::to_string(&result) {
                            Ok(json) => println!("{}", json),
                            Err(e) => warn!("Could not encode result: {}", e),
                        },
                        Err(e) => warn!("{}", e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let serve_mode = args.iter().any(|a| a == "--serve" || a == "-s");
    let status_mode = args.iter().any(|a| a == "--status");
    let lite = args.iter().any(|a| a == "--lite");

    if help_mode {
        print_help();
        return Ok(());
    }

    let mut forced_tier = None;
    let mut prompt_words = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--tier" => {
                let Some(name) = iter.next() else {
                    anyhow::bail!("--tier needs a value: llama, sonnet or opus");
                };
                match Tier::parse(name) {
                    Some(tier) => forced_tier = Some(tier),
                    None => anyhow::bail!("Unknown tier '{}'", name),
                }
            }
            a if a.starts_with('-') => {}
            word => prompt_words.push(word.to_string()),
        }
    }

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if serve_mode {
        // Long-running - human readable, stdout carries results
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // One-shot - log to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let mode = if lite { DispatchMode::Lite } else { DispatchMode::Full };
    let controller = Arc::new(build_controller(&config)?);

    let report = controller.recover()?;
    if report.requeued > 0 {
        info!("Recovered {} interrupted task(s)", report.requeued);
    }

    if status_mode {
        println!("{}", controller.snapshot().to_json());
        return Ok(());
    }

    controller.start(config.workers);

    if serve_mode {
        info!("TierDispatch v{} serving on stdin", env!("CARGO_PKG_VERSION"));
        let result = serve(Arc::clone(&controller), mode, forced_tier).await;
        controller.shutdown().await;
        return result;
    }

    if prompt_words.is_empty() {
        print_help();
        controller.shutdown().await;
        anyhow::bail!("No prompt given");
    }

    let prompt = prompt_words.join(" ");
    let result = controller.process(&prompt, mode, forced_tier).await;
    controller.shutdown().await;
    let result = result?;

    match (&result.result, &result.error) {
        (Some(text), _) => println!("{}", text),
        (None, Some(error)) => eprintln!("Failed: {}", error),
        (None, None) => eprintln!("No result"),
    }
    if let Some(rec) = &result.recommendation {
        eprintln!("Note: {}", rec);
    }
    eprintln!(
        "[{} | tier {} | ${:.4} | {} escalation(s)]",
        result.status,
        result.tier.map(|t| t.as_str()).unwrap_or("-"),
        result.cost,
        result.escalation_count
    );

    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;

use task_classify::Classifier;
use task_core::{ConfigStore, EventBus, LlmProvider, Result};
use task_decompose::Decomposer;
use task_heuristics::HeuristicSplitter;
use task_llm::{LlmClient, ProviderRegistry, ProviderSettings};
use task_runtime::{Handler, HandlerOutcome, HandlerRegistry, MicroStepRuntime};
use task_server::{serve, AppState};
use task_split::SplitProxy;
use task_store::Store;
use task_types::AutomationPlan;

#[derive(Parser, Debug)]
#[command(name = "task-server")]
#[command(about = "Capture-to-plan control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the HTTP server.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(None);
    std::fs::create_dir_all(&state_dir).ok();
    let _guard = task_observability::init_logging(&state_dir.join("logs"))?;

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir: override_dir,
        } => {
            let state_dir = override_dir.map(PathBuf::from).unwrap_or(state_dir);
            let state = build_state(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!("starting task-server on http://{addr}");
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("TASK_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".task-server")
}

async fn build_state(state_dir: &PathBuf) -> anyhow::Result<AppState> {
    let config = ConfigStore::load(Some(&state_dir.join("config.json"))).await?;
    let app_config = config.get().await;

    let store = Arc::new(Store::open(&state_dir.join("store.sqlite3")).await?);
    let events = EventBus::new();

    let provider_settings = ProviderSettings {
        api_key: app_config.llm.api_key.clone(),
        base_url: None,
        default_model: None,
    };
    let registry = match app_config.llm.provider {
        LlmProvider::Openai => ProviderRegistry::new(Some(provider_settings), None),
        LlmProvider::Anthropic => ProviderRegistry::new(None, Some(provider_settings)),
        LlmProvider::None => ProviderRegistry::new(None, None),
    };
    let llm_deadline = Duration::from_millis(app_config.llm.deadline_ms);
    let llm = Arc::new(LlmClient::with_deadline(
        registry.clone(),
        app_config.llm.max_concurrency,
        llm_deadline,
    ));

    let split_proxy = SplitProxy::with_config(
        LlmClient::with_deadline(registry, app_config.llm.max_concurrency, llm_deadline),
        HeuristicSplitter::new(),
        app_config.split.target_minutes,
        app_config.split.force_split_scope,
    );
    let decomposer = Arc::new(Decomposer::new(split_proxy, Classifier::new()));

    let handlers = HandlerRegistry::new()
        .register("send_email", Arc::new(SimulatedHandler))
        .register("schedule_event", Arc::new(SimulatedHandler))
        .register("search_web", Arc::new(SimulatedHandler))
        .register("create_reminder", Arc::new(SimulatedHandler));
    let runtime = Arc::new(MicroStepRuntime::new(
        store.clone(),
        events.clone(),
        handlers,
        app_config.runtime.handler_queue,
    ));

    Ok(AppState::new(
        store,
        events,
        runtime,
        decomposer,
        llm,
        config,
        app_config.runtime.default_deadline_ms,
    ))
}

/// Stand-in delegation handler: marks any DIGITAL step complete immediately
/// rather than calling a real external collaborator. Real third-party
/// integrations (Gmail, Calendar, ...) are explicitly out of scope.
struct SimulatedHandler;

#[async_trait]
impl Handler for SimulatedHandler {
    async fn execute(&self, _plan: &AutomationPlan) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::Completed {
            actual_minutes: None,
        })
    }
}

//! taskpilot: run one instruction against a workspace from the command line

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskpilot_core::{
    load_config, AgentConfig, AgentEvent, OpenAiCompatibleBackend, Orchestrator, RunOptions,
    RunStatus,
};
use taskpilot_memory::{ConfidenceScorer, LearningStore, MemoryStore, ToolResultCache};
use taskpilot_tools::{
    ApprovalCallback, ApprovalRequest, ApprovalResponse, PermissionGate, PermissionMode,
    ToolRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "taskpilot", version, about = "Autonomous task execution against a local workspace")]
struct Cli {
    /// Config file (defaults to $TASKPILOT_CONFIG, then ./taskpilot.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root the tools operate in
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Propose a plan before changing anything
    #[arg(long)]
    plan: bool,

    /// Skip permission prompts for this run
    #[arg(long)]
    trusted: bool,

    /// Stream model tokens to stderr
    #[arg(long)]
    verbose: bool,

    /// What to do
    #[arg(required = true)]
    instruction: Vec<String>,
}

/// Asks on the terminal before a gated tool runs
struct ConsoleApproval;

#[async_trait]
impl ApprovalCallback for ConsoleApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse {
        let prompt = format!(
            "\nAllow {} ({})? [y]es / [a]lways / [N]o: ",
            request.tool, request.description
        );
        let answer = tokio::task::spawn_blocking(move || {
            eprint!("{prompt}");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => match line.trim().to_lowercase().as_str() {
                "y" | "yes" => ApprovalResponse::approve(),
                "a" | "always" => ApprovalResponse {
                    approved: true,
                    always_allow: true,
                },
                _ => ApprovalResponse::deny(),
            },
            Ok(Err(e)) => {
                warn!("Could not read approval: {e}");
                ApprovalResponse::deny()
            }
            Err(e) => {
                warn!("Approval prompt failed: {e}");
                ApprovalResponse::deny()
            }
        }
    }
}

fn open_store(config: &AgentConfig) -> Option<MemoryStore> {
    let path = config.memory.db_path.as_deref()?;
    match MemoryStore::open(path) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("Memory store unavailable, running without persistence: {e:#}");
            None
        }
    }
}

fn print_event(event: &AgentEvent, verbose: bool) {
    match event {
        AgentEvent::Token { text, .. } if verbose => eprint!("{text}"),
        AgentEvent::ToolExecuting { tool, params, .. } => eprintln!("-> {tool} {params}"),
        AgentEvent::ToolResult {
            tool,
            success,
            cached,
            duration_ms,
            ..
        } => {
            let verdict = if *success { "ok" } else { "failed" };
            let origin = if *cached { " (cached)" } else { "" };
            eprintln!("<- {tool} {verdict}{origin} in {duration_ms}ms");
        }
        AgentEvent::FileModified { path, .. } => eprintln!("   modified {path}"),
        AgentEvent::CycleDetected { report, .. } => eprintln!("!! {}", report.description),
        AgentEvent::Error { message, .. } => eprintln!("!! {message}"),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(workspace) = &cli.workspace {
        config.agent.workspace_root = workspace.clone();
    }
    let workspace = config
        .agent
        .workspace_root
        .canonicalize()
        .with_context(|| format!("workspace {} not found", config.agent.workspace_root.display()))?;
    config.agent.workspace_root = workspace;

    let mode = if cli.trusted {
        PermissionMode::Trusted
    } else {
        config.permissions.mode
    };
    let gate = PermissionGate::new(mode).with_callback(Arc::new(ConsoleApproval));
    let registry = ToolRegistry::with_builtin_tools(gate);
    let backend = Arc::new(OpenAiCompatibleBackend::new(&config.inference)?);

    let mut scorer =
        ConfidenceScorer::new().with_threshold(config.confidence.auto_approve_threshold);
    let mut learning = LearningStore::new(config.learning.to_learning_config());
    let store = open_store(&config);
    if let Some(store) = &store {
        if let Err(e) = store.load_into(&mut scorer, &mut learning) {
            warn!("Failed to load memory: {e:#}");
        }
    }
    let cache = Arc::new(ToolResultCache::new(config.cache.to_cache_config()));
    let scorer = Arc::new(Mutex::new(scorer));
    let learning = Arc::new(Mutex::new(learning));

    let orchestrator = Arc::new(Orchestrator::with_components(
        config,
        backend,
        registry,
        scorer.clone(),
        learning.clone(),
        cache,
    ));

    let mut events = orchestrator.subscribe();
    let verbose = cli.verbose;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event, verbose);
        }
    });

    let aborter = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, aborting run");
            aborter.abort();
        }
    });

    let instruction = cli.instruction.join(" ");
    let opts = RunOptions {
        plan_mode: cli.plan.then_some(true),
        trusted: cli.trusted,
        ..Default::default()
    };
    let report = orchestrator.run_detailed(&instruction, Vec::new(), opts).await;

    if let Some(store) = &store {
        let scorer = scorer.lock().unwrap_or_else(PoisonError::into_inner);
        let learning = learning.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = store.save(&scorer, &learning) {
            warn!("Failed to save memory: {e:#}");
        }
    }

    printer.abort();

    println!("{}", report.final_text);
    if !report.modified_files.is_empty() {
        eprintln!("Modified: {}", report.modified_files.join(", "));
    }
    if report.status == RunStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}

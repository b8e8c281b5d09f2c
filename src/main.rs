//! Maestro CLI - declarative multi-agent workflow engine

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use maestro::agent::AgentRegistry;
use maestro::ast::{parse_agent_docs, AgentDoc, WorkflowSpec};
use maestro::config::EngineConfig;
use maestro::error::{FixSuggestion, MaestroError, Result};
use maestro::plan::{compile, render, DiagramKind, ExecutablePlan, Orientation};
use maestro::runtime::{RunOutcome, Runner, Scheduler, StopReason};

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Maestro - declarative multi-agent workflow engine")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/maestro/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow once
    Run {
        /// [AGENTS_FILE] WORKFLOW_FILE
        #[arg(num_args = 1..=2, required = true)]
        files: Vec<PathBuf>,

        /// Override the workflow prompt
        #[arg(short, long)]
        prompt: Option<String>,

        /// Print `data:` records as steps complete
        #[arg(short, long)]
        stream: bool,

        /// Bind every declared agent to a mock
        #[arg(long)]
        dry_run: bool,

        /// Write the audit event log as NDJSON
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Compile a workflow without running it
    Validate {
        /// Path to workflow YAML
        file: PathBuf,
    },

    /// Print the compiled plan as a Mermaid diagram
    Plan {
        /// Path to workflow YAML
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Kind::Flowchart)]
        kind: Kind,

        /// Flowchart orientation (TD, LR)
        #[arg(short, long, default_value = "TD")]
        orientation: String,
    },

    /// Fire runs on the workflow's `event` schedule until it stops
    Schedule {
        /// [AGENTS_FILE] WORKFLOW_FILE
        #[arg(num_args = 1..=2, required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Flowchart,
    Sequence,
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays a clean record stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            files,
            prompt,
            stream,
            dry_run,
            trace,
        } => {
            run_workflow(
                cli.config.as_deref(),
                &files,
                prompt.as_deref(),
                stream,
                dry_run,
                trace.as_deref(),
            )
            .await
        }
        Commands::Validate { file } => validate_workflow(cli.config.as_deref(), &file),
        Commands::Plan {
            file,
            kind,
            orientation,
        } => print_plan(cli.config.as_deref(), &file, kind, &orientation),
        Commands::Schedule { files, dry_run } => {
            schedule_workflow(cli.config.as_deref(), &files, dry_run).await
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>, dry_run: bool) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    }
    .with_env()?;
    config.dry_run |= dry_run;
    Ok(config)
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => MaestroError::WorkflowNotFound {
            path: path.display().to_string(),
        },
        _ => MaestroError::Io(e),
    })
}

fn load_plan(path: &Path, config: &EngineConfig) -> Result<ExecutablePlan> {
    let spec = WorkflowSpec::from_yaml(&read_file(path)?)?;
    compile(&spec, config)
}

/// `[agents] workflow` → bound runner
fn load_runner(files: &[PathBuf], config: EngineConfig) -> Result<Runner> {
    let (docs, workflow) = match files {
        [agents, workflow] => (parse_agent_docs(&read_file(agents)?)?, workflow),
        [workflow] => (Vec::new(), workflow),
        _ => {
            return Err(MaestroError::Config {
                reason: "expected [AGENTS_FILE] WORKFLOW_FILE".to_string(),
            })
        }
    };
    let plan = load_plan(workflow, &config)?;
    let agents = bind_agents(&plan, &docs, config.dry_run);
    Runner::new(plan, agents, config)
}

/// Documented agents always get a mock; `--dry-run` mocks the rest too
fn bind_agents(plan: &ExecutablePlan, docs: &[AgentDoc], dry_run: bool) -> AgentRegistry {
    if dry_run {
        return AgentRegistry::mocks(&plan.agents, docs);
    }
    let documented: Vec<String> = plan
        .agents
        .iter()
        .filter(|name| docs.iter().any(|d| d.name() == name.as_str()))
        .cloned()
        .collect();
    AgentRegistry::mocks(&documented, docs)
}

async fn run_workflow(
    config_path: Option<&Path>,
    files: &[PathBuf],
    prompt: Option<&str>,
    stream: bool,
    dry_run: bool,
    trace: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path, dry_run)?;
    let runner = load_runner(files, config)?;
    let plan = runner.plan();

    eprintln!(
        "{} Running '{}' | {} nodes | {} agents",
        "→".cyan(),
        plan.name.cyan().bold(),
        plan.node_count(),
        plan.agents.len()
    );

    let outcome = if stream {
        let handle = runner.stream(prompt);
        let (mut events, join, _cancel) = handle.into_parts();
        while let Some(record) = events.next().await {
            print!("{}", record.to_line()?);
        }
        join.await.map_err(|e| MaestroError::Agent {
            agent: String::new(),
            reason: format!("run task failed: {}", e),
        })?
    } else {
        runner.run(prompt).await
    };

    if let Some(path) = trace {
        runner.event_log().write_ndjson(path)?;
        eprintln!("{} Trace written to {}", "✓".green(), path.display());
    }

    report(&outcome, stream);
    outcome.into_response().map(|_| ())
}

fn report(outcome: &RunOutcome, streamed: bool) {
    let usage = outcome.usage();
    eprintln!(
        "{} {} in {}ms | tokens: {} prompt, {} response, {} total",
        "●".cyan(),
        outcome.state.to_string().bold(),
        outcome.duration.as_millis(),
        usage.prompt_tokens,
        usage.response_tokens,
        usage.total_tokens
    );
    if streamed {
        return;
    }
    if let Some(response) = outcome.response() {
        println!("{}", response.response);
    }
}

fn validate_workflow(config_path: Option<&Path>, file: &Path) -> Result<()> {
    let config = load_config(config_path, false)?;
    let plan = load_plan(file, &config)?;

    println!("{} Workflow '{}' is valid", "✓".green(), plan.name);
    println!("  Agents: {}", plan.agents.join(", "));
    println!("  Nodes: {}", plan.node_count());
    println!("  Handler: {}", if plan.handler.is_some() { "yes" } else { "no" });
    if let Some(trigger) = &plan.trigger {
        println!("  Schedule: {}", trigger.cron);
        if let Some(target) = &trigger.target {
            let names: Vec<&str> = target.iter().map(|n| n.name.as_str()).collect();
            println!("  Firing target: {}", names.join(", "));
        }
    }
    println!("  Hash: {}", plan.hash);
    Ok(())
}

fn print_plan(config_path: Option<&Path>, file: &Path, kind: Kind, orientation: &str) -> Result<()> {
    let config = load_config(config_path, false)?;
    let plan = load_plan(file, &config)?;
    let kind = match kind {
        Kind::Flowchart => DiagramKind::Flowchart(orientation.parse::<Orientation>()?),
        Kind::Sequence => DiagramKind::Sequence,
    };
    print!("{}", render(&plan, kind));
    Ok(())
}

async fn schedule_workflow(config_path: Option<&Path>, files: &[PathBuf], dry_run: bool) -> Result<()> {
    let config = load_config(config_path, dry_run)?;
    let runner = load_runner(files, config)?;
    let cancel = CancellationToken::new();
    let scheduler = Scheduler::from_plan(runner, cancel.clone())?;

    eprintln!(
        "{} Scheduling '{}' on '{}' (Ctrl-C to stop)",
        "→".cyan(),
        scheduler.workflow(),
        scheduler.expr()
    );

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let summary = scheduler
        .run_with(|outcome| {
            let line = format!("{} {}", outcome.run_id, outcome.state);
            match outcome.response() {
                Some(response) => println!("{} {}", line.green(), response.response),
                None => println!("{}", line.red()),
            }
        })
        .await;

    let reason = match summary.stopped {
        StopReason::Cancelled => "cancelled",
        StopReason::Exit => "exit condition met",
        StopReason::MaxRuns => "max runs reached",
        StopReason::Exhausted => "schedule exhausted",
    };
    eprintln!(
        "{} {} firings ({} failed), {}",
        "●".cyan(),
        summary.firings,
        summary.failed,
        reason
    );
    Ok(())
}

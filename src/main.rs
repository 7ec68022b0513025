use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use staffline_core::config::AppConfig;
use staffline_core::types::*;
use staffline_engine::{templates::draft_from_toml, Engine, InstanceDetail};
use staffline_store::{ExceptionFilter, InstanceFilter};

#[derive(Parser)]
#[command(name = "staffline", version, about = "Employee lifecycle workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "staffline.toml")]
    config: PathBuf,

    /// Name recorded as the actor on every change made by this command
    #[arg(long, env = "STAFFLINE_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST gateway with the sweeper and audit logger
    Serve,
    /// Run one maintenance sweep and exit
    Sweep,
    /// Manage workflow templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Start and drive workflow instances
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// List and close exceptions
    Exceptions {
        #[command(subcommand)]
        action: ExceptionAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Create a draft template from a TOML file
    Import {
        file: PathBuf,
        /// Publish right after importing
        #[arg(long)]
        publish: bool,
    },
    /// List templates
    List {
        #[arg(long)]
        lifecycle: Option<LifecycleType>,
        #[arg(long)]
        state: Option<TemplateState>,
    },
    /// Publish a draft template
    Publish { id: String },
    /// Retire a template
    Retire { id: String },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Start a workflow for an employee
    Start {
        #[arg(long)]
        employee: String,
        /// Template to use; when omitted the best match for the lifecycle is picked
        #[arg(long)]
        template: Option<String>,
        #[arg(long, default_value = "onboarding")]
        lifecycle: LifecycleType,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        role: Option<String>,
        /// First day of the workflow (YYYY-MM-DD)
        #[arg(long)]
        start_date: NaiveDate,
        #[arg(long)]
        expected_completion: Option<NaiveDate>,
        /// Role assignment such as `buddy=jamie`; repeatable
        #[arg(long = "assign", value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
    },
    /// Show an instance with its steps
    Show { id: String },
    /// List instances
    List {
        #[arg(long)]
        employee: Option<String>,
        #[arg(long)]
        status: Option<InstanceStatus>,
        /// Only instances still in flight
        #[arg(long)]
        active: bool,
    },
    /// Move a step to a new status
    Transition {
        id: String,
        /// Step id or blueprint key
        step: String,
        status: StepStatus,
    },
    /// Re-open a failed integration step
    Retry { id: String, step: String },
    /// Cancel an instance
    Cancel {
        id: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ExceptionAction {
    /// List exceptions
    List {
        #[arg(long)]
        status: Option<ResolutionStatus>,
        #[arg(long)]
        instance: Option<String>,
        /// Only open or in-progress exceptions
        #[arg(long)]
        open: bool,
    },
    /// Mark an exception resolved
    Resolve {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Dismiss an exception
    Dismiss {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((role, person)) if !role.trim().is_empty() && !person.trim().is_empty() => {
            Ok((role.trim().to_string(), person.trim().to_string()))
        }
        _ => Err(format!("expected role=person, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("staffline=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Completions need no config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "staffline", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let providers = staffline_providers::build_providers(&config.providers);
    let engine = Arc::new(Engine::open(config, providers)?);
    let actor = Actor::from_string(&cli.actor);

    match cli.command {
        Commands::Serve => serve(engine).await?,
        Commands::Sweep => {
            let report = engine.sweeper().sweep_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Template { action } => handle_template(&engine, action, &actor)?,
        Commands::Instance { action } => handle_instance(&engine, action, &actor).await?,
        Commands::Exceptions { action } => handle_exceptions(&engine, action, &actor)?,
        Commands::Config | Commands::Completions { .. } => {}
    }
    Ok(())
}

/// The given path, then `~/.staffline/config.toml`, then built-in defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".staffline").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });

    let mut tasks = Vec::new();
    if let Some(logger) = engine.audit_logger() {
        tasks.push(tokio::spawn(logger.run(engine.event_bus().clone(), cancel.clone())));
    }
    let sweeper = engine.sweeper();
    let sweep_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move { sweeper.run(sweep_cancel).await }));

    let gateway_config = engine.config().gateway.clone().unwrap_or_default();
    if gateway_config.api_keys.is_empty() {
        warn!("No gateway API keys configured, every request is treated as admin");
    }
    let server = staffline_gateway::GatewayServer::new(gateway_config, engine.clone());
    let result = server.run(cancel.clone()).await;

    cancel.cancel();
    for task in tasks {
        task.await.ok();
    }
    result
}

fn handle_template(engine: &Engine, action: TemplateAction, actor: &Actor) -> anyhow::Result<()> {
    let templates = engine.templates();
    match action {
        TemplateAction::Import { file, publish } => {
            let content = std::fs::read_to_string(&file)?;
            let draft = draft_from_toml(&content)?;
            let mut template = templates.create(draft, actor)?;
            if publish {
                template = templates.publish(&template.id)?;
            }
            println!(
                "{} {} v{} ({}, {} steps)",
                template.id,
                template.name,
                template.version,
                template.state,
                template.steps.len()
            );
        }
        TemplateAction::List { lifecycle, state } => {
            let list = templates.list(lifecycle, state)?;
            if list.is_empty() {
                println!("No templates.");
            }
            for t in list {
                println!(
                    "{}  {:<12} {:<10} v{:<3} {}",
                    t.id, t.lifecycle, t.state, t.version, t.name
                );
            }
        }
        TemplateAction::Publish { id } => {
            let t = templates.publish(&TemplateId::from_string(&id))?;
            println!("Published {} v{}", t.name, t.version);
        }
        TemplateAction::Retire { id } => {
            let t = templates.retire(&TemplateId::from_string(&id))?;
            println!("Retired {} v{}", t.name, t.version);
        }
    }
    Ok(())
}

async fn handle_instance(engine: &Engine, action: InstanceAction, actor: &Actor) -> anyhow::Result<()> {
    let instances = engine.instances();
    match action {
        InstanceAction::Start {
            employee,
            template,
            lifecycle,
            department,
            role,
            start_date,
            expected_completion,
            assignments,
        } => {
            let template_id = match template {
                Some(id) => TemplateId::from_string(&id),
                None => engine
                    .templates()
                    .find_template(lifecycle, department.as_deref(), role.as_deref())?
                    .map(|t| t.id)
                    .ok_or_else(|| anyhow::anyhow!("No published {} template matches", lifecycle))?,
            };
            let detail = instances.instantiate(
                InstantiateRequest {
                    employee_id: EmployeeId::from_string(&employee),
                    source: StepSource::Template { template_id },
                    start_date,
                    expected_completion,
                    assignments: assignments.into_iter().collect::<BTreeMap<_, _>>(),
                },
                actor,
            )?;
            print_detail(&detail);
        }
        InstanceAction::Show { id } => {
            print_detail(&instances.get(&InstanceId::from_string(&id))?);
        }
        InstanceAction::List {
            employee,
            status,
            active,
        } => {
            let list = instances.list(&InstanceFilter {
                employee_id: employee.as_deref().map(EmployeeId::from_string),
                status,
                lifecycle: None,
                active_only: active,
                limit: None,
            })?;
            if list.is_empty() {
                println!("No instances.");
            }
            for i in list {
                println!(
                    "{}  {:<12} {:<12} {:>3}%  {}",
                    i.id, i.employee_id.0, i.status, i.percentage, i.stage
                );
            }
        }
        InstanceAction::Transition { id, step, status } => {
            let instance_id = InstanceId::from_string(&id);
            let step_id = resolve_step(engine, &instance_id, &step)?;
            let result = instances
                .transition_step(&instance_id, &step_id, status, actor)
                .await?;
            println!(
                "{} -> {} (instance {} at {}%)",
                result.step.title, result.step.status, result.instance.status, result.instance.percentage
            );
            if let Some(attempt) = result.attempt {
                println!(
                    "  integration {}: {} (attempt {}/{})",
                    attempt.kind, attempt.status, attempt.attempt_count, attempt.max_attempts
                );
            }
        }
        InstanceAction::Retry { id, step } => {
            let instance_id = InstanceId::from_string(&id);
            let step_id = resolve_step(engine, &instance_id, &step)?;
            let result = instances.retry_step(&instance_id, &step_id, actor).await?;
            println!("{} re-opened ({})", result.step.title, result.step.status);
        }
        InstanceAction::Cancel { id, reason } => {
            let instance = instances.cancel(&InstanceId::from_string(&id), actor, &reason)?;
            println!("{} {}", instance.id, instance.status);
        }
    }
    Ok(())
}

fn handle_exceptions(engine: &Engine, action: ExceptionAction, actor: &Actor) -> anyhow::Result<()> {
    let exceptions = engine.exceptions();
    match action {
        ExceptionAction::List {
            status,
            instance,
            open,
        } => {
            let list = exceptions.list(&ExceptionFilter {
                instance_id: instance.as_deref().map(InstanceId::from_string),
                step_id: None,
                status,
                kind: None,
                open_only: open,
            })?;
            if list.is_empty() {
                println!("No exceptions.");
            }
            for e in list {
                println!(
                    "{}  {:<8} {:<20} {:<11} {}",
                    e.id, e.severity, e.kind, e.status, e.title
                );
            }
        }
        ExceptionAction::Resolve { id, notes } => {
            let e = exceptions.resolve(&ExceptionId::from_string(&id), actor, notes)?;
            println!("{} {}", e.id, e.status);
        }
        ExceptionAction::Dismiss { id, notes } => {
            let e = exceptions.dismiss(&ExceptionId::from_string(&id), actor, notes)?;
            println!("{} {}", e.id, e.status);
        }
    }
    Ok(())
}

/// Accept either a step id or the blueprint key it was created from.
fn resolve_step(engine: &Engine, instance_id: &InstanceId, step: &str) -> anyhow::Result<StepId> {
    let detail = engine.instances().get(instance_id)?;
    detail
        .steps
        .iter()
        .find(|s| s.id.as_str() == step || s.blueprint_id.as_deref() == Some(step))
        .map(|s| s.id.clone())
        .ok_or_else(|| anyhow::anyhow!("No step '{}' in instance {}", step, instance_id))
}

fn print_detail(detail: &InstanceDetail) {
    let i = &detail.instance;
    println!(
        "{}  {} {}  {} {}%  stage: {}",
        i.id, i.employee_id.0, i.lifecycle, i.status, i.percentage, i.stage
    );
    if let Some(expected) = i.expected_completion {
        println!("  expected completion {}", expected);
    }
    for s in &detail.steps {
        println!(
            "  [{:<11}] {:<28} {:<12} due {:<10} {}",
            s.status,
            s.title,
            s.assignee.as_deref().unwrap_or("-"),
            s.due_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into()),
            s.blueprint_id.as_deref().unwrap_or(""),
        );
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

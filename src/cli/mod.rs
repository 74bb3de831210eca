#![forbid(unsafe_code)]

use std::io::IsTerminal as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::controller::{InterruptSignal, Orchestrator, StartRequest, resume_command};
use crate::exit_codes;
use crate::logging;
use crate::output::table::Table;
use crate::runner::Runners;
use crate::runner::ai::CliAiRunner;
use crate::runner::approval::{ApprovalGate, DeferredApprovalGate, TerminalApprovalGate};
use crate::runner::command::ShellCommandRunner;
use crate::runner::hub::GhCliRunner;
use crate::step::dry_run::DryRunReport;
use crate::task::model::{Task, TaskStatus};
use crate::task::progress::{ProgressEvent, ProgressKind, ProgressSink};

#[derive(Debug, Parser)]
#[command(
    name = "tasksmith",
    version,
    about = "Run templated AI development tasks in isolated git worktrees"
)]
pub struct Cli {
    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a workspace and run a template in it
    Start(StartArgs),
    /// Continue a stopped task from the step it stopped on
    Resume(TaskRefArgs),
    /// Approve a task waiting at a human step and continue it
    Approve(TaskRefArgs),
    /// Reject a task waiting at a human step
    Reject(ReasonArgs),
    /// Give up on a stopped task
    Abandon(ReasonArgs),
    /// Mark a task left running by a crashed process as interrupted
    Recover(TaskRefArgs),
    #[command(alias = "ws")]
    Workspace(WorkspaceArgs),
    /// List available templates
    Templates(TemplatesArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct StartArgs {
    /// What the task should accomplish
    #[arg(required = true, num_args = 1..)]
    pub description: Vec<String>,
    #[arg(short, long, default_value = "task")]
    pub template: String,
    /// Workspace name (derived from the description when omitted)
    #[arg(short, long)]
    pub workspace: Option<String>,
    /// Branch to cut the new branch from
    #[arg(short, long, conflicts_with = "target")]
    pub base: Option<String>,
    /// Existing branch to check out instead of creating one
    #[arg(long)]
    pub target: Option<String>,
    /// Reuse a local branch with the same name instead of suffixing
    #[arg(long = "use-local")]
    pub use_local: bool,
    #[arg(short, long)]
    pub agent: Option<String>,
    #[arg(short, long)]
    pub model: Option<String>,
    /// Show what would happen without touching anything
    #[arg(long = "dry-run")]
    pub dry_run: bool,
    /// Machine-readable output
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskRefArgs {
    pub workspace: String,
    /// Task id (defaults to the workspace's latest task)
    #[arg(long)]
    pub task: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ReasonArgs {
    pub workspace: String,
    #[arg(long)]
    pub task: Option<String>,
    #[arg(short, long, default_value = "")]
    pub reason: String,
}

#[derive(Debug, Parser)]
pub struct WorkspaceArgs {
    #[command(subcommand)]
    pub cmd: WorkspaceCmd,
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCmd {
    #[command(alias = "ls")]
    List(ListArgs),
    Show(ShowArgs),
    /// Remove the worktree but keep the record
    Close(NameArgs),
    /// Remove the worktree and the record
    #[command(alias = "rm")]
    Destroy(NameArgs),
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    #[arg(long, conflicts_with = "csv")]
    pub json: bool,
    #[arg(long)]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    pub name: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct NameArgs {
    pub name: String,
}

#[derive(Debug, Parser)]
pub struct TemplatesArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(exit_codes::USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_codes::for_error(&err))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "tasksmith", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => cmd_config(args),
        Commands::Version => Ok(cmd_version()),
        Commands::Start(args) => cmd_start(args).await,
        Commands::Resume(args) => {
            let orch = orchestrator(&load_cfg().await?, true)?;
            let task = orch
                .resume(&CancellationToken::new(), &args.workspace, args.task.as_deref())
                .await?;
            Ok(report_outcome(&task))
        }
        Commands::Approve(args) => {
            let orch = orchestrator(&load_cfg().await?, true)?;
            let task = orch
                .approve(&CancellationToken::new(), &args.workspace, args.task.as_deref())
                .await?;
            Ok(report_outcome(&task))
        }
        Commands::Reject(args) => {
            let orch = orchestrator(&load_cfg().await?, false)?;
            let task = orch.reject(&CancellationToken::new(), &args.workspace, args.task.as_deref(), &args.reason)?;
            Ok(report_outcome(&task))
        }
        Commands::Abandon(args) => {
            let orch = orchestrator(&load_cfg().await?, false)?;
            let task = orch.abandon(&CancellationToken::new(), &args.workspace, args.task.as_deref(), &args.reason)?;
            Ok(report_outcome(&task))
        }
        Commands::Recover(args) => {
            let orch = orchestrator(&load_cfg().await?, false)?;
            let task = orch.recover(&CancellationToken::new(), &args.workspace, args.task.as_deref())?;
            println!("Task {} marked interrupted at step {}.", task.id, task.current_step_name());
            println!("Resume with: {}", resume_command(&task.workspace));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Workspace(args) => cmd_workspace(args, &load_cfg().await?),
        Commands::Templates(args) => cmd_templates(&args, &load_cfg().await?),
    }
}

async fn load_cfg() -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(|| -> anyhow::Result<Config> {
        let (cfg, _doc, _paths) = config::load()?;
        Ok(cfg)
    })
    .await??;
    Ok(cfg)
}

fn runners(cfg: &Config) -> Runners {
    let approval: Arc<dyn ApprovalGate> = if std::io::stdin().is_terminal() {
        Arc::new(TerminalApprovalGate)
    } else {
        Arc::new(DeferredApprovalGate)
    };
    Runners {
        ai: Arc::new(CliAiRunner::new(cfg.agent_executables())),
        commands: Arc::new(ShellCommandRunner),
        hub: Arc::new(GhCliRunner::default()),
        approval,
    }
}

/// `live` commands run steps: they listen for Ctrl-C and print progress.
fn orchestrator(cfg: &Config, live: bool) -> anyhow::Result<Orchestrator> {
    let (interrupt, progress) = if live {
        (InterruptSignal::from_ctrl_c(), progress_printer())
    } else {
        (InterruptSignal::manual().0, ProgressSink::none())
    };
    Ok(Orchestrator::from_config(cfg, &runners(cfg), interrupt, progress)?)
}

fn progress_printer() -> ProgressSink {
    ProgressSink::new(Arc::new(|ev: &ProgressEvent| {
        let position = format!("[{}/{}]", ev.step_index + 1, ev.total_steps);
        match ev.kind {
            ProgressKind::Start => eprintln!("{position} {} ...", ev.step_name),
            ProgressKind::Complete => {
                let secs = Duration::from_millis(ev.duration_ms.unwrap_or_default()).as_secs_f64();
                eprintln!("{position} {} done ({secs:.1}s)", ev.step_name);
            }
        }
    }))
}

async fn cmd_start(args: StartArgs) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg().await?;
    let req = StartRequest {
        repo: std::env::current_dir().context("read current directory")?,
        template: args.template,
        description: args.description.join(" "),
        workspace: args.workspace,
        base: args.base,
        target: args.target,
        use_local: args.use_local,
        agent: args.agent,
        model: args.model,
    };
    let cancel = CancellationToken::new();

    if args.dry_run {
        let orch = orchestrator(&cfg, false)?;
        let report = orch.dry_run(&cancel, &req)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_dry_run(&report);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let orch = orchestrator(&cfg, !args.json)?;
    let task = orch.start(&cancel, &req).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(ExitCode::from(outcome_code(task.status)));
    }
    Ok(report_outcome(&task))
}

fn outcome_code(status: TaskStatus) -> u8 {
    if status == TaskStatus::Completed {
        exit_codes::OK
    } else if status.is_resumable() {
        exit_codes::PAUSED
    } else {
        exit_codes::FAILURE
    }
}

fn report_outcome(task: &Task) -> ExitCode {
    println!("Task {} in workspace {}: {}", task.id, task.workspace, task.status);
    match task.status {
        TaskStatus::AwaitingApproval => {
            println!("Waiting for approval at step '{}'.", task.current_step_name());
            println!("  tasksmith approve {}", task.workspace);
            println!("  tasksmith reject {} --reason <why>", task.workspace);
        }
        status if status.is_resumable() => {
            println!("Stopped at step '{}'.", task.current_step_name());
            if let Some(err) = task.last_error.as_deref() {
                println!("{err}");
            }
            println!("Resume with: {}", resume_command(&task.workspace));
        }
        _ => {}
    }
    ExitCode::from(outcome_code(task.status))
}

fn print_dry_run(report: &DryRunReport) {
    println!("Dry run: template '{}'", report.template);
    println!(
        "Workspace: {} (branch {}, {})",
        report.workspace.name,
        report.workspace.branch,
        if report.workspace.would_create { "would be created" } else { "exists" }
    );
    println!();
    for step in &report.steps {
        let optional = if step.required { "" } else { " (optional)" };
        println!("{:>2}. {} [{}]{optional}", step.index + 1, step.name, step.step_type);
        for line in &step.would_do {
            println!("      - {line}");
        }
    }
    println!("\nSide effects prevented:");
    for effect in &report.summary.side_effects_prevented {
        println!("  - {effect}");
    }
}

fn cmd_workspace(args: WorkspaceArgs, cfg: &Config) -> anyhow::Result<ExitCode> {
    let orch = orchestrator(cfg, false)?;
    let manager = orch.workspaces();
    match args.cmd {
        WorkspaceCmd::List(list) => {
            let workspaces = manager.list()?;
            if list.json {
                println!("{}", serde_json::to_string_pretty(&workspaces)?);
                return Ok(ExitCode::SUCCESS);
            }
            let mut table = Table::new(["NAME", "STATUS", "BRANCH", "TASKS", "WORKTREE"]);
            for ws in &workspaces {
                table.row([
                    ws.name.clone(),
                    ws.status.to_string(),
                    ws.branch.clone(),
                    ws.tasks.len().to_string(),
                    config::tilde_path(&ws.worktree_path.to_string_lossy()),
                ]);
            }
            if list.csv {
                table.print_csv()?;
            } else if table.is_empty() {
                println!("No workspaces.");
            } else {
                table.print()?;
            }
        }
        WorkspaceCmd::Show(show) => {
            let ws = manager.get(&show.name)?;
            let tasks = orch.engine().tasks().list(&ws.name)?;
            if show.json {
                let out = serde_json::json!({ "workspace": ws, "tasks": tasks });
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(ExitCode::SUCCESS);
            }
            println!("Workspace: {}", ws.name);
            println!("Status: {}", ws.status);
            println!("Branch: {}", ws.branch);
            println!("Repository: {}", ws.repository.display());
            println!("Worktree: {}", ws.worktree_path.display());
            println!("Created: {}", ws.created_at);
            if !tasks.is_empty() {
                println!();
                let mut table = Table::new(["TASK", "TEMPLATE", "STATUS", "STEP", "CREATED"]);
                for task in &tasks {
                    table.row([
                        task.id.clone(),
                        task.template_id.clone(),
                        task.status.to_string(),
                        format!(
                            "{}/{} {}",
                            (task.current_step + 1).min(task.total_steps()),
                            task.total_steps(),
                            task.current_step_name()
                        ),
                        task.created_at.clone(),
                    ]);
                }
                table.print()?;
            }
        }
        WorkspaceCmd::Close(target) => {
            let ws = manager.close(&target.name)?;
            println!("Closed workspace {} (worktree removed, history kept).", ws.name);
        }
        WorkspaceCmd::Destroy(target) => {
            manager.destroy(&target.name)?;
            println!("Destroyed workspace {}.", target.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_templates(args: &TemplatesArgs, cfg: &Config) -> anyhow::Result<ExitCode> {
    let orch = orchestrator(cfg, false)?;
    let templates: Vec<_> = orch.templates().list().collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(ExitCode::SUCCESS);
    }
    let mut table = Table::new(["ID", "STEPS", "DESCRIPTION"]);
    for t in templates {
        let steps: Vec<&str> = t.steps.iter().map(|s| s.name.as_str()).collect();
        table.row([t.id.clone(), steps.join(","), t.description.clone()]);
    }
    table.print()?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => {
            print!("{}", config::list_resolved_toml()?);
        }
        ConfigCmd::Set(set) => {
            config::set_value_string(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'tasksmith config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> ExitCode {
    println!("tasksmith version {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("TASKSMITH_GIT_COMMIT") {
        println!("  commit: {commit}");
    }
    println!("  rust: {}", rustc_version_runtime::version());
    println!("  os/arch: {}/{}", std::env::consts::OS, std::env::consts::ARCH);
    ExitCode::SUCCESS
}

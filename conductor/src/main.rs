//! `conductor` command-line interface.
//!
//! Every subcommand operates on the project at `--root` (default: the current
//! directory). Structured results are printed to stdout as JSON; diagnostics
//! go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use conductor::autorun::{RunOptions, TaskRunner, reset_orphans};
use conductor::core::conflict::Resolution;
use conductor::core::policy::{Decision, Operation};
use conductor::core::safety::SafetyOperation;
use conductor::core::types::{Initiator, OrderingStrategy, Priority, Task};
use conductor::error::OrchestratorError;
use conductor::exit_codes;
use conductor::io::config::{ConductorConfig, load_config};
use conductor::io::init::{ConductorPaths, InitOptions, init_project};
use conductor::io::policy_store::load_policy;
use conductor::io::provider::build_provider;
use conductor::io::task_store::{FileTaskStore, TaskStore};
use conductor::logging;
use conductor::orchestrator::{BranchOrchestrator, CreateBranchOptions, MergeOutcome};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Delegate tasks to an AI agent on isolated, reviewable branches"
)]
struct Cli {
    /// Project root (must be a git working tree).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with default config, policy and task store.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run eligible tasks until none remain or a stop condition is met.
    Run {
        #[arg(long, value_enum, default_value_t = StrategyArg::Fifo)]
        strategy: StrategyArg,
        #[arg(long)]
        max_tasks: Option<usize>,
        #[arg(long)]
        max_failures: Option<usize>,
        /// Leave completed task branches unmerged.
        #[arg(long)]
        no_merge: bool,
    },
    /// Evaluate an operation against the project policy.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Task branch lifecycle.
    Branch {
        #[command(subcommand)]
        command: BranchCommand,
    },
    /// Merges and conflict handling.
    Merge {
        #[command(subcommand)]
        command: MergeCommand,
    },
    /// Report whether a branch operation is safe right now.
    SafetyCheck {
        #[command(subcommand)]
        operation: SafetyCommand,
    },
    /// Task store maintenance.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Exit 0 when allowed, 2 when denied, 3 when confirmation is required.
    Check {
        #[arg(long, value_enum)]
        kind: OperationArg,
        target: String,
    },
}

#[derive(Subcommand)]
enum BranchCommand {
    Create {
        task_id: String,
        /// Reset an existing branch with the same name.
        #[arg(long)]
        force: bool,
    },
    Checkout {
        task_id: String,
    },
    Detach {
        task_id: String,
    },
    Commit {
        task_id: String,
        #[arg(short, long)]
        message: String,
    },
}

#[derive(Subcommand)]
enum MergeCommand {
    /// Merge a task branch into the review branch.
    Review { task_id: String },
    /// Merge a task branch directly into main.
    Main { task_id: String },
    /// Merge the review branch into main.
    ReviewToMain,
    /// Settle one conflicting file.
    Resolve {
        file: String,
        #[arg(long, conflicts_with_all = ["theirs", "content_file"])]
        ours: bool,
        #[arg(long, conflicts_with = "content_file")]
        theirs: bool,
        /// Use the contents of this file as the resolution.
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
    /// Keep the target branch's version of a conflicting file.
    Skip { file: String },
    Finalize,
    Abort,
}

#[derive(Subcommand)]
enum SafetyCommand {
    Checkout { branch: String },
    Merge { source: String, target: String },
    Detach,
    AbortMerge,
}

#[derive(Subcommand)]
enum TasksCommand {
    /// Print all tasks as JSON.
    List,
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
        #[arg(long = "criterion")]
        acceptance_criteria: Vec<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// The task does not modify the working tree.
        #[arg(long)]
        no_code_changes: bool,
    },
    /// Move tasks left in `doing` back to `todo`.
    ResetOrphans,
    /// Mark a question or blocker comment as answered.
    ResolveComment { task_id: String, comment_id: u64 },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Fifo,
    Priority,
    Dependency,
}

impl From<StrategyArg> for OrderingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Fifo => OrderingStrategy::Fifo,
            StrategyArg::Priority => OrderingStrategy::Priority,
            StrategyArg::Dependency => OrderingStrategy::Dependency,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OperationArg {
    Read,
    Write,
    Command,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => {
            let paths = init_project(&root, &InitOptions { force })?;
            println!("initialized {}", paths.conductor_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            strategy,
            max_tasks,
            max_failures,
            no_merge,
        } => cmd_run(
            &root,
            RunOptions {
                strategy: strategy.into(),
                max_tasks,
                max_failures,
                merge_to_review: !no_merge,
            },
        ),
        Command::Policy {
            command: PolicyCommand::Check { kind, target },
        } => cmd_policy_check(&root, kind, target),
        Command::Branch { command } => cmd_branch(&root, command),
        Command::Merge { command } => cmd_merge(&root, command),
        Command::SafetyCheck { operation } => cmd_safety_check(&root, operation),
        Command::Tasks { command } => cmd_tasks(&root, command),
    }
}

struct Project {
    paths: ConductorPaths,
    config: ConductorConfig,
    store: Arc<dyn TaskStore>,
}

fn open_project(root: &Path) -> Result<Project> {
    let paths = ConductorPaths::new(root);
    if !paths.conductor_dir.is_dir() {
        return Err(anyhow!(
            "{} is not initialized (run `conductor init`)",
            root.display()
        ));
    }
    let config = load_config(&paths.config_path)?;
    let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(&paths.tasks_path));
    Ok(Project {
        paths,
        config,
        store,
    })
}

fn orchestrator(project: &Project) -> BranchOrchestrator {
    BranchOrchestrator::new(
        project.paths.clone(),
        project.config.clone(),
        Arc::clone(&project.store),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

/// Print a successful result, or turn a safety refusal into `UNSAFE`.
fn report<T: Serialize>(result: Result<T, OrchestratorError>) -> Result<i32> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(exit_codes::OK)
        }
        Err(OrchestratorError::Unsafe(safety)) => {
            print_json(&safety)?;
            eprintln!("blocked: {}", safety.blockers.join("; "));
            Ok(exit_codes::UNSAFE)
        }
        Err(err) => Err(err.into()),
    }
}

fn report_merge(result: Result<MergeOutcome, OrchestratorError>) -> Result<i32> {
    match result {
        Ok(outcome) if outcome.had_conflicts => {
            print_json(&outcome)?;
            eprintln!(
                "merge stopped on {} conflict(s); resolve or skip each file, then `conductor merge finalize`",
                outcome.conflicts.len()
            );
            Ok(exit_codes::CONFLICTS)
        }
        other => report(other),
    }
}

fn cmd_run(root: &Path, options: RunOptions) -> Result<i32> {
    let project = open_project(root)?;
    let provider = build_provider(&project.config.provider, &project.paths.root);
    let runner = TaskRunner::new(
        project.paths.clone(),
        project.config.clone(),
        Arc::clone(&project.store),
        Arc::from(provider),
    );
    let summary = runner.start(options)?;
    print_json(&summary)?;
    Ok(exit_codes::OK)
}

fn cmd_policy_check(root: &Path, kind: OperationArg, target: String) -> Result<i32> {
    let paths = ConductorPaths::new(root);
    let policy = load_policy(&paths.policy_path)?;
    let operation = match kind {
        OperationArg::Read => Operation::read(target),
        OperationArg::Write => Operation::write(target),
        OperationArg::Command => Operation::command(target),
    };
    let decision = policy.evaluate(&operation);
    print_json(&decision)?;
    Ok(match decision {
        Decision::Allow => exit_codes::OK,
        Decision::Deny(_) => exit_codes::DENIED,
        Decision::RequireConfirmation { .. } => exit_codes::NEEDS_CONFIRMATION,
    })
}

fn cmd_branch(root: &Path, command: BranchCommand) -> Result<i32> {
    let project = open_project(root)?;
    let orch = orchestrator(&project);
    match command {
        BranchCommand::Create { task_id, force } => report(orch.create_task_branch(
            &task_id,
            CreateBranchOptions {
                force,
                initiator: Initiator::Operator,
            },
        )),
        BranchCommand::Checkout { task_id } => {
            report(orch.checkout_task_branch(&task_id, Initiator::Operator))
        }
        BranchCommand::Detach { task_id } => {
            report(orch.detach_branch_from_task(&task_id, Initiator::Operator))
        }
        BranchCommand::Commit { task_id, message } => {
            report(orch.commit_task_changes(&task_id, &message, Initiator::Operator))
        }
    }
}

fn cmd_merge(root: &Path, command: MergeCommand) -> Result<i32> {
    let project = open_project(root)?;
    let orch = orchestrator(&project);
    match command {
        MergeCommand::Review { task_id } => {
            report_merge(orch.merge_task_to_review(&task_id, Initiator::Operator))
        }
        MergeCommand::Main { task_id } => {
            report_merge(orch.merge_task_to_main(&task_id, Initiator::Operator))
        }
        MergeCommand::ReviewToMain => report_merge(orch.merge_review_to_main(Initiator::Operator)),
        MergeCommand::Resolve {
            file,
            ours,
            theirs,
            content_file,
        } => {
            let resolution = match (ours, theirs, content_file) {
                (true, _, _) => Resolution::Ours,
                (_, true, _) => Resolution::Theirs,
                (_, _, Some(path)) => Resolution::Content(
                    fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?,
                ),
                _ => return Err(anyhow!("pass one of --ours, --theirs or --content-file")),
            };
            report(orch.resolve_conflict(&file, resolution))
        }
        MergeCommand::Skip { file } => report(orch.skip_conflict(&file)),
        MergeCommand::Finalize => report_merge(orch.finalize_merge(Initiator::Operator)),
        MergeCommand::Abort => report(orch.abort_merge(Initiator::Operator)),
    }
}

fn cmd_safety_check(root: &Path, command: SafetyCommand) -> Result<i32> {
    let project = open_project(root)?;
    let operation = match command {
        SafetyCommand::Checkout { branch } => SafetyOperation::Checkout { branch },
        SafetyCommand::Merge { source, target } => SafetyOperation::Merge { source, target },
        SafetyCommand::Detach => SafetyOperation::Detach,
        SafetyCommand::AbortMerge => SafetyOperation::AbortMerge,
    };
    let safety = orchestrator(&project).run_safety_check(&operation)?;
    print_json(&safety)?;
    Ok(if safety.safe {
        exit_codes::OK
    } else {
        exit_codes::UNSAFE
    })
}

fn cmd_tasks(root: &Path, command: TasksCommand) -> Result<i32> {
    let project = open_project(root)?;
    let store = project.store.as_ref();
    match command {
        TasksCommand::List => print_json(&store.list_tasks()?)?,
        TasksCommand::Add {
            id,
            title,
            description,
            priority,
            acceptance_criteria,
            depends_on,
            no_code_changes,
        } => {
            let task = Task {
                description,
                priority: priority.into(),
                acceptance_criteria,
                depends_on,
                code_changes: !no_code_changes,
                ..Task::new(id, title)
            };
            store.insert_task(task.clone())?;
            print_json(&task)?;
        }
        TasksCommand::ResetOrphans => print_json(&reset_orphans(store)?)?,
        TasksCommand::ResolveComment {
            task_id,
            comment_id,
        } => store.resolve_comment(&task_id, comment_id)?,
    }
    Ok(exit_codes::OK)
}

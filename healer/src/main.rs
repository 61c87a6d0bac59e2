//! Self-healing code generation CLI.
//!
//! `healer run` drives one task file through the repair loop, `healer bench`
//! drives a directory of them, `healer validate` exercises structured output
//! recovery on a saved model response.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use healer::bench::{run_bench, write_summary};
use healer::core::recovery::{SchemaKind, validate};
use healer::core::types::{FinalOutcome, Language};
use healer::exit_codes;
use healer::io::config::{DEFAULT_CONFIG_FILE, HealerConfig, load_config, write_config};
use healer::io::iteration_log::write_report;
use healer::io::model::{CommandModel, FixtureModel, Model};
use healer::io::task::{discover_tasks, load_task};
use healer::logging;
use healer::progress::{ProgressChannel, ProgressEvent};
use healer::repair_loop::{RepairLoop, RunReport};

#[derive(Parser)]
#[command(
    name = "healer",
    version,
    about = "Generate code, attack it with tests, repair it until it passes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the repair loop on one task file.
    Run {
        #[arg(long)]
        task: PathBuf,
        #[command(flatten)]
        common: LoopArgs,
        /// Write the per-iteration audit trail under this directory.
        #[arg(long)]
        audit_dir: Option<PathBuf>,
        /// Print the full run report as JSON instead of a summary line.
        #[arg(long)]
        json: bool,
    },
    /// Run every task file in a directory and write a summary.
    Bench {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, default_value = "bench_results.json")]
        out: PathBuf,
        #[command(flatten)]
        common: LoopArgs,
        #[arg(long)]
        audit_dir: Option<PathBuf>,
    },
    /// Recover a structured record from a model response (FILE or stdin).
    Validate {
        #[arg(long, value_enum)]
        schema: SchemaArg,
        file: Option<PathBuf>,
    },
    /// Write a default `healer.toml`.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct LoopArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Use built-in fixture responses instead of the configured model command.
    #[arg(long)]
    mock: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemaArg {
    Generation,
    Tests,
    Diagnosis,
    Summary,
}

impl From<SchemaArg> for SchemaKind {
    fn from(arg: SchemaArg) -> Self {
        match arg {
            SchemaArg::Generation => SchemaKind::Generation,
            SchemaArg::Tests => SchemaKind::Tests,
            SchemaArg::Diagnosis => SchemaKind::Diagnosis,
            SchemaArg::Summary => SchemaKind::Summary,
        }
    }
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            common,
            audit_dir,
            json,
        } => cmd_run(&task, &common, audit_dir.as_deref(), json),
        Command::Bench {
            tasks,
            out,
            common,
            audit_dir,
        } => cmd_bench(&tasks, &out, &common, audit_dir.as_deref()),
        Command::Validate { schema, file } => cmd_validate(schema.into(), file.as_deref()),
        Command::InitConfig { path, force } => cmd_init_config(&path, force),
    }
}

fn cmd_run(task_path: &Path, args: &LoopArgs, audit_dir: Option<&Path>, json: bool) -> Result<i32> {
    let config = load_config(&args.config)?;
    let task = load_task(task_path, config.sandbox.language)?;
    let max_iterations = args.max_iterations.unwrap_or(config.max_iterations);
    let cancel = install_interrupt_handler();
    let model = build_model(&config, args.mock, task.language, &cancel);

    let progress = ProgressChannel::default();
    let printer = spawn_progress_printer(&progress);
    let report = {
        let repair = RepairLoop::new(model.as_ref(), config)
            .with_progress(progress)
            .with_cancel(cancel);
        repair.run_task(&task, max_iterations)?
    };
    let _ = printer.join();

    if let Some(dir) = audit_dir {
        let paths = write_report(dir, &report)?;
        eprintln!("audit trail: {}", paths.dir.display());
    }
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print_summary(&report);
    }

    Ok(match report.outcome {
        FinalOutcome::Success => exit_codes::OK,
        FinalOutcome::ExhaustedFailure => exit_codes::EXHAUSTED,
        FinalOutcome::Cancelled => exit_codes::CANCELLED,
    })
}

fn cmd_bench(tasks_dir: &Path, out: &Path, args: &LoopArgs, audit_dir: Option<&Path>) -> Result<i32> {
    let config = load_config(&args.config)?;
    let tasks = discover_tasks(tasks_dir, config.sandbox.language)?;
    if tasks.is_empty() {
        bail!("no task files in {}", tasks_dir.display());
    }
    let max_iterations = args.max_iterations.unwrap_or(config.max_iterations);
    let cancel = install_interrupt_handler();
    // Fixtures follow the configured default language.
    let model = build_model(&config, args.mock, config.sandbox.language, &cancel);

    let progress = ProgressChannel::default();
    let printer = spawn_progress_printer(&progress);
    let mut audit_error = None;
    let summary = {
        let repair = RepairLoop::new(model.as_ref(), config)
            .with_progress(progress)
            .with_cancel(cancel);
        run_bench(&repair, &tasks, max_iterations, |report| {
            eprintln!(
                "{}: {:?} after {} iteration(s)",
                report.task_id,
                report.outcome,
                report.iterations.len()
            );
            if let Some(dir) = audit_dir
                && let Err(err) = write_report(dir, report)
                && audit_error.is_none()
            {
                audit_error = Some(err);
            }
        })
    };
    let _ = printer.join();
    if let Some(err) = audit_error {
        return Err(err.context("write audit trail"));
    }

    write_summary(out, &summary)?;
    println!(
        "{} tasks: {} first-pass, {} healed, {} failed (repair effectiveness {:.2}, avg iterations {:.2})",
        summary.total_tasks,
        summary.first_pass_success,
        summary.healed_success,
        summary.total_failures,
        summary.repair_effectiveness,
        summary.avg_iterations
    );
    println!("summary: {}", out.display());

    Ok(if summary.cancelled {
        exit_codes::CANCELLED
    } else if summary.total_failures > 0 {
        exit_codes::EXHAUSTED
    } else {
        exit_codes::OK
    })
}

fn cmd_validate(kind: SchemaKind, file: Option<&Path>) -> Result<i32> {
    let raw = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    match validate(&raw, kind.schema()) {
        Ok(validated) => {
            let out = json!({
                "kind": validated.kind,
                "record": validated.record,
                "salvaged": validated.salvaged,
                "absent": validated.absent,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&out).context("serialize record")?
            );
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if !force && path.exists() {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &HealerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn build_model(
    config: &HealerConfig,
    mock: bool,
    language: Language,
    cancel: &CancellationToken,
) -> Box<dyn Model> {
    if mock {
        Box::new(FixtureModel::new(language))
    } else {
        Box::new(CommandModel::new(config.model.clone()).with_cancel(cancel.clone()))
    }
}

/// Cancel the returned token on Ctrl-C.
fn install_interrupt_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!(err = %err, "interrupt handler unavailable");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupted, cancelling run");
                handle.cancel();
            }
        });
    });
    token
}

/// Print progress events to stderr until every sender is dropped.
fn spawn_progress_printer(progress: &ProgressChannel) -> thread::JoinHandle<()> {
    let mut rx = progress.subscribe();
    thread::spawn(move || {
        loop {
            match rx.blocking_recv() {
                Ok(event) => eprintln!("{}", progress_line(&event)),
                Err(RecvError::Lagged(skipped)) => eprintln!("... {skipped} progress events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn progress_line(event: &ProgressEvent) -> String {
    if event.payload.is_null() {
        format!("[{}] {} {}", event.iteration, event.state, event.message)
    } else {
        format!(
            "[{}] {} {} {}",
            event.iteration, event.state, event.message, event.payload
        )
    }
}

fn print_summary(report: &RunReport) {
    let verdict = match report.outcome {
        FinalOutcome::Success => "solved",
        FinalOutcome::ExhaustedFailure => "not solved",
        FinalOutcome::Cancelled => "cancelled",
    };
    println!(
        "{}: {verdict} after {} iteration(s) in {} ms",
        report.task_id,
        report.iterations.len(),
        report.duration_ms
    );
    for lesson in &report.lessons {
        println!("lesson: {lesson}");
    }
    if let Some(code) = &report.final_code {
        println!("--- final code ---\n{}", code.trim_end());
    }
}

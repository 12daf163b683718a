//! bridge CLI: run the work item router and queue new work.

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bridge_router::config::Config;
use bridge_router::engine::{CycleReport, Router};
use bridge_router::index::EntryStatus;
use bridge_router::submit::{SubmitRequest, submit, wait_for_result};
use bridge_router::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "bridge", about = "File bridge router for executor work items")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process every pending work item once
    RunOnce {
        /// Parallel workers (defaults to BRIDGE_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run processing cycles until interrupted
    Daemon {
        /// Seconds between cycles
        #[arg(long, default_value_t = 2)]
        interval: u64,
        /// Parallel workers (defaults to BRIDGE_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Queue a new work item
    Submit {
        /// Instruction text; read from --text-file or stdin when empty
        text: Vec<String>,
        /// Read the instruction text from a file
        #[arg(long)]
        text_file: Option<PathBuf>,
        /// Executor target
        #[arg(long, default_value = "gemini")]
        to: String,
        #[arg(long, default_value = "manual")]
        thread_id: String,
        /// Explicit task id (default: next per-thread counter)
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        assign: Option<String>,
        #[arg(long, default_value = "high")]
        priority: String,
        #[arg(long, default_value_t = 240)]
        timeout_s: u64,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long, default_value = "en")]
        response_lang: String,
        #[arg(long)]
        notes: Option<String>,
        /// Run processing cycles in-process right after queueing
        #[arg(long)]
        run_once: bool,
        /// Cycles for --run-once (0: two for a refining target, else one)
        #[arg(long, default_value_t = 0)]
        ticks: usize,
        /// Parallel workers for --run-once (defaults to BRIDGE_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Wait for the final result document and print it
        #[arg(long)]
        wait: bool,
        /// Seconds to wait for the final result
        #[arg(long, default_value_t = 180)]
        wait_timeout: u64,
    },
}

/// Options that follow a submission.
struct FollowUp {
    run_once: bool,
    ticks: usize,
    workers: usize,
    wait: Option<Duration>,
}

const EXIT_WAIT_TIMEOUT: u8 = 124;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;

    match cli.command {
        Command::RunOnce { workers } => {
            let workers = workers.unwrap_or(config.workers).max(1);
            cmd_run_once(&config, workers).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Daemon { interval, workers } => {
            let workers = workers.unwrap_or(config.workers).max(1);
            cmd_daemon(&config, Duration::from_secs(interval.max(1)), workers).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Submit {
            text,
            text_file,
            to,
            thread_id,
            task_id,
            assign,
            priority,
            timeout_s,
            max_retries,
            response_lang,
            notes,
            run_once,
            ticks,
            workers,
            wait,
            wait_timeout,
        } => {
            let text = read_instruction(text, text_file)?;
            let request = SubmitRequest {
                text,
                target: to,
                thread_id,
                task_id,
                assign,
                priority,
                timeout_s: timeout_s.max(1),
                max_retries: max_retries.max(1),
                response_lang,
                notes,
            };
            let follow_up = FollowUp {
                run_once,
                ticks,
                workers: workers.unwrap_or(config.workers).max(1),
                wait: wait.then(|| Duration::from_secs(wait_timeout.max(1))),
            };
            cmd_submit(&config, request, follow_up).await
        }
    }
}

fn print_report(report: &CycleReport) {
    if let Some(reason) = &report.blocked {
        println!("[gate] blocked: {reason}");
    }
    for outcome in &report.outcomes {
        println!("[work] {outcome}");
    }
}

async fn cmd_run_once(config: &Config, workers: usize) -> anyhow::Result<()> {
    let router = Router::from_config(config)?;
    let processed = match router.run_once(workers).await {
        Ok(report) => {
            print_report(&report);
            report.processed
        }
        Err(e) => {
            tracing::error!(error = %e, "cycle failed");
            0
        }
    };
    println!("[summary] processed={processed}");
    Ok(())
}

async fn cmd_daemon(config: &Config, interval: Duration, workers: usize) -> anyhow::Result<()> {
    let router = Router::from_config(config)?;
    let shutdown = Arc::new(Notify::new());

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.notify_one();
    });

    println!(
        "[daemon] started interval={}s workers={workers}",
        interval.as_secs()
    );
    router
        .run_daemon(interval, workers, shutdown, |report| {
            print_report(report);
            println!("[tick] processed={}", report.processed);
        })
        .await?;
    println!("[daemon] stopped");
    Ok(())
}

async fn cmd_submit(config: &Config, request: SubmitRequest, follow_up: FollowUp) -> anyhow::Result<ExitCode> {
    let router = Router::from_config(config)?;
    let submitted = submit(router.layout(), router.registry(), request).await?;
    println!("[submit] created={}", submitted.path.display());

    if follow_up.run_once {
        let ticks = match follow_up.ticks {
            0 => submitted.cycles,
            n => n,
        };
        for tick in 1..=ticks {
            match router.run_once(follow_up.workers).await {
                Ok(report) => print_report(&report),
                Err(e) => {
                    eprintln!("[run-once] failed tick={tick}/{ticks}: {e}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    let Some(timeout) = follow_up.wait else {
        return Ok(ExitCode::SUCCESS);
    };
    let found = wait_for_result(router.layout(), &submitted, timeout, Duration::from_secs(1)).await?;
    let Some(result) = found else {
        eprintln!("[result] timeout waiting for final result");
        return Ok(ExitCode::from(EXIT_WAIT_TIMEOUT));
    };
    println!(
        "[result] status={} actor={} path={}",
        result.label(),
        submitted.expected_actor,
        result.path.display()
    );
    println!("{}", tokio::fs::read_to_string(&result.path).await?);
    Ok(match result.status {
        EntryStatus::Done => ExitCode::SUCCESS,
        EntryStatus::Error => ExitCode::FAILURE,
    })
}

fn read_instruction(words: Vec<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    let mut text = words.join(" ").trim().to_string();
    if let Some(path) = file {
        text = std::fs::read_to_string(&path)?.trim().to_string();
    }
    if text.is_empty() && !std::io::stdin().is_terminal() {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        text = input.trim().to_string();
    }
    if text.is_empty() {
        anyhow::bail!("instruction text is empty");
    }
    Ok(text)
}

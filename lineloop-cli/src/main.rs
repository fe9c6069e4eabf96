mod cli;
mod health;
mod report;

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use lineloop_core::controller::LoopController;
use lineloop_core::shutdown::Shutdown;
use lineloop_core::telemetry::{Telemetry, atomic_write};
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let file_layer = log_file.and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(err) => {
                eprintln!("warning: cannot open log file {}: {err}", path.display());
                None
            }
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

fn install_signal_handlers(shutdown: &Shutdown) {
    let kinds = [
        ("SIGINT", SignalKind::interrupt()),
        ("SIGTERM", SignalKind::terminate()),
        ("SIGHUP", SignalKind::hangup()),
    ];
    for (name, kind) in kinds {
        match signal(kind) {
            Ok(mut stream) => {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        tracing::info!(signal = name, "shutdown requested");
                        shutdown.request();
                    }
                });
            }
            Err(err) => tracing::warn!(signal = name, "failed to install handler: {err}"),
        }
    }
}

async fn run() -> i32 {
    let args = cli::Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("error: cannot determine working directory: {err}");
            return 2;
        }
    };

    init_logging(args.verbose, args.log_file.as_ref());

    let config = args.to_config(cwd.clone());

    if args.health_check {
        let health = health::check(&config);
        health::print(&health, args.json);
        return if health.healthy() { 0 } else { 1 };
    }

    let project = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    // Default telemetry paths live under /tmp so watchers have a known spot.
    let mut status_file = args.status_file.clone();
    let mut history_file = args.history_file.clone();
    if status_file.is_none() || history_file.is_none() {
        let loop_dir = std::env::temp_dir().join(format!("line-loop-{project}"));
        if let Err(err) = std::fs::create_dir_all(&loop_dir) {
            tracing::warn!("failed to create {}: {err}", loop_dir.display());
        }
        status_file.get_or_insert_with(|| loop_dir.join("status.json"));
        history_file.get_or_insert_with(|| loop_dir.join("history.jsonl"));
    }

    if let Some(pid_file) = &args.pid_file {
        let pid = std::process::id().to_string();
        if let Err(err) = atomic_write(pid_file, &pid) {
            tracing::warn!("failed to write PID file: {err}");
        }
    }

    let shutdown = Shutdown::new();
    install_signal_handlers(&shutdown);

    let telemetry = Telemetry::new(status_file, history_file, project);
    let controller = LoopController::new(config, telemetry, shutdown);
    let run = controller.run().await;

    if args.json || args.output.is_some() {
        let rendered =
            serde_json::to_string_pretty(&report::build(&run)).unwrap_or_default();
        if args.json {
            println!("{rendered}");
        }
        if let Some(output) = &args.output {
            match std::fs::write(output, &rendered) {
                Ok(()) => {
                    if !args.json {
                        println!("\nReport written to: {}", output.display());
                    }
                }
                Err(err) => tracing::warn!("failed to write report: {err}"),
            }
        }
    }

    if let Some(pid_file) = &args.pid_file {
        if let Err(err) = std::fs::remove_file(pid_file) {
            tracing::debug!("failed to remove PID file: {err}");
        }
    }

    run.report.stop_reason.exit_code()
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

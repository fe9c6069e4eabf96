use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use lineloop_core::config::{EpicMode, IdleAction, LoopConfig, PhaseTimeouts};

/// Autonomous workflow loop: runs assistant phases until no tasks remain.
#[derive(Parser, Debug)]
#[command(name = "line-loop", version, about)]
pub struct Cli {
    /// Maximum iterations
    #[arg(short = 'n', long, default_value_t = 25)]
    pub max_iterations: u32,

    /// Output JSON instead of human-readable
    #[arg(long)]
    pub json: bool,

    /// Write the final report to a file
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Stop if a task is BLOCKED (default: continue)
    #[arg(long)]
    pub stop_on_blocked: bool,

    /// Stop on assistant crash or timeout (default: continue)
    #[arg(long)]
    pub stop_on_crash: bool,

    /// Max cook retries per task on NEEDS_CHANGES
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Check environment health and exit
    #[arg(long)]
    pub health_check: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Write logs to file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Write PID to file for external process management
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Write live status JSON (default: /tmp/line-loop-<project>/status.json)
    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Write history JSONL (default: /tmp/line-loop-<project>/history.jsonl)
    #[arg(long)]
    pub history_file: Option<PathBuf>,

    /// Focus on one epic (auto-select first available, or specify ID)
    #[arg(long, value_name = "EPIC_ID", num_args = 0..=1, default_missing_value = "auto")]
    pub epic: Option<String>,

    /// Pause the loop when an epic completes
    #[arg(long)]
    pub break_on_epic: bool,

    /// Skip git fetch/pull and tracker sync at loop start
    #[arg(long)]
    pub skip_initial_sync: bool,

    /// Cook phase timeout in seconds
    #[arg(long, default_value_t = 1200)]
    pub cook_timeout: u64,

    /// Serve phase timeout in seconds
    #[arg(long, default_value_t = 600)]
    pub serve_timeout: u64,

    /// Tidy phase timeout in seconds
    #[arg(long, default_value_t = 240)]
    pub tidy_timeout: u64,

    /// Plate phase timeout in seconds
    #[arg(long, default_value_t = 600)]
    pub plate_timeout: u64,

    /// Close-service phase timeout in seconds
    #[arg(long, default_value_t = 900)]
    pub close_service_timeout: u64,

    /// Skip a task after this many failures
    #[arg(long, default_value_t = 3)]
    pub max_task_failures: u32,

    /// Seconds without tool actions before idle triggers (0 disables)
    #[arg(long, default_value_t = 180)]
    pub idle_timeout: u64,

    /// Action when a phase goes idle
    #[arg(long, value_enum, default_value_t = IdleActionArg::Warn)]
    pub idle_action: IdleActionArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum IdleActionArg {
    Warn,
    Terminate,
}

impl From<IdleActionArg> for IdleAction {
    fn from(value: IdleActionArg) -> Self {
        match value {
            IdleActionArg::Warn => IdleAction::Warn,
            IdleActionArg::Terminate => IdleAction::Terminate,
        }
    }
}

impl Cli {
    pub fn to_config(&self, cwd: PathBuf) -> LoopConfig {
        LoopConfig {
            cwd,
            max_iterations: self.max_iterations,
            max_retries: self.max_retries,
            max_task_failures: self.max_task_failures,
            stop_on_blocked: self.stop_on_blocked,
            stop_on_crash: self.stop_on_crash,
            break_on_epic: self.break_on_epic,
            skip_initial_sync: self.skip_initial_sync,
            human_output: !self.json,
            epic_mode: match self.epic.as_deref() {
                None => EpicMode::Default,
                Some("auto") => EpicMode::Auto,
                Some(id) => EpicMode::Explicit(id.to_string()),
            },
            phase_timeouts: PhaseTimeouts {
                cook: Duration::from_secs(self.cook_timeout),
                serve: Duration::from_secs(self.serve_timeout),
                tidy: Duration::from_secs(self.tidy_timeout),
                plate: Duration::from_secs(self.plate_timeout),
                close_service: Duration::from_secs(self.close_service_timeout),
            },
            idle_timeout: Duration::from_secs(self.idle_timeout),
            idle_action: self.idle_action.into(),
            ..LoopConfig::default()
        }
    }
}

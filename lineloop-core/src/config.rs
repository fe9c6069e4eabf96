use std::path::PathBuf;
use std::time::Duration;

use crate::model::Phase;

// Output and display limits
pub const OUTPUT_SUMMARY_MAX_LENGTH: usize = 200;
pub const INPUT_SUMMARY_FILE_PATH_LENGTH: usize = 100;
pub const INPUT_SUMMARY_COMMAND_LENGTH: usize = 80;
pub const INPUT_SUMMARY_PATTERN_LENGTH: usize = 60;

// Task and iteration defaults
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;
pub const DEFAULT_MAX_TASK_FAILURES: u32 = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 180;

// Subprocess timeouts
pub const TRACKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRACKER_SHOW_TIMEOUT: Duration = Duration::from_secs(15);
pub const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const GIT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

// Retry and failure tracking
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
pub const CIRCUIT_BREAKER_WINDOW_SIZE: usize = 10;
pub const CIRCUIT_BREAKER_FAILURE_THRESHOLD: usize = 5;

// Long-running loop hygiene
pub const PERIODIC_SYNC_INTERVAL: u32 = 5;

// History and status tracking
pub const RECENT_ITERATIONS_LIMIT: usize = 10;
pub const RECENT_ITERATIONS_DISPLAY: usize = 5;
pub const CLOSED_TASKS_QUERY_LIMIT: usize = 10;

// Hierarchy traversal
pub const HIERARCHY_MAX_DEPTH: usize = 10;

/// Epic titles that are never auto-selected (parking lot pattern).
pub const EXCLUDED_EPIC_TITLES: &[&str] = &["Retrospective", "Backlog"];

/// What to do when a phase goes idle (no tool actions within the threshold).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdleAction {
    #[default]
    Warn,
    Terminate,
}

/// Epic-scope filter for task selection.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum EpicMode {
    /// All work; only parking-lot epics are excluded.
    #[default]
    Default,
    /// Lock onto the epic of the highest-priority ready work item.
    Auto,
    /// Work only the given epic's tasks.
    Explicit(String),
}

impl EpicMode {
    /// Label written into the status file (`epic_mode` field); None in
    /// default mode so the field is omitted.
    pub fn label(&self) -> Option<String> {
        match self {
            EpicMode::Default => None,
            EpicMode::Auto => Some("auto".to_string()),
            EpicMode::Explicit(id) => Some(id.clone()),
        }
    }
}

/// Per-phase assistant deadlines.
#[derive(Clone, Copy, Debug)]
pub struct PhaseTimeouts {
    pub cook: Duration,
    pub serve: Duration,
    pub tidy: Duration,
    pub plate: Duration,
    pub close_service: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            cook: Duration::from_secs(1200),
            serve: Duration::from_secs(600),
            tidy: Duration::from_secs(240),
            plate: Duration::from_secs(600),
            close_service: Duration::from_secs(900),
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Cook => self.cook,
            Phase::Serve => self.serve,
            Phase::Tidy => self.tidy,
            Phase::Plate => self.plate,
            Phase::CloseService => self.close_service,
        }
    }
}

/// Immutable configuration for one loop run, built by the CLI and passed by
/// reference everywhere; no module-level state.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub cwd: PathBuf,
    pub max_iterations: u32,
    pub max_retries: u32,
    pub max_task_failures: u32,
    pub stop_on_blocked: bool,
    pub stop_on_crash: bool,
    pub break_on_epic: bool,
    pub skip_initial_sync: bool,
    /// Human-readable progress on stdout; false in `--json` mode.
    pub human_output: bool,
    pub epic_mode: EpicMode,
    pub phase_timeouts: PhaseTimeouts,
    /// Zero disables idle detection.
    pub idle_timeout: Duration,
    pub idle_action: IdleAction,
    pub failure_threshold: usize,
    pub periodic_sync_interval: u32,
    /// Binary names/paths; overridable so tests can substitute shims.
    pub assistant_bin: PathBuf,
    pub tracker_bin: PathBuf,
    pub git_bin: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_task_failures: DEFAULT_MAX_TASK_FAILURES,
            stop_on_blocked: false,
            stop_on_crash: false,
            break_on_epic: false,
            skip_initial_sync: false,
            human_output: true,
            epic_mode: EpicMode::Default,
            phase_timeouts: PhaseTimeouts::default(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            idle_action: IdleAction::Warn,
            failure_threshold: CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            periodic_sync_interval: PERIODIC_SYNC_INTERVAL,
            assistant_bin: PathBuf::from("claude"),
            tracker_bin: PathBuf::from("bd"),
            git_bin: PathBuf::from("git"),
        }
    }
}

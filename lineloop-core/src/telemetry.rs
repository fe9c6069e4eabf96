//! Status snapshots and the append-only history journal. Every write here is
//! best effort: telemetry failures are warnings and never stop the loop.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::config::RECENT_ITERATIONS_DISPLAY;
use crate::error::LoopError;
use crate::model::{
    Escalation, IterationResult, Phase, ServeVerdict, SkippedTask, StopReason,
};

const PROGRESS_WRITE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Write-temp-then-rename so readers only ever see a complete file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), LoopError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match parent {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new(),
    }
    .map_err(|e| LoopError::io("atomic write (create temp)", path, e))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| LoopError::io("atomic write (write temp)", path, e))?;
    tmp.persist(path)
        .map_err(|e| LoopError::io("atomic write (rename)", path, e.error))?;
    Ok(())
}

/// Everything the status file needs for one write.
pub struct StatusReport<'a> {
    pub running: bool,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_task: Option<&'a str>,
    pub current_task_title: Option<&'a str>,
    pub last_verdict: Option<ServeVerdict>,
    pub tasks_completed: u32,
    pub tasks_remaining: usize,
    pub started_at: DateTime<Utc>,
    pub stop_reason: Option<StopReason>,
    pub recent_iterations: Vec<Value>,
    pub current_phase: Option<Phase>,
    pub phase_start_time: Option<DateTime<Utc>>,
    pub current_action_count: usize,
    pub last_action_time: Option<DateTime<Utc>>,
    pub skipped_tasks: Vec<SkippedTask>,
    pub escalation: Option<&'a Escalation>,
    pub epic_mode: Option<String>,
    pub current_epic: Option<&'a str>,
}

impl<'a> StatusReport<'a> {
    pub fn new(
        running: bool,
        iteration: u32,
        max_iterations: u32,
        tasks_completed: u32,
        tasks_remaining: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            running,
            iteration,
            max_iterations,
            current_task: None,
            current_task_title: None,
            last_verdict: None,
            tasks_completed,
            tasks_remaining,
            started_at,
            stop_reason: None,
            recent_iterations: Vec::new(),
            current_phase: None,
            phase_start_time: None,
            current_action_count: 0,
            last_action_time: None,
            skipped_tasks: Vec::new(),
            escalation: None,
            epic_mode: None,
            current_epic: None,
        }
    }
}

/// Serialize a completed iteration for the status file's
/// `recent_iterations` array.
pub fn iteration_for_status(result: &IterationResult) -> Value {
    json!({
        "iteration": result.iteration,
        "task_id": result.task_id,
        "task_title": result.task_title,
        "outcome": result.outcome.as_str(),
        "serve_verdict": result.serve_verdict.map(ServeVerdict::as_str),
        "commit_hash": result.commit_hash,
        "duration_seconds": result.duration_seconds,
        "intent": result.intent,
        "before_state": result.before_state,
        "after_state": result.after_state,
        "completed_at": Utc::now(),
        "action_count": result.total_actions(),
        "action_types": result.action_counts(),
        "findings_count": result.findings_count(),
    })
}

/// Last few completed iterations, serialized for the status file.
pub fn recent_iterations(iterations: &[IterationResult]) -> Vec<Value> {
    let completed: Vec<&IterationResult> =
        iterations.iter().filter(|i| i.success()).collect();
    completed
        .iter()
        .rev()
        .take(RECENT_ITERATIONS_DISPLAY)
        .rev()
        .map(|i| iteration_for_status(i))
        .collect()
}

/// Full iteration record for the history journal.
pub fn full_iteration_record(result: &IterationResult) -> Value {
    let mut record = json!({
        "iteration": result.iteration,
        "task_id": result.task_id,
        "task_title": result.task_title,
        "outcome": result.outcome.as_str(),
        "serve_verdict": result.serve_verdict.map(ServeVerdict::as_str),
        "commit_hash": result.commit_hash,
        "duration_seconds": result.duration_seconds,
        "success": result.success(),
        "intent": result.intent,
        "before_state": result.before_state,
        "after_state": result.after_state,
        "beads_before": {
            "ready": result.before_ready,
            "in_progress": result.before_in_progress,
        },
        "beads_after": {
            "ready": result.after_ready,
            "in_progress": result.after_in_progress,
        },
        "action_count": result.total_actions(),
        "action_types": result.action_counts(),
        "findings_count": result.findings_count(),
        "actions": result.actions,
    });
    if let Some(delta) = &result.delta {
        let beads = |items: &[crate::model::Bead]| -> Vec<Value> {
            items
                .iter()
                .map(|b| json!({"id": b.id, "title": b.title, "type": b.issue_type}))
                .collect()
        };
        record["delta"] = json!({
            "newly_closed": beads(&delta.newly_closed),
            "newly_filed": beads(&delta.newly_filed),
        });
    }
    record
}

#[derive(Clone, Debug)]
pub struct Telemetry {
    status_file: Option<PathBuf>,
    history_file: Option<PathBuf>,
    project: String,
}

impl Telemetry {
    pub fn new(
        status_file: Option<PathBuf>,
        history_file: Option<PathBuf>,
        project: String,
    ) -> Self {
        Self {
            status_file,
            history_file,
            project,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, String::new())
    }

    pub fn has_status_file(&self) -> bool {
        self.status_file.is_some()
    }

    /// Atomic status snapshot; optional fields are omitted when unset so
    /// watchers see a stable minimal schema.
    pub fn write_status(&self, report: &StatusReport<'_>) {
        let Some(path) = &self.status_file else {
            return;
        };
        let mut status = json!({
            "running": report.running,
            "iteration": report.iteration,
            "max_iterations": report.max_iterations,
            "current_task": report.current_task,
            "current_task_title": report.current_task_title,
            "last_verdict": report.last_verdict.map(ServeVerdict::as_str),
            "tasks_completed": report.tasks_completed,
            "tasks_remaining": report.tasks_remaining,
            "started_at": report.started_at,
            "last_update": Utc::now(),
            "recent_iterations": report.recent_iterations,
        });
        if let Some(reason) = report.stop_reason {
            status["stop_reason"] = json!(reason.as_str());
        }
        if let Some(mode) = &report.epic_mode {
            status["epic_mode"] = json!(mode);
        }
        if let Some(epic) = report.current_epic {
            status["current_epic"] = json!(epic);
        }
        if let Some(phase) = report.current_phase {
            status["current_phase"] = json!(phase.as_str());
        }
        if let Some(start) = report.phase_start_time {
            status["phase_start_time"] = json!(start);
        }
        if report.current_action_count > 0 {
            status["current_action_count"] = json!(report.current_action_count);
        }
        if let Some(last) = report.last_action_time {
            status["last_action_time"] = json!(last);
        }
        if !report.skipped_tasks.is_empty() {
            status["skipped_tasks"] = json!(report.skipped_tasks);
        }
        if let Some(escalation) = report.escalation {
            status["escalation"] = json!(escalation);
        }

        let rendered = serde_json::to_string_pretty(&status).unwrap_or_default();
        if let Err(err) = atomic_write(path, &rendered) {
            tracing::warn!("failed to write status file: {err}");
        }
    }

    /// Patch `epic_completions` into the existing status file.
    pub fn record_epic_completions(&self, completions: &[Value]) {
        let Some(path) = &self.status_file else {
            return;
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(mut status) = serde_json::from_str::<Value>(&text) else {
            return;
        };
        status["epic_completions"] = json!(completions);
        let rendered = serde_json::to_string_pretty(&status).unwrap_or_default();
        if let Err(err) = atomic_write(path, &rendered) {
            tracing::debug!("failed to update status with epic completions: {err}");
        }
    }

    fn append_history(&self, record: &Value) {
        let Some(path) = &self.history_file else {
            return;
        };
        let line = format!("{record}\n");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(err) = result {
            tracing::warn!("failed to append to history file: {}", LoopError::io("history append", path, err));
        }
    }

    /// One full JSONL record per iteration.
    pub fn append_iteration(&self, result: &IterationResult) {
        let mut record = full_iteration_record(result);
        record["project"] = json!(self.project);
        record["recorded_at"] = json!(Utc::now());
        self.append_history(&record);
    }

    /// Terminal `loop_summary` record marking the end of a run.
    pub fn write_summary(
        &self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        iteration_count: usize,
        total_actions: usize,
        stop_reason: StopReason,
    ) {
        let record = json!({
            "type": "loop_summary",
            "project": self.project,
            "started_at": started_at,
            "ended_at": ended_at,
            "iteration_count": iteration_count,
            "total_actions": total_actions,
            "stop_reason": stop_reason.as_str(),
        });
        self.append_history(&record);
    }
}

/// Intra-iteration progress, written through the status file while a phase
/// streams. Writes are throttled to one per five seconds; starting a phase
/// writes immediately.
pub struct ProgressState {
    telemetry: Telemetry,
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_task: Option<String>,
    pub current_task_title: Option<String>,
    pub tasks_completed: u32,
    pub tasks_remaining: usize,
    pub started_at: DateTime<Utc>,
    recent: Vec<Value>,
    current_phase: Option<Phase>,
    phase_start_time: Option<DateTime<Utc>>,
    current_action_count: usize,
    last_action_time: Option<DateTime<Utc>>,
    last_write: Option<Instant>,
}

impl ProgressState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        telemetry: Telemetry,
        iteration: u32,
        max_iterations: u32,
        current_task: Option<String>,
        current_task_title: Option<String>,
        tasks_completed: u32,
        tasks_remaining: usize,
        started_at: DateTime<Utc>,
        recent: Vec<Value>,
    ) -> Self {
        Self {
            telemetry,
            iteration,
            max_iterations,
            current_task,
            current_task_title,
            tasks_completed,
            tasks_remaining,
            started_at,
            recent,
            current_phase: None,
            phase_start_time: None,
            current_action_count: 0,
            last_action_time: None,
            last_write: None,
        }
    }

    pub fn start_phase(&mut self, phase: Phase) {
        self.current_phase = Some(phase);
        self.phase_start_time = Some(Utc::now());
        self.current_action_count = 0;
        self.write();
        self.last_write = Some(Instant::now());
    }

    pub fn update_progress(&mut self, action_count: usize, last_action: DateTime<Utc>) {
        self.current_action_count = action_count;
        self.last_action_time = Some(last_action);
        let due = self
            .last_write
            .map(|w| w.elapsed() >= PROGRESS_WRITE_INTERVAL)
            .unwrap_or(true);
        if due {
            self.write();
            self.last_write = Some(Instant::now());
        }
    }

    fn write(&self) {
        let mut report = StatusReport::new(
            true,
            self.iteration,
            self.max_iterations,
            self.tasks_completed,
            self.tasks_remaining,
            self.started_at,
        );
        report.current_task = self.current_task.as_deref();
        report.current_task_title = self.current_task_title.as_deref();
        report.recent_iterations = self.recent.clone();
        report.current_phase = self.current_phase;
        report.phase_start_time = self.phase_start_time;
        report.current_action_count = self.current_action_count;
        report.last_action_time = self.last_action_time;
        self.telemetry.write_status(&report);
    }
}

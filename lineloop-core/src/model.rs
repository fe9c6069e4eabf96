use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CIRCUIT_BREAKER_WINDOW_SIZE, DEFAULT_MAX_TASK_FAILURES};

/// One step of the workflow, each a separate assistant invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Cook,
    Serve,
    Tidy,
    Plate,
    CloseService,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Cook => "cook",
            Phase::Serve => "serve",
            Phase::Tidy => "tidy",
            Phase::Plate => "plate",
            Phase::CloseService => "close-service",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-band marker detected in the assistant's streamed text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    ServeApproved,
    ServeNeedsChanges,
    ServeBlocked,
    KitchenComplete,
    KitchenIdle,
    PhaseComplete,
    IdleTerminated,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::ServeApproved => "serve_approved",
            Signal::ServeNeedsChanges => "serve_needs_changes",
            Signal::ServeBlocked => "serve_blocked",
            Signal::KitchenComplete => "kitchen_complete",
            Signal::KitchenIdle => "kitchen_idle",
            Signal::PhaseComplete => "phase_complete",
            Signal::IdleTerminated => "idle_terminated",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Epic,
    Feature,
    Task,
    Bug,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Ready,
    InProgress,
    Closed,
    Blocked,
    #[serde(other)]
    Unknown,
}

/// A tracked work item, parsed once at the tracker gateway boundary.
///
/// The tracker has emitted the type under both `type` and `issue_type`
/// across versions; the alias absorbs the variance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(alias = "type", default = "IssueType::default_task")]
    pub issue_type: IssueType,
    #[serde(default)]
    pub status: Option<BeadStatus>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl IssueType {
    fn default_task() -> Self {
        IssueType::Task
    }
}

impl Bead {
    pub fn is_epic(&self) -> bool {
        self.issue_type == IssueType::Epic
    }
}

/// Point-in-time bead state. Immutable after construction; the closed list
/// is bounded at the query (most recent N).
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub ready: Vec<Bead>,
    pub in_progress: Vec<Bead>,
    pub closed: Vec<Bead>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn ready_ids(&self) -> Vec<&str> {
        self.ready.iter().map(|b| b.id.as_str()).collect()
    }

    /// Ready work items: tasks + features, never epics.
    pub fn ready_work(&self) -> impl Iterator<Item = &Bead> {
        self.ready.iter().filter(|b| !b.is_epic())
    }

    pub fn ready_work_ids(&self) -> Vec<&str> {
        self.ready_work().map(|b| b.id.as_str()).collect()
    }

    pub fn in_progress_ids(&self) -> Vec<&str> {
        self.in_progress.iter().map(|b| b.id.as_str()).collect()
    }

    pub fn closed_ids(&self) -> Vec<&str> {
        self.closed.iter().map(|b| b.id.as_str()).collect()
    }

    pub fn by_id(&self, id: &str) -> Option<&Bead> {
        self.ready
            .iter()
            .chain(self.in_progress.iter())
            .chain(self.closed.iter())
            .find(|b| b.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id(id).is_some()
    }
}

/// Diff between two snapshots, reported per iteration.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    pub newly_closed: Vec<Bead>,
    pub newly_filed: Vec<Bead>,
}

impl Delta {
    pub fn compute(before: &Snapshot, after: &Snapshot) -> Self {
        let newly_closed = after
            .closed
            .iter()
            .filter(|b| !before.closed.iter().any(|p| p.id == b.id))
            .cloned()
            .collect();
        let newly_filed = after
            .ready
            .iter()
            .filter(|b| !before.contains(&b.id))
            .cloned()
            .collect();
        Self {
            newly_closed,
            newly_filed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.newly_closed.is_empty() && self.newly_filed.is_empty()
    }
}

/// One assistant tool invocation, correlated with its result by id.
#[derive(Clone, Debug, Serialize)]
pub struct Action {
    pub tool_name: String,
    pub tool_use_id: String,
    pub input_summary: String,
    pub output_summary: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

/// Outcome of a single assistant phase invocation.
#[derive(Debug)]
pub struct PhaseResult {
    pub phase: Phase,
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub signals: Vec<Signal>,
    pub actions: Vec<Action>,
    pub error: Option<String>,
    pub early_completion: bool,
}

impl PhaseResult {
    pub fn has_signal(&self, signal: Signal) -> bool {
        self.signals.contains(&signal)
    }

    pub fn timed_out(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.starts_with("Timeout"))
            .unwrap_or(false)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServeVerdict {
    Approved,
    NeedsChanges,
    Blocked,
    Skipped,
}

impl ServeVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ServeVerdict::Approved => "APPROVED",
            ServeVerdict::NeedsChanges => "NEEDS_CHANGES",
            ServeVerdict::Blocked => "BLOCKED",
            ServeVerdict::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVED" => Some(ServeVerdict::Approved),
            "NEEDS_CHANGES" => Some(ServeVerdict::NeedsChanges),
            "BLOCKED" => Some(ServeVerdict::Blocked),
            "SKIPPED" => Some(ServeVerdict::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed SERVE_RESULT block from serve phase output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServeResult {
    pub verdict: ServeVerdict,
    pub continue_: bool,
    pub next_step: Option<String>,
    pub blocking_issues: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Nit,
}

impl Severity {
    /// Normalize the severity spellings reviewers actually emit:
    /// P1/critical, P2/major, P3/minor, P4/nit/retro.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "p1" | "critical" => Some(Severity::Critical),
            "p2" | "major" => Some(Severity::Major),
            "p3" | "minor" => Some(Severity::Minor),
            "p4" | "nit" | "retro" => Some(Severity::Nit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
            Severity::Nit => "nit",
        }
    }
}

/// A single issue extracted from review feedback.
#[derive(Clone, Debug)]
pub struct ServeIssue {
    pub severity: Severity,
    pub location: Option<String>,
    pub problem: String,
    pub suggestion: Option<String>,
}

/// Normalized review feedback, reconstructed from the tracker's comment log
/// between cook retries.
#[derive(Clone, Debug)]
pub struct ServeFeedback {
    pub verdict: ServeVerdict,
    pub summary: String,
    pub issues: Vec<ServeIssue>,
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    NeedsRetry,
    Blocked,
    Crashed,
    Timeout,
    NoWork,
    NoActionableWork,
}

impl IterationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationOutcome::Completed => "completed",
            IterationOutcome::NeedsRetry => "needs_retry",
            IterationOutcome::Blocked => "blocked",
            IterationOutcome::Crashed => "crashed",
            IterationOutcome::Timeout => "timeout",
            IterationOutcome::NoWork => "no_work",
            IterationOutcome::NoActionableWork => "no_actionable_work",
        }
    }
}

/// Record of one loop iteration.
#[derive(Clone, Debug)]
pub struct IterationResult {
    pub iteration: u32,
    pub task_id: Option<String>,
    pub task_title: Option<String>,
    pub outcome: IterationOutcome,
    pub duration_seconds: f64,
    pub serve_verdict: Option<ServeVerdict>,
    pub commit_hash: Option<String>,
    pub before_ready: usize,
    pub before_in_progress: usize,
    pub after_ready: usize,
    pub after_in_progress: usize,
    pub intent: Option<String>,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub actions: Vec<Action>,
    pub delta: Option<Delta>,
    /// Epics this iteration closed (and whose branches need merging).
    pub closed_epics: Vec<String>,
}

impl IterationResult {
    pub fn success(&self) -> bool {
        self.outcome == IterationOutcome::Completed
    }

    pub fn total_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn action_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for action in &self.actions {
            *counts.entry(action.tool_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Beads filed during the iteration (follow-up bugs, discovered tasks).
    pub fn findings_count(&self) -> usize {
        self.delta
            .as_ref()
            .map(|d| d.newly_filed.len())
            .unwrap_or(0)
    }
}

/// Why the loop stopped; drives the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    NoWork,
    NoActionableWork,
    MaxIterations,
    Shutdown,
    EpicComplete,
    Blocked,
    Crashed,
    Timeout,
    CircuitBreaker,
    AllTasksSkipped,
    InvalidEpic,
    Unknown,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::NoWork => "no_work",
            StopReason::NoActionableWork => "no_actionable_work",
            StopReason::MaxIterations => "max_iterations",
            StopReason::Shutdown => "shutdown",
            StopReason::EpicComplete => "epic_complete",
            StopReason::Blocked => "blocked",
            StopReason::Crashed => "crashed",
            StopReason::Timeout => "timeout",
            StopReason::CircuitBreaker => "circuit_breaker",
            StopReason::AllTasksSkipped => "all_tasks_skipped",
            StopReason::InvalidEpic => "invalid_epic",
            StopReason::Unknown => "unknown",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::NoWork
            | StopReason::NoActionableWork
            | StopReason::MaxIterations
            | StopReason::Shutdown
            | StopReason::EpicComplete => 0,
            StopReason::Blocked => 1,
            StopReason::CircuitBreaker | StopReason::AllTasksSkipped => 3,
            _ => 2,
        }
    }
}

/// Stops the loop after too many consecutive failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: usize,
    window_size: usize,
    window: VecDeque<bool>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize) -> Self {
        Self {
            failure_threshold,
            window_size: CIRCUIT_BREAKER_WINDOW_SIZE,
            window: VecDeque::new(),
        }
    }

    pub fn record(&mut self, success: bool) {
        self.window.push_back(success);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
    }

    pub fn is_open(&self) -> bool {
        if self.window.len() < self.failure_threshold {
            return false;
        }
        self.window
            .iter()
            .rev()
            .take(self.failure_threshold)
            .all(|&s| !s)
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// One row of the skip-list report.
#[derive(Clone, Debug, Serialize)]
pub struct SkippedTask {
    pub id: String,
    pub failure_count: u32,
}

/// Tracks tasks to exclude from selection after repeated failures, so a
/// single failing task cannot burn through the whole iteration budget.
#[derive(Debug)]
pub struct SkipList {
    failed: HashMap<String, u32>,
    max_failures: u32,
}

impl SkipList {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failed: HashMap::new(),
            max_failures,
        }
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Returns true when the task has just hit the skip threshold.
    pub fn record_failure(&mut self, task_id: &str) -> bool {
        let count = self.failed.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count >= self.max_failures
    }

    pub fn record_success(&mut self, task_id: &str) {
        self.failed.remove(task_id);
    }

    pub fn is_skipped(&self, task_id: &str) -> bool {
        self.failed
            .get(task_id)
            .map(|&c| c >= self.max_failures)
            .unwrap_or(false)
    }

    pub fn skipped_ids(&self) -> Vec<String> {
        self.failed
            .iter()
            .filter(|&(_, &c)| c >= self.max_failures)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn skipped_tasks(&self) -> Vec<SkippedTask> {
        let mut tasks: Vec<SkippedTask> = self
            .failed
            .iter()
            .filter(|&(_, &c)| c >= self.max_failures)
            .map(|(id, &c)| SkippedTask {
                id: id.clone(),
                failure_count: c,
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TASK_FAILURES)
    }
}

/// One failed iteration summarized for the escalation report.
#[derive(Clone, Debug, Serialize)]
pub struct EscalationFailure {
    pub iteration: u32,
    pub task_id: Option<String>,
    pub task_title: Option<String>,
    pub outcome: String,
    pub serve_verdict: Option<String>,
    pub duration_seconds: f64,
}

/// Actionable context written into the final status file when the loop
/// stops because of repeated failures.
#[derive(Clone, Debug, Serialize)]
pub struct Escalation {
    pub stop_reason: String,
    pub recent_failures: Vec<EscalationFailure>,
    pub skipped_tasks: Vec<SkippedTask>,
    pub suggested_actions: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Computed metrics for a loop run.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LoopMetrics {
    pub success_rate: f64,
    pub p50_duration: f64,
    pub p95_duration: f64,
    pub timeout_rate: f64,
    pub retry_rate: f64,
}

impl LoopMetrics {
    pub fn from_iterations(iterations: &[IterationResult]) -> Self {
        if iterations.is_empty() {
            return Self::default();
        }
        let total = iterations.len();
        let successes = iterations.iter().filter(|i| i.success()).count();
        let timeouts = iterations
            .iter()
            .filter(|i| i.outcome == IterationOutcome::Timeout)
            .count();
        let retries = iterations
            .iter()
            .filter(|i| i.outcome == IterationOutcome::NeedsRetry)
            .count();

        let mut durations: Vec<f64> = iterations.iter().map(|i| i.duration_seconds).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p50_idx = durations.len() / 2;
        let p95_idx = ((durations.len() as f64 * 0.95) as usize).min(durations.len() - 1);

        Self {
            success_rate: successes as f64 / total as f64,
            p50_duration: durations[p50_idx],
            p95_duration: durations[p95_idx],
            timeout_rate: timeouts as f64 / total as f64,
            retry_rate: retries as f64 / total as f64,
        }
    }
}

/// Final report for the entire run.
#[derive(Debug)]
pub struct LoopReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub iterations: Vec<IterationResult>,
    pub stop_reason: StopReason,
    pub completed_count: u32,
    pub failed_count: u32,
    pub duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bead(id: &str, issue_type: IssueType) -> Bead {
        Bead {
            id: id.to_string(),
            title: format!("title {id}"),
            issue_type,
            status: None,
            parent: None,
            priority: None,
            description: None,
        }
    }

    fn iteration(outcome: IterationOutcome, duration: f64) -> IterationResult {
        IterationResult {
            iteration: 1,
            task_id: Some("t1".to_string()),
            task_title: None,
            outcome,
            duration_seconds: duration,
            serve_verdict: None,
            commit_hash: None,
            before_ready: 0,
            before_in_progress: 0,
            after_ready: 0,
            after_in_progress: 0,
            intent: None,
            before_state: None,
            after_state: None,
            actions: Vec::new(),
            delta: None,
            closed_epics: Vec::new(),
        }
    }

    #[test]
    fn bead_parses_both_type_spellings() {
        let old: Bead = serde_json::from_str(r#"{"id":"a-1","type":"epic"}"#).unwrap();
        assert_eq!(old.issue_type, IssueType::Epic);
        let new: Bead =
            serde_json::from_str(r#"{"id":"a-2","issue_type":"feature","status":"in_progress"}"#)
                .unwrap();
        assert_eq!(new.issue_type, IssueType::Feature);
        assert_eq!(new.status, Some(BeadStatus::InProgress));
    }

    #[test]
    fn bead_tolerates_unknown_status() {
        let b: Bead = serde_json::from_str(r#"{"id":"a-3","status":"deferred"}"#).unwrap();
        assert_eq!(b.status, Some(BeadStatus::Unknown));
        assert_eq!(b.issue_type, IssueType::Task);
    }

    #[test]
    fn ready_work_excludes_epics() {
        let snapshot = Snapshot {
            ready: vec![
                bead("e1", IssueType::Epic),
                bead("t1", IssueType::Task),
                bead("f1", IssueType::Feature),
            ],
            ..Default::default()
        };
        assert_eq!(snapshot.ready_work_ids(), vec!["t1", "f1"]);
        assert_eq!(snapshot.ready_ids().len(), 3);
    }

    #[test]
    fn delta_finds_new_closures_and_filings() {
        let before = Snapshot {
            ready: vec![bead("t1", IssueType::Task)],
            closed: vec![bead("old", IssueType::Task)],
            ..Default::default()
        };
        let after = Snapshot {
            ready: vec![bead("new-bug", IssueType::Bug)],
            closed: vec![bead("old", IssueType::Task), bead("t1", IssueType::Task)],
            ..Default::default()
        };
        let delta = Delta::compute(&before, &after);
        assert_eq!(delta.newly_closed.len(), 1);
        assert_eq!(delta.newly_closed[0].id, "t1");
        assert_eq!(delta.newly_filed.len(), 1);
        assert_eq!(delta.newly_filed[0].id, "new-bug");
    }

    #[test]
    fn breaker_opens_only_on_threshold_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(3);
        breaker.record(false);
        breaker.record(false);
        assert!(!breaker.is_open(), "below threshold must stay closed");
        breaker.record(false);
        assert!(breaker.is_open());

        breaker.reset();
        breaker.record(false);
        breaker.record(true);
        breaker.record(false);
        breaker.record(false);
        assert!(!breaker.is_open(), "a success inside the tail keeps it closed");
        breaker.record(false);
        assert!(breaker.is_open());
    }

    #[test]
    fn breaker_window_is_bounded() {
        let mut breaker = CircuitBreaker::new(5);
        for _ in 0..50 {
            breaker.record(true);
        }
        assert!(breaker.window.len() <= CIRCUIT_BREAKER_WINDOW_SIZE);
        assert!(!breaker.is_open());
    }

    #[test]
    fn skip_list_threshold_and_clear() {
        let mut skips = SkipList::new(3);
        assert!(!skips.record_failure("t1"));
        assert!(!skips.record_failure("t1"));
        assert!(!skips.is_skipped("t1"));
        assert!(skips.record_failure("t1"));
        assert!(skips.is_skipped("t1"));
        assert_eq!(skips.skipped_ids(), vec!["t1".to_string()]);

        skips.record_success("t1");
        assert!(!skips.is_skipped("t1"));
        assert!(skips.skipped_tasks().is_empty());
    }

    #[test]
    fn metrics_percentiles_over_known_durations() {
        let mut iterations: Vec<IterationResult> = (1..=10)
            .map(|n| iteration(IterationOutcome::Completed, n as f64))
            .collect();
        iterations[9] = iteration(IterationOutcome::Timeout, 10.0);
        let metrics = LoopMetrics::from_iterations(&iterations);
        assert!((metrics.success_rate - 0.9).abs() < 1e-9);
        assert!((metrics.p50_duration - 6.0).abs() < 1e-9);
        assert!((metrics.p95_duration - 10.0).abs() < 1e-9);
        assert!((metrics.timeout_rate - 0.1).abs() < 1e-9);
    }

    #[test]
    fn stop_reason_exit_codes() {
        assert_eq!(StopReason::NoWork.exit_code(), 0);
        assert_eq!(StopReason::EpicComplete.exit_code(), 0);
        assert_eq!(StopReason::Blocked.exit_code(), 1);
        assert_eq!(StopReason::CircuitBreaker.exit_code(), 3);
        assert_eq!(StopReason::AllTasksSkipped.exit_code(), 3);
        assert_eq!(StopReason::InvalidEpic.exit_code(), 2);
        assert_eq!(StopReason::Crashed.exit_code(), 2);
    }
}

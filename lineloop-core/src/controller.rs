//! The outer loop: task selection with epic filtering, failure accounting,
//! circuit breaking, escalation, and telemetry. This module is the only
//! owner of the breaker, the skip list, the iteration history and the
//! counters; the engine only ever sees read-only snapshots.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use serde_json::{Value, json};

use crate::config::{EXCLUDED_EPIC_TITLES, EpicMode, LoopConfig, MAX_RETRY_DELAY};
use crate::git::{Git, MergeError};
use crate::iteration::{Engine, IterationContext};
use crate::model::{
    Bead, CircuitBreaker, Escalation, EscalationFailure, IssueType, IterationOutcome,
    IterationResult, LoopMetrics, LoopReport, SkipList, Snapshot, StopReason,
};
use crate::shutdown::Shutdown;
use crate::telemetry::{ProgressState, StatusReport, Telemetry, recent_iterations};
use crate::tracker::{AncestorMap, Tracker};

/// Exponential backoff with jitter: 2s, 4s, 8s... capped at 60s, ±20%.
pub fn retry_delay(attempt: u32) -> Duration {
    let nominal = (2.0 * 2f64.powi(attempt as i32)).min(MAX_RETRY_DELAY.as_secs_f64());
    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0.8..=1.2);
    Duration::from_secs_f64(nominal * jitter)
}

/// Ready epics whose title marks them as parking lots.
pub fn excluded_epic_ids(snapshot: &Snapshot) -> HashSet<String> {
    snapshot
        .ready
        .iter()
        .filter(|b| b.is_epic() && EXCLUDED_EPIC_TITLES.contains(&b.title.as_str()))
        .map(|b| b.id.clone())
        .collect()
}

/// Epic of the highest-priority ready work item, for `--epic` auto mode.
pub fn detect_first_epic(
    snapshot: &Snapshot,
    excluded: &HashSet<String>,
    skipped: &HashSet<String>,
    exhausted: &HashSet<String>,
    ancestors: &AncestorMap,
) -> Option<(String, String)> {
    for bead in snapshot.ready_work() {
        if skipped.contains(&bead.id) {
            continue;
        }
        if let Some(Some(epic_id)) = ancestors.get(&bead.id) {
            if !excluded.contains(epic_id) && !exhausted.contains(epic_id) {
                let title = snapshot
                    .by_id(epic_id)
                    .map(|b| b.title.clone())
                    .unwrap_or_default();
                return Some((epic_id.clone(), title));
            }
        }
    }
    None
}

fn passes_filter(
    bead: &Bead,
    epic_filter: Option<&str>,
    excluded: &HashSet<String>,
    ancestors: &AncestorMap,
) -> bool {
    let ancestor = ancestors.get(&bead.id).cloned().flatten();
    match epic_filter {
        Some(filter) => ancestor.as_deref() == Some(filter),
        None => match ancestor {
            Some(epic_id) => !excluded.contains(&epic_id),
            None => true,
        },
    }
}

/// Next task to hand the assistant: highest-priority ready work under the
/// effective filter, preferring tasks over features, skipping the skip list.
pub fn select_next_task(
    snapshot: &Snapshot,
    skipped: &HashSet<String>,
    epic_filter: Option<&str>,
    excluded: &HashSet<String>,
    ancestors: &AncestorMap,
) -> Option<(String, String)> {
    let candidates: Vec<&Bead> = snapshot
        .ready_work()
        .filter(|b| passes_filter(b, epic_filter, excluded, ancestors))
        .collect();
    for bead in &candidates {
        if bead.issue_type == IssueType::Task && !skipped.contains(&bead.id) {
            return Some((bead.id.clone(), bead.title.clone()));
        }
    }
    for bead in &candidates {
        if !skipped.contains(&bead.id) {
            return Some((bead.id.clone(), bead.title.clone()));
        }
    }
    None
}

/// Ready work count under the effective filter.
pub fn filtered_ready_count(
    snapshot: &Snapshot,
    epic_filter: Option<&str>,
    excluded: &HashSet<String>,
    ancestors: &AncestorMap,
) -> usize {
    snapshot
        .ready_work()
        .filter(|b| passes_filter(b, epic_filter, excluded, ancestors))
        .count()
}

/// Parent chain of a task inside the snapshot, nearest first.
fn hierarchy_chain<'a>(snapshot: &'a Snapshot, task_id: &str) -> Vec<&'a Bead> {
    let mut chain = Vec::new();
    let mut current = snapshot.by_id(task_id);
    for _ in 0..crate::config::HIERARCHY_MAX_DEPTH {
        let Some(bead) = current else { break };
        let Some(parent_id) = bead.parent.as_deref() else {
            break;
        };
        match snapshot.by_id(parent_id) {
            Some(parent) => {
                chain.push(parent);
                current = Some(parent);
            }
            None => break,
        }
    }
    chain
}

pub fn suggested_actions(stop_reason: StopReason) -> Vec<String> {
    let actions: &[&str] = match stop_reason {
        StopReason::AllTasksSkipped => &[
            "Review the skipped tasks to understand failure patterns",
            "Check if tasks have missing dependencies or unclear requirements",
            "Consider breaking down complex tasks into smaller pieces",
            "Use 'bd show <task_id>' to see full task details",
            "Restart the loop after fixing the blocking issues",
        ],
        StopReason::CircuitBreaker => &[
            "Check recent failures for common patterns (timeouts, test failures, etc.)",
            "Review the loop log file for the failing phases",
            "Ensure the test environment is healthy (database, services, etc.)",
            "Consider reducing task complexity or adding more context",
            "Restart the loop after investigation",
        ],
        _ => &[
            "Review the loop status file",
            "Check the loop log file",
        ],
    };
    actions.iter().map(|s| s.to_string()).collect()
}

pub fn build_escalation(
    iterations: &[IterationResult],
    skip_list: &SkipList,
    stop_reason: StopReason,
) -> Escalation {
    let start = iterations
        .len()
        .saturating_sub(crate::config::RECENT_ITERATIONS_LIMIT);
    let recent_failures = iterations[start..]
        .iter()
        .filter(|i| !i.success())
        .map(|i| EscalationFailure {
            iteration: i.iteration,
            task_id: i.task_id.clone(),
            task_title: i.task_title.clone(),
            outcome: i.outcome.as_str().to_string(),
            serve_verdict: i.serve_verdict.map(|v| v.as_str().to_string()),
            duration_seconds: i.duration_seconds,
        })
        .collect();
    Escalation {
        stop_reason: stop_reason.as_str().to_string(),
        recent_failures,
        skipped_tasks: skip_list.skipped_tasks(),
        suggested_actions: suggested_actions(stop_reason),
        generated_at: Utc::now(),
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    let minutes = (seconds / 60.0) as u64;
    let secs = seconds % 60.0;
    if minutes < 60 {
        return format!("{minutes}m {secs:.0}s");
    }
    format!("{}h {}m", minutes / 60, minutes % 60)
}

fn outcome_tag(outcome: IterationOutcome) -> colored::ColoredString {
    match outcome {
        IterationOutcome::Completed => "[OK]".green(),
        IterationOutcome::NeedsRetry => "[RETRY]".yellow(),
        IterationOutcome::Blocked => "[BLOCKED]".red(),
        IterationOutcome::Crashed => "[CRASH]".red(),
        IterationOutcome::Timeout => "[TIMEOUT]".red(),
        IterationOutcome::NoWork | IterationOutcome::NoActionableWork => "[DONE]".normal(),
    }
}

/// Everything the CLI needs to render reports and pick an exit code.
pub struct LoopRun {
    pub report: LoopReport,
    pub metrics: LoopMetrics,
    pub escalation: Option<Escalation>,
    pub remaining_ready_work: usize,
    pub remaining_ready_total: usize,
}

pub struct LoopController {
    config: LoopConfig,
    tracker: Tracker,
    git: Git,
    telemetry: Telemetry,
    shutdown: Shutdown,
}

impl LoopController {
    pub fn new(config: LoopConfig, telemetry: Telemetry, shutdown: Shutdown) -> Self {
        let tracker = Tracker::new(&config);
        let git = Git::new(&config);
        Self {
            config,
            tracker,
            git,
            telemetry,
            shutdown,
        }
    }

    fn human(&self) -> bool {
        self.config.human_output
    }

    fn print_iteration(&self, result: &IterationResult, retries: u32) {
        if !self.human() {
            return;
        }
        let task = match (&result.task_id, &result.task_title) {
            (Some(id), Some(title)) => format!("{id}: {title}"),
            (Some(id), None) => id.clone(),
            _ => "Unknown task".to_string(),
        };
        println!("  {} {}", outcome_tag(result.outcome), task);
        if let Some(intent) = &result.intent {
            println!("  Intent: {intent}");
        }
        if let Some(before) = &result.before_state {
            println!("  Before: {before}");
        }
        if let Some(after) = &result.after_state {
            println!("  After:  {after}");
        }
        let mut details = vec![format!("Duration: {}", format_duration(result.duration_seconds))];
        if let Some(verdict) = result.serve_verdict {
            details.push(format!("Verdict: {verdict}"));
        }
        if let Some(hash) = &result.commit_hash {
            details.push(format!("Commit: {hash}"));
        }
        println!("  {}", details.join(" | "));
        println!(
            "\n  Beads: ready {}→{} | in_progress {}→{}{}",
            result.before_ready,
            result.after_ready,
            result.before_in_progress,
            result.after_in_progress,
            if result.success() { " | closed +1" } else { "" }
        );
        if result.outcome == IterationOutcome::NeedsRetry && retries > 0 {
            println!("\n  Retrying ({retries})...");
        }
    }

    fn print_escalation(&self, escalation: &Escalation) {
        if !self.human() {
            return;
        }
        let rule = "=".repeat(60);
        println!("\n{rule}\nESCALATION REPORT\n{rule}");
        println!("Stop reason: {}\n", escalation.stop_reason);
        if !escalation.skipped_tasks.is_empty() {
            println!("SKIPPED TASKS (too many failures):");
            for task in &escalation.skipped_tasks {
                println!("  - {}: {} failures", task.id, task.failure_count);
            }
            println!();
        }
        if !escalation.recent_failures.is_empty() {
            println!("RECENT FAILURES:");
            let shown = escalation
                .recent_failures
                .iter()
                .rev()
                .take(crate::config::RECENT_ITERATIONS_DISPLAY)
                .collect::<Vec<_>>();
            for failure in shown.into_iter().rev() {
                println!(
                    "  - #{}: {} ({})",
                    failure.iteration,
                    failure.task_id.as_deref().unwrap_or("unknown"),
                    failure.outcome
                );
            }
            println!();
        }
        println!("SUGGESTED ACTIONS:");
        for action in &escalation.suggested_actions {
            println!("  • {action}");
        }
        println!("\n{rule}");
    }

    async fn print_epic_completion(&self, epic_id: &str) -> Value {
        let epic = self.tracker.show(epic_id).await;
        let children = self.tracker.children(epic_id).await;
        let title = epic.as_ref().map(|e| e.title.clone()).unwrap_or_default();

        if self.human() {
            let header = format!("EPIC COMPLETE: {epic_id} - {title}");
            let width = header.len().max(62) + 4;
            println!();
            println!("╔{}╗", "═".repeat(width));
            println!("║  {header:<w$}║", w = width - 2);
            println!("╚{}╝", "═".repeat(width));
            if let Some(description) = epic.as_ref().and_then(|e| e.description.as_deref()) {
                if let Some(first) = description.split('.').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        println!("\nIntent: {first}");
                    }
                }
            }
            if !children.is_empty() {
                println!("\nFeatures delivered ({}):", children.len());
                for child in &children {
                    println!("  [x] {}: {}", child.id, child.title);
                }
            }
            println!();
        }

        json!({
            "id": epic_id,
            "title": title,
            "children_count": children.len(),
            "completed_at": Utc::now(),
        })
    }

    /// Merge one closed epic's branch to main; conflicts file a P1 bug bead.
    async fn merge_closed_epic(&self, epic_id: &str) {
        let title = self
            .tracker
            .show(epic_id)
            .await
            .map(|b| b.title)
            .unwrap_or_default();
        match self.git.merge_epic_to_main(epic_id, &title).await {
            Ok(()) => {
                if self.human() {
                    println!("  Branch: epic/{epic_id} merged to main");
                }
            }
            Err(MergeError::Conflict) => {
                self.tracker
                    .create_bug(
                        &format!("Resolve merge conflict for epic {epic_id}"),
                        &format!(
                            "Epic {epic_id} ({title}) completed but merge to main failed due to conflicts."
                        ),
                        1,
                    )
                    .await;
                if self.human() {
                    println!("  WARNING: Merge conflict for epic/{epic_id}");
                    println!("           Bug bead created for manual resolution");
                }
            }
            Err(err) => {
                tracing::warn!(epic_id, ?err, "epic merge failed");
            }
        }
    }

    pub async fn run(mut self) -> LoopRun {
        let started_at = Utc::now();
        let mut iterations: Vec<IterationResult> = Vec::new();
        let mut completed_count: u32 = 0;
        let mut failed_count: u32 = 0;
        let mut stop_reason = StopReason::Unknown;
        let mut breaker = CircuitBreaker::new(self.config.failure_threshold);
        let mut skip_list = SkipList::new(self.config.max_task_failures);
        let mut current_epic: Option<(String, String)> = None;
        let mut exhausted_epics: HashSet<String> = HashSet::new();
        let epic_mode = self.config.epic_mode.clone();

        tracing::info!(
            max_iterations = self.config.max_iterations,
            epic_mode = ?epic_mode,
            "loop starting"
        );

        // An explicit epic id must name a real epic before any work starts.
        if let EpicMode::Explicit(id) = &epic_mode {
            let valid = self
                .tracker
                .show(id)
                .await
                .map(|b| b.is_epic())
                .unwrap_or(false);
            if !valid {
                tracing::error!(epic = %id, "not found or not an epic");
                if self.human() {
                    println!("Error: {id} is not a valid epic ID.");
                }
                let now = Utc::now();
                return LoopRun {
                    report: LoopReport {
                        started_at: now,
                        ended_at: now,
                        iterations: Vec::new(),
                        stop_reason: StopReason::InvalidEpic,
                        completed_count: 0,
                        failed_count: 0,
                        duration_seconds: 0.0,
                    },
                    metrics: LoopMetrics::default(),
                    escalation: None,
                    remaining_ready_work: 0,
                    remaining_ready_total: 0,
                };
            }
            let title = self
                .tracker
                .show(id)
                .await
                .map(|b| b.title)
                .unwrap_or_default();
            current_epic = Some((id.clone(), title));
        }

        if self.human() {
            println!(
                "Line Cook Loop starting (max {} iterations)",
                self.config.max_iterations
            );
            match (&epic_mode, &current_epic) {
                (EpicMode::Auto, _) => println!("  Mode: epic (auto-detect)"),
                (EpicMode::Explicit(_), Some((id, title))) => {
                    println!("  Mode: epic ({id} - {title})")
                }
                _ => {}
            }
            println!("{}\n", "=".repeat(44));
        }

        if !self.config.skip_initial_sync {
            if self.human() {
                println!("Syncing...");
            }
            self.git.sync_at_start().await;
            self.tracker.sync().await;
            if self.human() {
                println!("Sync complete.");
            }
        }

        let mut iteration: u32 = 0;
        let mut current_retries: u32 = 0;
        let mut last_task_id: Option<String> = None;

        'outer: while iteration < self.config.max_iterations {
            if self.shutdown.is_requested() {
                stop_reason = StopReason::Shutdown;
                tracing::info!("shutdown requested, stopping gracefully");
                if self.human() {
                    println!("\nShutdown requested. Stopping gracefully.");
                }
                break;
            }

            if breaker.is_open() {
                stop_reason = StopReason::CircuitBreaker;
                tracing::warn!("circuit breaker tripped after consecutive failures");
                if self.human() {
                    println!("\nCircuit breaker tripped: too many consecutive failures. Stopping.");
                }
                break;
            }

            let snapshot = self.tracker.snapshot().await;
            let excluded = excluded_epic_ids(&snapshot);
            let ancestors = self.tracker.epic_ancestor_map(&snapshot).await;
            let skipped: HashSet<String> = skip_list.skipped_ids().into_iter().collect();

            // Resolve the effective epic filter for this turn.
            let effective_epic: Option<String> = match &epic_mode {
                EpicMode::Explicit(id) => Some(id.clone()),
                EpicMode::Auto => {
                    if current_epic.is_none() {
                        match detect_first_epic(
                            &snapshot,
                            &excluded,
                            &skipped,
                            &exhausted_epics,
                            &ancestors,
                        ) {
                            Some((id, title)) => {
                                if self.human() {
                                    println!("  Epic: {id} - {title}");
                                }
                                current_epic = Some((id, title));
                            }
                            None => {
                                stop_reason = StopReason::NoWork;
                                tracing::info!("no non-excluded epic found for auto-detect mode");
                                if self.human() {
                                    println!("\nNo epic with ready work found. Loop complete.");
                                }
                                break;
                            }
                        }
                    }
                    current_epic.as_ref().map(|(id, _)| id.clone())
                }
                EpicMode::Default => None,
            };

            let ready_work_count = filtered_ready_count(
                &snapshot,
                effective_epic.as_deref(),
                &excluded,
                &ancestors,
            );

            if ready_work_count == 0 {
                if matches!(epic_mode, EpicMode::Auto) {
                    if let Some((id, _)) = current_epic.take() {
                        if self.human() {
                            println!("\n  Epic {id} has no remaining work.");
                        }
                        exhausted_epics.insert(id);
                        continue;
                    }
                }
                stop_reason = StopReason::NoWork;
                let epics_ready = snapshot.ready.len() - snapshot.ready_work_ids().len();
                if self.human() {
                    if epics_ready > 0 {
                        println!(
                            "\nNo work items ready ({epics_ready} epics remain). Loop complete."
                        );
                    } else {
                        println!("\nNo work items ready. Loop complete.");
                    }
                }
                tracing::info!(epics_ready, "no work items ready, loop complete");
                break;
            }

            let target = select_next_task(
                &snapshot,
                &skipped,
                effective_epic.as_deref(),
                &excluded,
                &ancestors,
            );
            if target.is_none() && !skipped.is_empty() {
                stop_reason = StopReason::AllTasksSkipped;
                tracing::warn!(?skipped, "all remaining tasks are skipped");
                if self.human() {
                    println!("\nAll remaining tasks are skipped due to repeated failures.");
                    let mut ids: Vec<&str> = skipped.iter().map(String::as_str).collect();
                    ids.sort_unstable();
                    println!("Skipped tasks: {}", ids.join(", "));
                }
                break;
            }

            iteration += 1;

            if self.human() {
                println!("{}", "=".repeat(44));
                println!(
                    "Iteration {iteration}/{} | Ready: {ready_work_count}",
                    self.config.max_iterations
                );
                if let Some((id, title)) = &target {
                    let skip_note = if skipped.is_empty() {
                        String::new()
                    } else {
                        format!(" ({} skipped)", skipped.len())
                    };
                    println!("  Target: {id} - {title}{skip_note}");
                    let chain = hierarchy_chain(&snapshot, id);
                    if !chain.is_empty() {
                        let parts: Vec<String> = chain
                            .iter()
                            .map(|b| {
                                if b.title.is_empty() {
                                    b.id.clone()
                                } else {
                                    format!("{} ({})", b.id, b.title)
                                }
                            })
                            .collect();
                        println!("    under: {}", parts.join(" > "));
                    }
                }
                println!("{}", "-".repeat(44));
            }

            let mut progress = if self.telemetry.has_status_file() {
                Some(ProgressState::new(
                    self.telemetry.clone(),
                    iteration,
                    self.config.max_iterations,
                    target.as_ref().map(|(id, _)| id.clone()),
                    target.as_ref().map(|(_, title)| title.clone()),
                    completed_count,
                    ready_work_count,
                    started_at,
                    recent_iterations(&iterations),
                ))
            } else {
                None
            };

            let engine = Engine::new(&self.config, &self.tracker, &self.git, &self.shutdown);
            let result = engine
                .run_iteration(
                    IterationContext {
                        iteration,
                        max_iterations: self.config.max_iterations,
                        before: snapshot,
                        target,
                        ancestors: &ancestors,
                    },
                    progress.as_mut(),
                )
                .await;

            // Success resets the window so recovery gets fresh chances;
            // only failures accumulate.
            if result.success() {
                breaker.reset();
            } else {
                breaker.record(false);
            }

            self.print_iteration(&result, current_retries);

            iterations.push(result);
            let result = iterations.last().expect("just pushed");

            let completed_for_status = completed_count + u32::from(result.success());
            let mut status = StatusReport::new(
                true,
                iteration,
                self.config.max_iterations,
                completed_for_status,
                result.after_ready,
                started_at,
            );
            status.current_task = result.task_id.as_deref();
            status.current_task_title = result.task_title.as_deref();
            status.last_verdict = result.serve_verdict;
            status.epic_mode = epic_mode.label();
            status.current_epic = current_epic.as_ref().map(|(id, _)| id.as_str());
            status.recent_iterations = recent_iterations(&iterations);
            self.telemetry.write_status(&status);
            self.telemetry.append_iteration(result);

            if self.config.periodic_sync_interval > 0
                && iteration % self.config.periodic_sync_interval == 0
            {
                let ok = self.tracker.sync().await;
                if self.human() {
                    if ok {
                        println!("  Periodic sync: ok");
                    } else {
                        println!("  Periodic sync: failed (continuing)");
                    }
                }
            }

            match result.outcome {
                IterationOutcome::NoWork => {
                    stop_reason = StopReason::NoWork;
                    break;
                }
                IterationOutcome::NoActionableWork => {
                    stop_reason = StopReason::NoActionableWork;
                    tracing::info!("no actionable work found");
                    if self.human() {
                        println!("\nNo actionable tasks available. Stopping loop.");
                    }
                    break;
                }
                IterationOutcome::Completed => {
                    completed_count += 1;
                    current_retries = 0;
                    last_task_id = None;
                    if let Some(id) = &result.task_id {
                        skip_list.record_success(id);
                    }
                }
                IterationOutcome::NeedsRetry => {
                    if result.task_id == last_task_id {
                        current_retries += 1;
                    } else {
                        current_retries = 1;
                        last_task_id = result.task_id.clone();
                    }

                    if current_retries >= self.config.max_retries {
                        failed_count += 1;
                        if let Some(id) = &result.task_id {
                            if skip_list.record_failure(id) {
                                tracing::warn!(task = %id, "task added to skip list");
                                if self.human() {
                                    println!(
                                        "\n  Task {id} added to skip list (too many failures)."
                                    );
                                }
                            }
                        }
                        current_retries = 0;
                        last_task_id = None;
                        if self.human() {
                            println!(
                                "\n  Max retries ({}) reached. Moving on.",
                                self.config.max_retries
                            );
                        }
                    } else {
                        let delay = retry_delay(current_retries);
                        tracing::info!(
                            retry = current_retries,
                            max_retries = self.config.max_retries,
                            delay_secs = delay.as_secs_f64(),
                            task = ?result.task_id,
                            "waiting before retry"
                        );
                        if self.human() {
                            println!("\n  Waiting {:.1}s before retry...", delay.as_secs_f64());
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.cancelled() => {}
                        }
                    }
                }
                IterationOutcome::Blocked => {
                    failed_count += 1;
                    if let Some(id) = &result.task_id {
                        if skip_list.record_failure(id) {
                            tracing::warn!(task = %id, "task added to skip list after repeated blocks");
                            if self.human() {
                                println!("\n  Task {id} added to skip list (repeatedly blocked).");
                            }
                        }
                    }
                    if self.config.stop_on_blocked {
                        stop_reason = StopReason::Blocked;
                        tracing::info!("task blocked, stopping (--stop-on-blocked)");
                        if self.human() {
                            println!("\nTask blocked. Stopping loop (--stop-on-blocked).");
                        }
                        break;
                    }
                    current_retries = 0;
                    last_task_id = None;
                }
                IterationOutcome::Crashed | IterationOutcome::Timeout => {
                    failed_count += 1;
                    if let Some(id) = &result.task_id {
                        if skip_list.record_failure(id) {
                            tracing::warn!(task = %id, outcome = result.outcome.as_str(), "task added to skip list");
                            if self.human() {
                                println!(
                                    "\n  Task {id} added to skip list ({}).",
                                    result.outcome.as_str()
                                );
                            }
                        }
                    }
                    if self.config.stop_on_crash {
                        stop_reason = if result.outcome == IterationOutcome::Timeout {
                            StopReason::Timeout
                        } else {
                            StopReason::Crashed
                        };
                        tracing::info!(
                            outcome = result.outcome.as_str(),
                            "stopping (--stop-on-crash)"
                        );
                        if self.human() {
                            println!(
                                "\nTask {}. Stopping loop (--stop-on-crash).",
                                result.outcome.as_str()
                            );
                        }
                        break;
                    }
                    current_retries = 0;
                    last_task_id = None;
                }
            }

            // Epic closures: merge branches the iteration closed, then ask
            // the tracker for any eligible epics the iteration missed.
            if result.success() {
                let mut closed_now: Vec<String> = result.closed_epics.clone();
                for epic_id in &closed_now {
                    self.merge_closed_epic(epic_id).await;
                }

                let handled: HashSet<String> = closed_now.iter().cloned().collect();
                let eligible: Vec<String> = self
                    .tracker
                    .close_eligible_epics()
                    .await
                    .into_iter()
                    .filter(|id| !handled.contains(id))
                    .collect();
                if !eligible.is_empty() {
                    tracing::info!(?eligible, "epics eligible for closure");
                    if self.tracker.close_eligible_epics_apply().await {
                        for epic_id in &eligible {
                            self.merge_closed_epic(epic_id).await;
                            closed_now.push(epic_id.clone());
                        }
                    }
                }

                if !closed_now.is_empty() {
                    let mut completions = Vec::new();
                    for epic_id in &closed_now {
                        completions.push(self.print_epic_completion(epic_id).await);
                    }
                    self.telemetry.record_epic_completions(&completions);

                    if matches!(epic_mode, EpicMode::Auto) {
                        current_epic = None;
                    }
                    if self.config.break_on_epic {
                        stop_reason = StopReason::EpicComplete;
                        tracing::info!(epics = ?closed_now, "epic completed, breaking as requested");
                        if self.human() {
                            println!("\nEpic completed. Pausing loop (--break-on-epic).");
                        }
                        break 'outer;
                    }
                }
            }
        }

        if stop_reason == StopReason::Unknown && iteration >= self.config.max_iterations {
            stop_reason = StopReason::MaxIterations;
            tracing::info!(
                max_iterations = self.config.max_iterations,
                "reached iteration limit"
            );
            if self.human() {
                println!(
                    "\nReached iteration limit ({}). Stopping.",
                    self.config.max_iterations
                );
            }
        }

        let ended_at = Utc::now();
        let duration = ended_at
            .signed_duration_since(started_at)
            .num_milliseconds() as f64
            / 1000.0;
        let metrics = LoopMetrics::from_iterations(&iterations);

        tracing::info!(
            completed = completed_count,
            failed = failed_count,
            reason = stop_reason.as_str(),
            "loop complete"
        );

        let escalation = if matches!(
            stop_reason,
            StopReason::CircuitBreaker | StopReason::AllTasksSkipped
        ) {
            let escalation = build_escalation(&iterations, &skip_list, stop_reason);
            self.print_escalation(&escalation);
            tracing::warn!(
                reason = stop_reason.as_str(),
                skipped = escalation.skipped_tasks.len(),
                "escalation"
            );
            Some(escalation)
        } else {
            None
        };

        let final_snapshot = self.tracker.snapshot().await;
        let remaining_ready_total = final_snapshot.ready.len();
        let remaining_ready_work = final_snapshot.ready_work_ids().len();

        let last = iterations.last();
        let mut status = StatusReport::new(
            false,
            iteration,
            self.config.max_iterations,
            completed_count,
            remaining_ready_work,
            started_at,
        );
        status.current_task = last.and_then(|i| i.task_id.as_deref());
        status.current_task_title = last.and_then(|i| i.task_title.as_deref());
        status.last_verdict = last.and_then(|i| i.serve_verdict);
        status.stop_reason = Some(stop_reason);
        status.recent_iterations = recent_iterations(&iterations);
        status.skipped_tasks = skip_list.skipped_tasks();
        status.escalation = escalation.as_ref();
        status.epic_mode = epic_mode.label();
        status.current_epic = current_epic.as_ref().map(|(id, _)| id.as_str());
        self.telemetry.write_status(&status);

        let total_actions: usize = iterations.iter().map(|i| i.total_actions()).sum();
        self.telemetry
            .write_summary(started_at, ended_at, iterations.len(), total_actions, stop_reason);

        if self.human() {
            let rule = "=".repeat(44);
            println!("\n{rule}\n{}\n{rule}", "LOOP COMPLETE".bold());
            println!("Duration: {}", format_duration(duration));
            let blocked = iterations
                .iter()
                .filter(|i| i.outcome == IterationOutcome::Blocked)
                .count();
            println!(
                "Completed: {completed_count} | Failed: {failed_count} | Blocked: {blocked}"
            );
            if !iterations.is_empty() {
                println!(
                    "Success rate: {:.0}% | P50: {} | P95: {}",
                    metrics.success_rate * 100.0,
                    format_duration(metrics.p50_duration),
                    format_duration(metrics.p95_duration)
                );
            }
            let epic_count = remaining_ready_total - remaining_ready_work;
            if epic_count > 0 {
                println!("Remaining ready: {remaining_ready_work} work items ({epic_count} epics)");
            } else {
                println!("Remaining ready: {remaining_ready_work}");
            }
        }

        LoopRun {
            report: LoopReport {
                started_at,
                ended_at,
                iterations,
                stop_reason,
                completed_count,
                failed_count,
                duration_seconds: duration,
            },
            metrics,
            escalation,
            remaining_ready_work,
            remaining_ready_total,
        }
    }
}

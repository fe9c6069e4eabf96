//! One pass of the workflow state machine over a selected task:
//! cook → serve → tidy, with conditional plate / close-service, retry on
//! NEEDS_CHANGES, and completion detection over snapshot diffs.

use chrono::{DateTime, Utc};

use crate::config::LoopConfig;
use crate::events;
use crate::git::Git;
use crate::model::{
    BeadStatus, Delta, IssueType, IterationOutcome, IterationResult, Phase, PhaseResult,
    ServeVerdict, Signal, Snapshot,
};
use crate::runner;
use crate::shutdown::Shutdown;
use crate::telemetry::ProgressState;
use crate::tracker::{AncestorMap, Tracker};

/// Which task the assistant actually worked on, inferred from the snapshot
/// diff. The pre-selected target can differ from reality when the assistant
/// drills into an epic on its own.
pub fn detect_worked_task(before: &Snapshot, after: &Snapshot) -> Option<String> {
    // Moved into in_progress.
    let before_in_progress = before.in_progress_ids();
    if let Some(id) = after
        .in_progress
        .iter()
        .map(|b| b.id.as_str())
        .find(|id| !before_in_progress.contains(id))
    {
        return Some(id.to_string());
    }

    // Was ready, now closed.
    let before_closed = before.closed_ids();
    let after_ready = after.ready_ids();
    if let Some(id) = after
        .closed
        .iter()
        .map(|b| b.id.as_str())
        .find(|id| {
            !before_closed.contains(id)
                && before.ready.iter().any(|b| b.id == *id)
                && !after_ready.contains(id)
        })
    {
        return Some(id.to_string());
    }

    // Was in progress, now closed.
    let after_closed = after.closed_ids();
    before
        .in_progress
        .iter()
        .map(|b| b.id.as_str())
        .find(|id| after_closed.contains(id))
        .map(str::to_string)
}

/// Input the controller hands the engine for one iteration.
pub struct IterationContext<'a> {
    pub iteration: u32,
    pub max_iterations: u32,
    pub before: Snapshot,
    /// Pre-selected target task (id, title), if selection found one.
    pub target: Option<(String, String)>,
    /// Bead→epic map built once per iteration by the controller.
    pub ancestors: &'a AncestorMap,
}

pub struct Engine<'a> {
    config: &'a LoopConfig,
    tracker: &'a Tracker,
    git: &'a Git,
    shutdown: &'a Shutdown,
}

struct IterationState {
    actions: Vec<crate::model::Action>,
    output: String,
    serve_verdict: Option<ServeVerdict>,
    task_id: Option<String>,
}

enum CookLoopEnd {
    /// Work is ready for tidy (approved, kitchen-complete, skipped serve,
    /// or a timeout that still closed the task).
    Proceed,
    /// Retry budget exhausted without approval.
    Exhausted { last_failure: Option<FailureKind> },
    /// Cook reported there is nothing actionable.
    KitchenIdle,
    /// Review said stop.
    Blocked,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Timeout,
    Crash,
    Review,
}

fn classify_failure(result: &PhaseResult) -> FailureKind {
    if result.timed_out() {
        FailureKind::Timeout
    } else if result
        .error
        .as_deref()
        .map(|e| {
            e.starts_with("Spawn failed")
                || e.starts_with("Stream read error")
                || e.starts_with("No stdout")
                || e.starts_with("Cancelled")
        })
        .unwrap_or(false)
    {
        FailureKind::Crash
    } else {
        FailureKind::Review
    }
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a LoopConfig,
        tracker: &'a Tracker,
        git: &'a Git,
        shutdown: &'a Shutdown,
    ) -> Self {
        Self {
            config,
            tracker,
            git,
            shutdown,
        }
    }

    async fn run_phase_tracked(
        &self,
        phase: Phase,
        args: Option<&str>,
        progress: &mut Option<&mut ProgressState>,
    ) -> PhaseResult {
        if let Some(ps) = progress.as_deref_mut() {
            ps.start_phase(phase);
        }
        match progress.as_deref_mut() {
            Some(ps) => {
                let mut hook =
                    |count: usize, stamp: DateTime<Utc>| ps.update_progress(count, stamp);
                runner::run_phase(self.config, phase, args, self.shutdown, Some(&mut hook)).await
            }
            None => runner::run_phase(self.config, phase, args, self.shutdown, None).await,
        }
    }

    async fn task_title(&self, after: &Snapshot, task_id: &str) -> Option<String> {
        if let Some(bead) = after.by_id(task_id) {
            if !bead.title.is_empty() {
                return Some(bead.title.clone());
            }
        }
        self.tracker.show(task_id).await.map(|b| b.title)
    }

    async fn task_is_closed(&self, task_id: &str) -> bool {
        self.tracker
            .show(task_id)
            .await
            .map(|b| b.status == Some(BeadStatus::Closed))
            .unwrap_or(false)
    }

    /// Completion needs at least one definitive signal; KITCHEN_COMPLETE in
    /// the transcript alone is only supporting evidence.
    async fn check_task_completed(
        &self,
        task_id: Option<&str>,
        before: &Snapshot,
        after: &Snapshot,
        output: &str,
        streamed: &[Signal],
    ) -> (bool, String) {
        let mut definitive: Vec<&'static str> = Vec::new();
        let mut supporting: Vec<&'static str> = Vec::new();

        if streamed.contains(&Signal::ServeApproved) {
            definitive.push("serve_approved_stream");
        }

        let new_closed = after
            .closed
            .iter()
            .any(|b| !before.closed.iter().any(|p| p.id == b.id));
        let after_work = after.ready_work_ids();
        let after_in_progress = after.in_progress_ids();
        let disappeared = before
            .ready_work()
            .any(|b| !after_work.contains(&b.id.as_str()) && !after_in_progress.contains(&b.id.as_str()));
        if new_closed || disappeared {
            definitive.push("bead_closed");
        }

        if let Some(id) = task_id {
            if self.task_is_closed(id).await {
                definitive.push("bd_status_closed");
            }
        }

        if events::parse_serve_result(output)
            .map(|r| r.verdict == ServeVerdict::Approved)
            .unwrap_or(false)
        {
            definitive.push("serve_approved");
        }

        if events::detect_kitchen_complete(output) {
            supporting.push("kitchen_complete");
        }

        let completed = !definitive.is_empty();
        let mut all = definitive;
        all.extend(supporting);
        let reason = if all.is_empty() {
            "none".to_string()
        } else {
            all.join(",")
        };
        (completed, reason)
    }

    /// Cook/serve retry loop. Serve runs inside the loop so every rework
    /// attempt is re-reviewed; the rework feedback travels through the
    /// tracker's comment log, not through this process.
    async fn cook_until_served(
        &self,
        ctx: &IterationContext<'_>,
        state: &mut IterationState,
        streamed: &mut Vec<Signal>,
        progress: &mut Option<&mut ProgressState>,
    ) -> CookLoopEnd {
        let max_attempts = self.config.max_retries + 1;
        let mut last_failure: Option<FailureKind> = None;

        for attempt in 1..=max_attempts {
            tracing::info!(attempt, max_attempts, "cook phase");
            let cook = self.run_phase_tracked(Phase::Cook, None, progress).await;
            state.actions.extend(cook.actions.iter().cloned());
            state
                .output
                .push_str(&format!("=== COOK PHASE (attempt {attempt}) ===\n"));
            state.output.push_str(&cook.output);
            for signal in &cook.signals {
                if !streamed.contains(signal) {
                    streamed.push(*signal);
                }
            }

            if cook.timed_out() {
                // The assistant may have finished the task before the
                // deadline fired; the tracker is the authority.
                let after = self.tracker.snapshot().await;
                if state.task_id.is_none() {
                    state.task_id = detect_worked_task(&ctx.before, &after);
                }
                if let Some(id) = state.task_id.clone() {
                    if self.task_is_closed(&id).await {
                        tracing::info!(task = %id, "cook timed out but the task was closed");
                        return CookLoopEnd::Proceed;
                    }
                }
                tracing::warn!(attempt, "cook phase timed out");
                last_failure = Some(FailureKind::Timeout);
                continue;
            }

            if !cook.success {
                tracing::warn!(attempt, error = ?cook.error, "cook phase failed");
                last_failure = Some(classify_failure(&cook));
                continue;
            }

            let after_cook = self.tracker.snapshot().await;
            if state.task_id.is_none() {
                state.task_id = detect_worked_task(&ctx.before, &after_cook);
                tracing::debug!(task = ?state.task_id, "detected worked task");
            }

            if cook.has_signal(Signal::KitchenIdle) {
                return CookLoopEnd::KitchenIdle;
            }
            if cook.has_signal(Signal::KitchenComplete) {
                return CookLoopEnd::Proceed;
            }

            tracing::info!("serve phase");
            let serve = self.run_phase_tracked(Phase::Serve, None, progress).await;
            state.actions.extend(serve.actions.iter().cloned());
            state.output.push_str("\n=== SERVE PHASE ===\n");
            state.output.push_str(&serve.output);
            for signal in &serve.signals {
                if !streamed.contains(signal) {
                    streamed.push(*signal);
                }
            }

            if !serve.success {
                // Serve transport errors are transient; the work still moves
                // on to tidy.
                tracing::warn!(error = ?serve.error, "serve phase error, treating as SKIPPED");
                state.serve_verdict = Some(ServeVerdict::Skipped);
                return CookLoopEnd::Proceed;
            }

            let parsed = events::parse_serve_result(&serve.output);
            let verdict = match parsed {
                Some(result) => Some(result.verdict),
                None => {
                    if serve.has_signal(Signal::ServeApproved) {
                        Some(ServeVerdict::Approved)
                    } else if serve.has_signal(Signal::ServeNeedsChanges) {
                        Some(ServeVerdict::NeedsChanges)
                    } else {
                        tracing::debug!("no serve verdict found, assuming approved");
                        Some(ServeVerdict::Approved)
                    }
                }
            };
            state.serve_verdict = verdict;

            match verdict {
                Some(ServeVerdict::Approved) | Some(ServeVerdict::Skipped) => {
                    tracing::info!(verdict = ?verdict, "serve verdict");
                    return CookLoopEnd::Proceed;
                }
                Some(ServeVerdict::Blocked) => {
                    tracing::warn!("serve returned BLOCKED verdict");
                    return CookLoopEnd::Blocked;
                }
                Some(ServeVerdict::NeedsChanges) | None => {
                    last_failure = Some(FailureKind::Review);
                    if attempt >= max_attempts {
                        tracing::warn!("max cook retries reached with NEEDS_CHANGES");
                        break;
                    }
                    tracing::info!(attempt, "NEEDS_CHANGES, cook will re-read the review comments");
                    // The assistant reads rework feedback from the tracker's
                    // comment log; surface it in our own logs too.
                    if let Some(id) = state.task_id.clone() {
                        if let Some(comments) = self.tracker.comments_for(&id).await {
                            if let Some(feedback) =
                                events::parse_serve_feedback(&comments, attempt)
                            {
                                tracing::debug!(
                                    task = %id,
                                    attempt,
                                    issues = feedback.issues.len(),
                                    summary = %feedback.summary,
                                    "review feedback pending rework"
                                );
                            }
                        }
                    }
                }
            }
        }

        CookLoopEnd::Exhausted { last_failure }
    }

    /// Plate the finished feature, and when that completes the epic, run
    /// close-service and close the epic through the tracker.
    async fn feature_and_epic_completion(
        &self,
        task_id: &str,
        state: &mut IterationState,
        closed_epics: &mut Vec<String>,
        progress: &mut Option<&mut ProgressState>,
    ) {
        let Some(task) = self.tracker.show(task_id).await else {
            return;
        };
        let Some(feature_id) = task.parent else {
            return;
        };
        let Some(feature) = self.tracker.show(&feature_id).await else {
            return;
        };
        if feature.issue_type != IssueType::Feature {
            return;
        }
        let siblings = self.tracker.children(&feature_id).await;
        if siblings.is_empty()
            || siblings
                .iter()
                .any(|b| b.status != Some(BeadStatus::Closed))
        {
            return;
        }

        tracing::info!(feature = %feature_id, "feature complete, running plate phase");
        let plate = self
            .run_phase_tracked(Phase::Plate, Some(&feature_id), progress)
            .await;
        state.actions.extend(plate.actions.iter().cloned());
        state.output.push_str("\n=== PLATE PHASE ===\n");
        state.output.push_str(&plate.output);
        if !plate.success {
            tracing::warn!(error = ?plate.error, "plate phase error");
            return;
        }

        let Some(epic_id) = feature.parent else {
            return;
        };
        let Some(epic) = self.tracker.show(&epic_id).await else {
            return;
        };
        if !epic.is_epic() {
            return;
        }
        let children = self.tracker.children(&epic_id).await;
        if children.is_empty()
            || children
                .iter()
                .any(|b| b.status != Some(BeadStatus::Closed))
        {
            return;
        }

        tracing::info!(epic = %epic_id, "epic complete, running close-service phase");
        let close = self
            .run_phase_tracked(Phase::CloseService, Some(&epic_id), progress)
            .await;
        state.actions.extend(close.actions.iter().cloned());
        state.output.push_str("\n=== CLOSE-SERVICE PHASE ===\n");
        state.output.push_str(&close.output);
        if !close.success {
            tracing::warn!(error = ?close.error, "close-service phase error");
        }

        let eligible = self.tracker.close_eligible_epics().await;
        if eligible.iter().any(|id| id == &epic_id) {
            if self.tracker.close_eligible_epics_apply().await {
                tracing::info!(epic = %epic_id, "closed epic");
                closed_epics.push(epic_id);
            }
        }
    }

    fn finish(
        ctx: &IterationContext<'_>,
        state: IterationState,
        outcome: IterationOutcome,
        after: &Snapshot,
        task_title: Option<String>,
        commit_hash: Option<String>,
        closed_epics: Vec<String>,
        started: DateTime<Utc>,
    ) -> IterationResult {
        let (intent, before_state, after_state) = events::parse_intent(&state.output);
        let delta = Delta::compute(&ctx.before, after);
        IterationResult {
            iteration: ctx.iteration,
            task_id: state.task_id,
            task_title,
            outcome,
            duration_seconds: Utc::now()
                .signed_duration_since(started)
                .num_milliseconds() as f64
                / 1000.0,
            serve_verdict: state.serve_verdict,
            commit_hash,
            before_ready: ctx.before.ready.len(),
            before_in_progress: ctx.before.in_progress.len(),
            after_ready: after.ready.len(),
            after_in_progress: after.in_progress.len(),
            intent,
            before_state,
            after_state,
            actions: state.actions,
            delta: if delta.is_empty() { None } else { Some(delta) },
            closed_epics,
        }
    }

    pub async fn run_iteration(
        &self,
        ctx: IterationContext<'_>,
        mut progress: Option<&mut ProgressState>,
    ) -> IterationResult {
        let started = Utc::now();
        tracing::info!(
            iteration = ctx.iteration,
            max_iterations = ctx.max_iterations,
            "starting iteration"
        );

        if ctx.before.ready_work().next().is_none() {
            tracing::info!(
                ready = ctx.before.ready.len(),
                "no work items ready"
            );
            return IterationResult {
                iteration: ctx.iteration,
                task_id: None,
                task_title: None,
                outcome: IterationOutcome::NoWork,
                duration_seconds: 0.0,
                serve_verdict: None,
                commit_hash: None,
                before_ready: ctx.before.ready.len(),
                before_in_progress: ctx.before.in_progress.len(),
                after_ready: ctx.before.ready.len(),
                after_in_progress: ctx.before.in_progress.len(),
                intent: None,
                before_state: None,
                after_state: None,
                actions: Vec::new(),
                delta: None,
                closed_epics: Vec::new(),
            };
        }

        // Branch discipline: be on the target's epic branch before cook.
        // A failed switch degrades to cooking on the current branch.
        if let Some((target_id, _)) = &ctx.target {
            if let Some(Some(epic_id)) = ctx.ancestors.get(target_id) {
                let (branch, created) = self.git.ensure_epic_branch(epic_id).await;
                if let Some(branch) = branch {
                    tracing::info!(%branch, created, "epic branch ensured");
                }
            }
        }

        let mut state = IterationState {
            actions: Vec::new(),
            output: String::new(),
            serve_verdict: None,
            task_id: ctx.target.as_ref().map(|(id, _)| id.clone()),
        };
        let mut streamed: Vec<Signal> = Vec::new();

        let end = self
            .cook_until_served(&ctx, &mut state, &mut streamed, &mut progress)
            .await;

        match end {
            CookLoopEnd::KitchenIdle => {
                let after = self.tracker.snapshot().await;
                tracing::info!("kitchen idle: no actionable work");
                let title = match &state.task_id {
                    Some(id) => self.task_title(&after, id).await,
                    None => None,
                };
                let commit = self.git.latest_commit().await;
                return Self::finish(
                    &ctx,
                    state,
                    IterationOutcome::NoActionableWork,
                    &after,
                    title,
                    commit,
                    Vec::new(),
                    started,
                );
            }
            CookLoopEnd::Blocked => {
                let after = self.tracker.snapshot().await;
                let title = match &state.task_id {
                    Some(id) => self.task_title(&after, id).await,
                    None => None,
                };
                let commit = self.git.latest_commit().await;
                return Self::finish(
                    &ctx,
                    state,
                    IterationOutcome::Blocked,
                    &after,
                    title,
                    commit,
                    Vec::new(),
                    started,
                );
            }
            CookLoopEnd::Exhausted { last_failure } => {
                let after = self.tracker.snapshot().await;
                let outcome = match last_failure {
                    Some(FailureKind::Timeout) => IterationOutcome::Timeout,
                    Some(FailureKind::Crash) => IterationOutcome::Crashed,
                    _ => IterationOutcome::NeedsRetry,
                };
                let title = match &state.task_id {
                    Some(id) => self.task_title(&after, id).await,
                    None => None,
                };
                let commit = self.git.latest_commit().await;
                return Self::finish(&ctx, state, outcome, &after, title, commit, Vec::new(), started);
            }
            CookLoopEnd::Proceed => {}
        }

        tracing::info!("tidy phase");
        let tidy = self
            .run_phase_tracked(Phase::Tidy, None, &mut progress)
            .await;
        state.actions.extend(tidy.actions.iter().cloned());
        state.output.push_str("\n=== TIDY PHASE ===\n");
        state.output.push_str(&tidy.output);
        if !tidy.success {
            // Concerning but never outcome-changing.
            tracing::warn!(error = ?tidy.error, "tidy phase error");
        }

        let after = self.tracker.snapshot().await;
        if let Some(id) = detect_worked_task(&ctx.before, &after) {
            state.task_id = Some(id);
        }

        let (completed, reason) = self
            .check_task_completed(
                state.task_id.as_deref(),
                &ctx.before,
                &after,
                &state.output,
                &streamed,
            )
            .await;
        tracing::debug!(completed, %reason, "completion check");

        let mut closed_epics: Vec<String> = Vec::new();
        if completed {
            if let Some(id) = state.task_id.clone() {
                self.feature_and_epic_completion(&id, &mut state, &mut closed_epics, &mut progress)
                    .await;
            }
        }

        let outcome = if completed {
            IterationOutcome::Completed
        } else {
            IterationOutcome::NeedsRetry
        };
        let title = match &state.task_id {
            Some(id) => self.task_title(&after, id).await,
            None => None,
        };
        let commit = self.git.latest_commit().await;
        tracing::info!(
            iteration = ctx.iteration,
            outcome = outcome.as_str(),
            task = ?state.task_id,
            actions = state.actions.len(),
            "iteration finished"
        );
        Self::finish(&ctx, state, outcome, &after, title, commit, closed_epics, started)
    }
}

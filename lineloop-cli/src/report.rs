use lineloop_core::controller::LoopRun;
use lineloop_core::model::{IterationResult, ServeVerdict};
use serde_json::{Value, json};

fn iteration_json(result: &IterationResult) -> Value {
    let mut record = json!({
        "iteration": result.iteration,
        "task_id": result.task_id,
        "task_title": result.task_title,
        "intent": result.intent,
        "before_state": result.before_state,
        "after_state": result.after_state,
        "outcome": result.outcome.as_str(),
        "duration_seconds": result.duration_seconds,
        "serve_verdict": result.serve_verdict.map(ServeVerdict::as_str),
        "commit_hash": result.commit_hash,
        "beads_before": {
            "ready": result.before_ready,
            "in_progress": result.before_in_progress,
        },
        "beads_after": {
            "ready": result.after_ready,
            "in_progress": result.after_in_progress,
        },
        "findings_count": result.findings_count(),
    });
    if let Some(delta) = &result.delta {
        let beads = |items: &[lineloop_core::model::Bead]| -> Vec<Value> {
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

/// Machine-readable final report, printed with `--json` and written with
/// `--output`.
pub fn build(run: &LoopRun) -> Value {
    json!({
        "stop_reason": run.report.stop_reason.as_str(),
        "summary": {
            "completed": run.report.completed_count,
            "failed": run.report.failed_count,
            "duration_seconds": run.report.duration_seconds,
        },
        "metrics": run.metrics,
        "iterations": run.report.iterations.iter().map(iteration_json).collect::<Vec<_>>(),
    })
}

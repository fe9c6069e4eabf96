//! End-to-end scenarios driving the full controller against stub
//! `bd` / `claude` / `git` executables.

use crate::fixtures::*;

use lineloop_core::controller::LoopController;
use lineloop_core::model::{IterationOutcome, ServeVerdict, StopReason};
use lineloop_core::shutdown::Shutdown;
use lineloop_core::telemetry::Telemetry;
use serde_json::Value;

fn telemetry_for(fx: &LoopFixture) -> (Telemetry, std::path::PathBuf, std::path::PathBuf) {
    let status = fx.path().join("status.json");
    let history = fx.path().join("history.jsonl");
    (
        Telemetry::new(Some(status.clone()), Some(history.clone()), "fixture".to_string()),
        status,
        history,
    )
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap_or_default()).unwrap_or(Value::Null)
}

const APPROVED_EVENT: &str = r#"printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"SERVE_RESULT\nverdict: APPROVED\ncontinue: true\nblocking_issues: 0"}]}}'"#;

#[tokio::test]
async fn happy_path_single_task_completes_and_loop_drains() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", &format!("[{}]", ready_task("t1", "first task")))?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-t1.json",
        r#"{"id":"t1","title":"first task","issue_type":"task","status":"ready"}"#,
    )?;
    fx.write_executable(
        "claude",
        &format!(
            r#"dir="$(dirname "$0")/../state"
case "$2" in
  /line:cook*)
    echo '[]' > "$dir/ready.json"
    echo '[{{"id":"t1","title":"first task","issue_type":"task","status":"closed"}}]' > "$dir/closed.json"
    echo '{{"id":"t1","title":"first task","issue_type":"task","status":"closed"}}' > "$dir/show-t1.json"
    echo '{{"type":"assistant","message":{{"content":[{{"type":"tool_use","id":"tu_1","name":"Edit","input":{{"file_path":"file.txt"}}}}]}}}}'
    echo '{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"tu_1","content":"ok","is_error":false}}]}}}}'
    ;;
  /line:serve*)
    {APPROVED_EVENT}
    ;;
esac
exit 0"#
        ),
    )?;

    let (telemetry, status_path, history_path) = telemetry_for(&fx);
    let run = LoopController::new(fx.config(), telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::NoWork);
    assert_eq!(run.report.stop_reason.exit_code(), 0);
    assert_eq!(run.report.completed_count, 1);
    assert_eq!(run.report.iterations.len(), 1);
    let it = &run.report.iterations[0];
    assert_eq!(it.outcome, IterationOutcome::Completed);
    assert_eq!(it.task_id.as_deref(), Some("t1"));
    assert_eq!(it.serve_verdict, Some(ServeVerdict::Approved));
    assert_eq!(it.commit_hash.as_deref(), Some("abc1234"));
    assert_eq!(it.actions.len(), 1);
    let delta = it.delta.as_ref().expect("delta recorded");
    assert_eq!(delta.newly_closed.len(), 1);
    assert_eq!(delta.newly_closed[0].id, "t1");

    let status = read_json(&status_path);
    assert_eq!(status["running"], Value::Bool(false));
    assert_eq!(status["tasks_completed"], serde_json::json!(1));
    assert_eq!(status["stop_reason"], serde_json::json!("no_work"));

    let history = std::fs::read_to_string(&history_path)?;
    let records: Vec<Value> = history
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["outcome"], serde_json::json!("completed"));
    assert_eq!(records[1]["type"], serde_json::json!("loop_summary"));
    Ok(())
}

#[tokio::test]
async fn rework_then_approve_runs_two_cook_attempts_in_one_iteration() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", &format!("[{}]", ready_task("t1", "needs polish")))?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-t1.json",
        r#"{"id":"t1","title":"needs polish","issue_type":"task","status":"ready"}"#,
    )?;
    fx.write_executable(
        "claude",
        &format!(
            r#"dir="$(dirname "$0")/../state"
case "$2" in
  /line:cook*)
    echo x >> "$dir/cook_count"
    if [ -f "$dir/served_once" ]; then
      echo '[]' > "$dir/ready.json"
      echo '[{{"id":"t1","title":"needs polish","issue_type":"task","status":"closed"}}]' > "$dir/closed.json"
      echo '{{"id":"t1","title":"needs polish","issue_type":"task","status":"closed"}}' > "$dir/show-t1.json"
    fi
    ;;
  /line:serve*)
    if [ -f "$dir/served_once" ]; then
      {APPROVED_EVENT}
    else
      touch "$dir/served_once"
      printf '%s\n' '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"SERVE_RESULT\nverdict: NEEDS_CHANGES\ncontinue: false\nblocking_issues: 1"}}]}}}}'
    fi
    ;;
esac
exit 0"#
        ),
    )?;

    let (telemetry, _, _) = telemetry_for(&fx);
    let run = LoopController::new(fx.config(), telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::NoWork);
    assert_eq!(run.report.completed_count, 1);
    assert_eq!(run.report.iterations.len(), 1, "rework stays inside one iteration");
    let it = &run.report.iterations[0];
    assert_eq!(it.outcome, IterationOutcome::Completed);
    assert_eq!(it.serve_verdict, Some(ServeVerdict::Approved));
    assert_eq!(fx.read_state("cook_count").lines().count(), 2);
    Ok(())
}

#[tokio::test]
async fn cook_timeout_with_closed_task_still_completes() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", &format!("[{}]", ready_task("t1", "slow task")))?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-t1.json",
        r#"{"id":"t1","title":"slow task","issue_type":"task","status":"ready"}"#,
    )?;
    // Cook closes the task, then hangs past its deadline.
    fx.write_executable(
        "claude",
        r#"dir="$(dirname "$0")/../state"
case "$2" in
  /line:cook*)
    echo '[]' > "$dir/ready.json"
    echo '[{"id":"t1","title":"slow task","issue_type":"task","status":"closed"}]' > "$dir/closed.json"
    echo '{"id":"t1","title":"slow task","issue_type":"task","status":"closed"}' > "$dir/show-t1.json"
    sleep 30
    ;;
esac
exit 0"#,
    )?;

    let mut config = fx.config();
    config.phase_timeouts.cook = Duration::from_secs(2);
    let (telemetry, _, _) = telemetry_for(&fx);
    let run = LoopController::new(config, telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::NoWork);
    assert_eq!(run.report.completed_count, 1);
    let it = &run.report.iterations[0];
    assert_eq!(it.outcome, IterationOutcome::Completed);
    assert_eq!(it.task_id.as_deref(), Some("t1"));
    Ok(())
}

#[tokio::test]
async fn blocked_verdict_with_stop_on_blocked_exits_one() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", &format!("[{}]", ready_task("t1", "stuck task")))?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_executable(
        "claude",
        r#"case "$2" in
  /line:serve*)
    printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"SERVE_RESULT\nverdict: BLOCKED\ncontinue: false\nblocking_issues: 1"}]}}'
    ;;
esac
exit 0"#,
    )?;

    let mut config = fx.config();
    config.stop_on_blocked = true;
    let (telemetry, status_path, _) = telemetry_for(&fx);
    let run = LoopController::new(config, telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::Blocked);
    assert_eq!(run.report.stop_reason.exit_code(), 1);
    assert_eq!(run.report.iterations.len(), 1);
    assert_eq!(run.report.iterations[0].outcome, IterationOutcome::Blocked);
    assert_eq!(
        run.report.iterations[0].serve_verdict,
        Some(ServeVerdict::Blocked)
    );
    let status = read_json(&status_path);
    assert_eq!(status["stop_reason"], serde_json::json!("blocked"));
    Ok(())
}

#[tokio::test]
async fn circuit_breaker_trips_after_consecutive_crashes() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "ready.json",
        &format!(
            "[{},{},{}]",
            ready_task("t1", "one"),
            ready_task("t2", "two"),
            ready_task("t3", "three")
        ),
    )?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;

    let mut config = fx.config();
    // A missing assistant binary makes every cook spawn fail instantly.
    config.assistant_bin = fx.path().join("bin").join("absent");
    config.failure_threshold = 3;
    config.max_retries = 0;
    let (telemetry, status_path, _) = telemetry_for(&fx);
    let run = LoopController::new(config, telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::CircuitBreaker);
    assert_eq!(run.report.stop_reason.exit_code(), 3);
    assert_eq!(run.report.iterations.len(), 3);
    assert!(run
        .report
        .iterations
        .iter()
        .all(|i| i.outcome == IterationOutcome::Crashed));
    let escalation = run.escalation.expect("escalation assembled");
    assert!(!escalation.suggested_actions.is_empty());

    let status = read_json(&status_path);
    assert_eq!(status["stop_reason"], serde_json::json!("circuit_breaker"));
    assert!(status["escalation"]["suggested_actions"].is_array());
    Ok(())
}

#[tokio::test]
async fn empty_backlog_exits_immediately_with_final_status() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", "[]")?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_executable("claude", "exit 0")?;

    let (telemetry, status_path, history_path) = telemetry_for(&fx);
    let run = LoopController::new(fx.config(), telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::NoWork);
    assert_eq!(run.report.stop_reason.exit_code(), 0);
    assert!(run.report.iterations.is_empty());

    let status = read_json(&status_path);
    assert_eq!(status["running"], Value::Bool(false));
    assert_eq!(status["stop_reason"], serde_json::json!("no_work"));

    let history = std::fs::read_to_string(&history_path)?;
    let last: Value = serde_json::from_str(history.lines().last().unwrap())?;
    assert_eq!(last["type"], serde_json::json!("loop_summary"));
    Ok(())
}

#[tokio::test]
async fn invalid_epic_id_stops_before_any_work() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state("ready.json", &format!("[{}]", ready_task("t1", "one")))?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    // show for the alleged epic returns a task, not an epic.
    fx.write_state(
        "show-nope.json",
        r#"{"id":"nope","title":"not an epic","issue_type":"task","status":"ready"}"#,
    )?;
    fx.write_executable("claude", "exit 0")?;

    let mut config = fx.config();
    config.epic_mode = lineloop_core::config::EpicMode::Explicit("nope".to_string());
    let (telemetry, _, _) = telemetry_for(&fx);
    let run = LoopController::new(config, telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::InvalidEpic);
    assert_eq!(run.report.stop_reason.exit_code(), 2);
    assert!(run.report.iterations.is_empty());
    Ok(())
}

#[tokio::test]
async fn epic_completion_merges_branch_and_records_completion() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "ready.json",
        r#"[{"id":"t1","title":"last task","issue_type":"task","status":"ready","parent":"f1"}]"#,
    )?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-t1.json",
        r#"{"id":"t1","title":"last task","issue_type":"task","status":"ready","parent":"f1"}"#,
    )?;
    fx.write_state(
        "show-f1.json",
        r#"{"id":"f1","title":"the feature","issue_type":"feature","status":"in_progress","parent":"e1"}"#,
    )?;
    fx.write_state(
        "show-e1.json",
        r#"{"id":"e1","title":"the epic","issue_type":"epic","status":"in_progress"}"#,
    )?;
    fx.write_state(
        "children-f1.json",
        r#"[{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}]"#,
    )?;
    fx.write_state(
        "children-e1.json",
        r#"[{"id":"f1","title":"the feature","issue_type":"feature","status":"closed","parent":"e1"}]"#,
    )?;
    fx.write_state("close-eligible.json", r#"["e1"]"#)?;
    fx.write_executable(
        "claude",
        &format!(
            r#"dir="$(dirname "$0")/../state"
case "$2" in
  /line:cook*)
    echo '[]' > "$dir/ready.json"
    echo '[{{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}}]' > "$dir/closed.json"
    echo '{{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}}' > "$dir/show-t1.json"
    ;;
  /line:serve*)
    {APPROVED_EVENT}
    ;;
esac
exit 0"#
        ),
    )?;

    let (telemetry, status_path, _) = telemetry_for(&fx);
    let run = LoopController::new(fx.config(), telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::NoWork);
    assert_eq!(run.report.completed_count, 1);
    let it = &run.report.iterations[0];
    assert_eq!(it.outcome, IterationOutcome::Completed);
    assert_eq!(it.closed_epics, vec!["e1".to_string()]);

    let log = fx.git_log().join("\n");
    assert!(
        log.contains("checkout epic/e1"),
        "branch was ensured before cook: {log}"
    );
    assert!(
        log.contains("merge --no-ff epic/e1 -m Merge epic e1: the epic"),
        "epic branch merged with --no-ff: {log}"
    );
    assert!(log.contains("push origin main"), "main pushed: {log}");

    let status = read_json(&status_path);
    assert_eq!(status["epic_completions"][0]["id"], serde_json::json!("e1"));
    Ok(())
}

#[tokio::test]
async fn break_on_epic_stops_with_epic_complete() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "ready.json",
        r#"[{"id":"t1","title":"last task","issue_type":"task","status":"ready","parent":"f1"}]"#,
    )?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-t1.json",
        r#"{"id":"t1","title":"last task","issue_type":"task","status":"ready","parent":"f1"}"#,
    )?;
    fx.write_state(
        "show-f1.json",
        r#"{"id":"f1","title":"the feature","issue_type":"feature","status":"in_progress","parent":"e1"}"#,
    )?;
    fx.write_state(
        "show-e1.json",
        r#"{"id":"e1","title":"the epic","issue_type":"epic","status":"in_progress"}"#,
    )?;
    fx.write_state(
        "children-f1.json",
        r#"[{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}]"#,
    )?;
    fx.write_state(
        "children-e1.json",
        r#"[{"id":"f1","title":"the feature","issue_type":"feature","status":"closed","parent":"e1"}]"#,
    )?;
    fx.write_state("close-eligible.json", r#"["e1"]"#)?;
    fx.write_executable(
        "claude",
        &format!(
            r#"dir="$(dirname "$0")/../state"
case "$2" in
  /line:cook*)
    echo '[]' > "$dir/ready.json"
    echo '[{{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}}]' > "$dir/closed.json"
    echo '{{"id":"t1","title":"last task","issue_type":"task","status":"closed","parent":"f1"}}' > "$dir/show-t1.json"
    ;;
  /line:serve*)
    {APPROVED_EVENT}
    ;;
esac
exit 0"#
        ),
    )?;

    let mut config = fx.config();
    config.break_on_epic = true;
    let (telemetry, _, _) = telemetry_for(&fx);
    let run = LoopController::new(config, telemetry, Shutdown::new())
        .run()
        .await;

    assert_eq!(run.report.stop_reason, StopReason::EpicComplete);
    assert_eq!(run.report.stop_reason.exit_code(), 0);
    Ok(())
}

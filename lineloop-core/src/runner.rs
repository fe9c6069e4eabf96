//! Runs one assistant phase as a child process, multiplexing its stream-JSON
//! stdout against a one-second tick so deadlines, idle detection and
//! cancellation stay responsive without busy-waiting.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::{IdleAction, LoopConfig};
use crate::events;
use crate::model::{Action, Phase, PhaseResult, Signal};
use crate::shutdown::Shutdown;

/// Called with (cumulative action count, timestamp of the newest action)
/// whenever new tool actions are observed.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, DateTime<Utc>);

const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// SIGTERM, wait up to five seconds, then SIGKILL.
async fn stop_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_err() {
        tracing::warn!("child did not respond to SIGTERM, sending SIGKILL");
        let _ = child.kill().await;
        let _ = tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
    }
}

enum PhaseEnd {
    Eof,
    Timeout,
    IdleTerminated,
    EarlyCompletion,
    Cancelled,
    ReadError(std::io::Error),
}

/// Invoke a single workflow phase of the assistant CLI and collect its
/// stream. Success is exit code zero or an explicit early-completion signal.
pub async fn run_phase(
    config: &LoopConfig,
    phase: Phase,
    args: Option<&str>,
    shutdown: &Shutdown,
    mut on_progress: Option<ProgressFn<'_>>,
) -> PhaseResult {
    let timeout = config.phase_timeouts.for_phase(phase);
    let mut skill = format!("/line:{phase}");
    if let Some(args) = args {
        skill = format!("{skill} {args}");
    }
    tracing::debug!(%phase, %skill, timeout_secs = timeout.as_secs(), "running phase");

    let start = Instant::now();
    let mut output = String::new();
    let mut actions: Vec<Action> = Vec::new();
    let mut pending: HashMap<String, usize> = HashMap::new();
    let mut signals: Vec<Signal> = Vec::new();

    let fail = |output: String, actions: Vec<Action>, signals: Vec<Signal>, error: String, start: Instant| {
        PhaseResult {
            phase,
            success: false,
            output,
            exit_code: -1,
            duration_seconds: start.elapsed().as_secs_f64(),
            signals,
            actions,
            error: Some(error),
            early_completion: false,
        }
    };

    let mut child = match Command::new(&config.assistant_bin)
        .arg("-p")
        .arg(&skill)
        .arg("--dangerously-skip-permissions")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .current_dir(&config.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(%phase, "failed to spawn assistant: {err}");
            return fail(output, actions, signals, format!("Spawn failed: {err}"), start);
        }
    };

    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.kill().await;
            return fail(output, actions, signals, "No stdout pipe".to_string(), start);
        }
    };
    let mut lines = BufReader::new(stdout).lines();

    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_action_time: Option<Instant> = None;
    let mut last_action_stamp: Option<DateTime<Utc>> = None;
    let mut idle_warned = false;

    let end = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    output.push_str(&line);
                    output.push('\n');
                    let Some(event) = events::parse_event(&line) else {
                        continue;
                    };

                    let mut saw_new_action = false;
                    for block in events::tool_uses_from_assistant(&event) {
                        let action = events::action_from_tool_use(&block);
                        pending.insert(action.tool_use_id.clone(), actions.len());
                        last_action_stamp = Some(action.timestamp);
                        actions.push(action);
                        saw_new_action = true;
                    }
                    if saw_new_action {
                        last_action_time = Some(Instant::now());
                        idle_warned = false;
                        if let (Some(hook), Some(stamp)) = (on_progress.as_mut(), last_action_stamp) {
                            hook(actions.len(), stamp);
                        }
                    }

                    for block in events::tool_results_from_user(&event) {
                        let id = block
                            .get("tool_use_id")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("");
                        if let Some(idx) = pending.remove(id) {
                            events::apply_tool_result(&mut actions[idx], &block);
                        }
                    }

                    let text = events::text_from_assistant(&event);
                    if !text.is_empty() {
                        let mut early = false;
                        for signal in events::scan_signals(&text) {
                            if !signals.contains(&signal) {
                                signals.push(signal);
                                if signal == Signal::PhaseComplete {
                                    early = true;
                                }
                            }
                        }
                        if early {
                            tracing::info!(%phase, "phase signaled completion, terminating early");
                            break PhaseEnd::EarlyCompletion;
                        }
                    }
                }
                Ok(None) => break PhaseEnd::Eof,
                Err(err) => break PhaseEnd::ReadError(err),
            },
            _ = tokio::time::sleep_until(deadline) => break PhaseEnd::Timeout,
            _ = shutdown.cancelled() => break PhaseEnd::Cancelled,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                // Tick: idle bookkeeping only; deadline and cancellation have
                // their own select arms.
                if config.idle_timeout > Duration::ZERO {
                    if let Some(last) = last_action_time {
                        let idle_for = last.elapsed();
                        if idle_for >= config.idle_timeout {
                            match config.idle_action {
                                IdleAction::Terminate => break PhaseEnd::IdleTerminated,
                                IdleAction::Warn => {
                                    if !idle_warned {
                                        tracing::warn!(
                                            %phase,
                                            idle_secs = idle_for.as_secs(),
                                            threshold_secs = config.idle_timeout.as_secs(),
                                            "phase is idle"
                                        );
                                        idle_warned = true;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    };

    let duration = start.elapsed();
    match end {
        PhaseEnd::Eof => {
            let exit_code = match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                Ok(Err(err)) => {
                    tracing::warn!(%phase, "wait failed: {err}");
                    -1
                }
                Err(_) => {
                    stop_child(&mut child).await;
                    return fail(
                        output,
                        actions,
                        signals,
                        format!("Timeout after {}s", timeout.as_secs()),
                        start,
                    );
                }
            };
            let early_completion = signals.contains(&Signal::PhaseComplete);
            let success = exit_code == 0 || early_completion;
            tracing::debug!(
                %phase,
                elapsed_secs = duration.as_secs_f64(),
                exit_code,
                ?signals,
                "phase completed"
            );
            PhaseResult {
                phase,
                success,
                output,
                exit_code,
                duration_seconds: duration.as_secs_f64(),
                signals,
                actions,
                error: if success {
                    None
                } else {
                    Some(format!("Exit code {exit_code}"))
                },
                early_completion,
            }
        }
        PhaseEnd::EarlyCompletion => {
            stop_child(&mut child).await;
            PhaseResult {
                phase,
                success: true,
                output,
                exit_code: 0,
                duration_seconds: start.elapsed().as_secs_f64(),
                signals,
                actions,
                error: None,
                early_completion: true,
            }
        }
        PhaseEnd::Timeout => {
            tracing::warn!(%phase, elapsed_secs = duration.as_secs_f64(), "phase timed out");
            stop_child(&mut child).await;
            fail(
                output,
                actions,
                signals,
                format!("Timeout after {}s", timeout.as_secs()),
                start,
            )
        }
        PhaseEnd::IdleTerminated => {
            tracing::warn!(
                %phase,
                idle_secs = config.idle_timeout.as_secs(),
                "idle threshold hit, terminating phase"
            );
            if !signals.contains(&Signal::IdleTerminated) {
                signals.push(Signal::IdleTerminated);
            }
            stop_child(&mut child).await;
            let idle_secs = config.idle_timeout.as_secs();
            fail(
                output,
                actions,
                signals,
                format!("Idle timeout after {idle_secs}s without tool actions"),
                start,
            )
        }
        PhaseEnd::Cancelled => {
            tracing::info!(%phase, "shutdown requested mid-phase, stopping child");
            stop_child(&mut child).await;
            fail(output, actions, signals, "Cancelled by shutdown request".to_string(), start)
        }
        PhaseEnd::ReadError(err) => {
            tracing::warn!(%phase, "error reading assistant stream: {err}");
            stop_child(&mut child).await;
            fail(output, actions, signals, format!("Stream read error: {err}"), start)
        }
    }
}

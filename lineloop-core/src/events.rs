//! Stateless parsing of the assistant's stream-JSON events and the in-band
//! text blocks (SERVE_RESULT, review feedback, INTENT) the workflow relies on.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::{
    INPUT_SUMMARY_COMMAND_LENGTH, INPUT_SUMMARY_FILE_PATH_LENGTH, INPUT_SUMMARY_PATTERN_LENGTH,
    OUTPUT_SUMMARY_MAX_LENGTH,
};
use crate::model::{
    Action, ServeFeedback, ServeIssue, ServeResult, ServeVerdict, Severity, Signal,
};

/// Parse a single line of stream-JSON output. Empty or invalid lines are
/// not events; the raw transcript keeps them anyway.
pub fn parse_event(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn message_content(event: &Value, event_type: &str) -> Vec<Value> {
    if event.get("type").and_then(Value::as_str) != Some(event_type) {
        return Vec::new();
    }
    event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Concatenated text of all text blocks in an assistant message event.
pub fn text_from_assistant(event: &Value) -> String {
    message_content(event, "assistant")
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// tool_use blocks of an assistant message event.
pub fn tool_uses_from_assistant(event: &Value) -> Vec<Value> {
    message_content(event, "assistant")
        .into_iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        .collect()
}

/// tool_result blocks of a user message event (the assistant protocol sends
/// tool results back as user messages).
pub fn tool_results_from_user(event: &Value) -> Vec<Value> {
    message_content(event, "user")
        .into_iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .collect()
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn clip_ellipsis(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", clip(s, max))
    } else {
        s.to_string()
    }
}

/// Concise, tool-aware summary of a tool invocation's input.
pub fn summarize_tool_input(tool_name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("");
    match tool_name {
        "Read" => clip(field("file_path"), INPUT_SUMMARY_FILE_PATH_LENGTH),
        "Edit" => clip(
            &format!("{} (edit)", field("file_path")),
            INPUT_SUMMARY_FILE_PATH_LENGTH,
        ),
        "Write" => clip(
            &format!("{} (new)", field("file_path")),
            INPUT_SUMMARY_FILE_PATH_LENGTH,
        ),
        "Bash" => clip_ellipsis(field("command"), INPUT_SUMMARY_COMMAND_LENGTH),
        "Glob" | "Grep" => clip(field("pattern"), INPUT_SUMMARY_PATTERN_LENGTH),
        "Task" => clip(
            &format!("Task: {}", field("description")),
            INPUT_SUMMARY_COMMAND_LENGTH,
        ),
        _ => clip_ellipsis(
            &serde_json::to_string(input).unwrap_or_default(),
            INPUT_SUMMARY_COMMAND_LENGTH,
        ),
    }
}

/// New Action from a tool_use block; the result fields are filled in when
/// the matching tool_result arrives.
pub fn action_from_tool_use(block: &Value) -> Action {
    let tool_name = block
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let empty = Value::Null;
    let input = block.get("input").unwrap_or(&empty);
    Action {
        input_summary: summarize_tool_input(&tool_name, input),
        tool_name,
        tool_use_id: block
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        output_summary: String::new(),
        success: true,
        timestamp: Utc::now(),
        duration_ms: None,
    }
}

/// Fold a tool_result block into its pending Action: outcome, truncated
/// output summary (ERROR-prefixed on failure), and elapsed duration.
pub fn apply_tool_result(action: &mut Action, block: &Value) {
    let elapsed = Utc::now().signed_duration_since(action.timestamp);
    action.duration_ms = u64::try_from(elapsed.num_milliseconds()).ok();

    let is_error = block
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    action.success = !is_error;

    let content = match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return,
    };

    action.output_summary = clip_ellipsis(&content, OUTPUT_SUMMARY_MAX_LENGTH);
    if is_error && !action.output_summary.starts_with("ERROR:") {
        action.output_summary = format!("ERROR: {}", action.output_summary);
    }
}

pub fn detect_kitchen_complete(output: &str) -> bool {
    output.contains("KITCHEN_COMPLETE") || output.contains("KITCHEN COMPLETE")
}

pub fn detect_kitchen_idle(output: &str) -> bool {
    output.contains("KITCHEN_IDLE") || output.contains("KITCHEN IDLE")
}

/// Signals present in one assistant text block. Serve verdict signals only
/// count inside a SERVE_RESULT block so prose mentioning "APPROVED" does not
/// trip them.
pub fn scan_signals(text: &str) -> Vec<Signal> {
    let mut signals = Vec::new();
    if text.contains("SERVE_RESULT") {
        if text.contains("APPROVED") {
            signals.push(Signal::ServeApproved);
        } else if text.contains("NEEDS_CHANGES") {
            signals.push(Signal::ServeNeedsChanges);
        } else if text.contains("BLOCKED") {
            signals.push(Signal::ServeBlocked);
        }
    }
    if detect_kitchen_complete(text) {
        signals.push(Signal::KitchenComplete);
    }
    if detect_kitchen_idle(text) {
        signals.push(Signal::KitchenIdle);
    }
    if text.contains("<phase_complete>DONE</phase_complete>") {
        signals.push(Signal::PhaseComplete);
    }
    signals
}

static SERVE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    // Tolerates the │ gutter the assistant sometimes renders around the block.
    Regex::new(
        r"(?is)SERVE_RESULT\s*\n(?:│\s*)?verdict:\s*(\w+).*?(?:│\s*)?continue:\s*(true|false).*?(?:│\s*)?blocking_issues:\s*(\d+)",
    )
    .expect("serve block regex")
});
static SERVE_VERDICT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)verdict:\s*(APPROVED|NEEDS_CHANGES|BLOCKED|SKIPPED)").expect("verdict regex")
});
static SERVE_CONTINUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)continue:\s*(true|false)").expect("continue regex"));
static SERVE_BLOCKING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)blocking_issues:\s*(\d+)").expect("blocking regex"));
static SERVE_NEXT_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)next_step:\s*(\S+)").expect("next_step regex"));

/// Parse the SERVE_RESULT block from serve phase output.
///
/// Prefers the compact tabular block; falls back to loose field-by-field
/// matching with permissive defaults (`continue=true`, `blocking_issues=0`).
pub fn parse_serve_result(output: &str) -> Option<ServeResult> {
    if let Some(caps) = SERVE_BLOCK.captures(output) {
        if let Some(verdict) = ServeVerdict::parse(&caps[1]) {
            return Some(ServeResult {
                verdict,
                continue_: caps[2].eq_ignore_ascii_case("true"),
                next_step: SERVE_NEXT_STEP
                    .captures(output)
                    .map(|c| c[1].to_string()),
                blocking_issues: caps[3].parse().unwrap_or(0),
            });
        }
    }

    let verdict = ServeVerdict::parse(SERVE_VERDICT.captures(output)?.get(1)?.as_str())?;
    Some(ServeResult {
        verdict,
        continue_: SERVE_CONTINUE
            .captures(output)
            .map(|c| c[1].eq_ignore_ascii_case("true"))
            .unwrap_or(true),
        next_step: SERVE_NEXT_STEP
            .captures(output)
            .map(|c| c[1].to_string()),
        blocking_issues: SERVE_BLOCKING
            .captures(output)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0),
    })
}

static FEEDBACK_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)Summary:\s*\n\s*(.+?)(?:\n\n|\nAuto-fixed:|\nIssues|\nPositive)")
        .expect("summary regex")
});
static ISSUES_TO_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Issues to file[^\n]*:\s*\n((?:[ \t]*-[^\n]+\n?)+)").expect("issue list regex")
});
static ISSUE_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)^-\s*\[([^\]]+)\]\s*(?:"([^"]+)"\s*-\s*)?(.+)$"#).expect("issue item regex")
});
static ISSUES_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)Issues found:\s*\n((?:.*?\n)+?)(?:\n\n|Positive|$)").expect("issues found regex")
});
static ISSUE_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)Severity:\s*(\w+).*?(?:File/line:|Location:)\s*([^\n]+).*?Issue:\s*([^\n]+)(?:.*?Suggestion:\s*([^\n]+))?",
    )
    .expect("issue detail regex")
});

/// Split a dash list into items, folding continuation lines into the item
/// they belong to.
fn dash_items(section: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for line in section.lines() {
        if line.trim_start().starts_with('-') {
            items.push(line.trim().to_string());
        } else if let Some(last) = items.last_mut() {
            last.push('\n');
            last.push_str(line.trim());
        }
    }
    items
}

/// Parse detailed review feedback for retry context.
///
/// Returns None when neither a summary nor any issues can be found.
pub fn parse_serve_feedback(output: &str, attempt: u32) -> Option<ServeFeedback> {
    let summary = FEEDBACK_SUMMARY
        .captures(output)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    let mut issues: Vec<ServeIssue> = Vec::new();

    if let Some(section) = ISSUES_TO_FILE.captures(output) {
        for item in dash_items(&section[1]) {
            if let Some(caps) = ISSUE_ITEM.captures(&item) {
                let severity =
                    Severity::normalize(caps[1].trim()).unwrap_or(Severity::Minor);
                issues.push(ServeIssue {
                    severity,
                    location: caps.get(2).map(|m| m.as_str().to_string()),
                    problem: caps[3].trim().to_string(),
                    suggestion: None,
                });
            }
        }
    }

    if issues.is_empty() {
        if let Some(section) = ISSUES_FOUND.captures(output) {
            for caps in ISSUE_DETAIL.captures_iter(&section[1]) {
                let severity =
                    Severity::normalize(caps[1].trim()).unwrap_or(Severity::Minor);
                issues.push(ServeIssue {
                    severity,
                    location: Some(caps[2].trim().to_string()),
                    problem: caps[3].trim().to_string(),
                    suggestion: caps.get(4).map(|m| m.as_str().trim().to_string()),
                });
            }
        }
    }

    if summary.is_empty() && issues.is_empty() {
        return None;
    }

    let verdict = parse_serve_result(output)
        .map(|r| r.verdict)
        .unwrap_or(ServeVerdict::NeedsChanges);

    Some(ServeFeedback {
        verdict,
        summary,
        issues,
        attempt,
    })
}

static INTENT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)INTENT:\s*\n\s*(.+?)(?:\n\s*Goal:\s*(.+?))?(?:\n\n|\nBEFORE)")
        .expect("intent regex")
});
static BEFORE_AFTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)BEFORE\s*(?:→|->)\s*AFTER:\s*\n\s*(.+?)\s*(?:→|->)\s*(.+?)(?:\n|$)")
        .expect("before/after regex")
});

/// Extract INTENT and BEFORE → AFTER blocks from cook output.
pub fn parse_intent(output: &str) -> (Option<String>, Option<String>, Option<String>) {
    let intent = INTENT_BLOCK.captures(output).map(|caps| {
        let mut intent = caps[1].trim().to_string();
        if let Some(goal) = caps.get(2) {
            intent = format!("{intent} | Goal: {}", goal.as_str().trim());
        }
        intent
    });

    let (before, after) = BEFORE_AFTER
        .captures(output)
        .map(|caps| {
            (
                Some(caps[1].trim().to_string()),
                Some(caps[2].trim().to_string()),
            )
        })
        .unwrap_or((None, None));

    (intent, before, after)
}

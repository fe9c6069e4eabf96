//! Gateway over the bead tracker CLI (`bd`). All reads are bounded by short
//! timeouts and degrade to empty results; nothing here raises upstream.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::Value;

use crate::config::{
    HIERARCHY_MAX_DEPTH, LoopConfig, TRACKER_COMMAND_TIMEOUT, TRACKER_SHOW_TIMEOUT,
    GIT_SYNC_TIMEOUT,
};
use crate::error::LoopError;
use crate::exec::run_command;
use crate::model::{Bead, Snapshot};

/// Map from bead id to its first epic ancestor (None when the chain ends
/// without one). Built once per iteration and reused for every selection
/// and filtering decision.
pub type AncestorMap = HashMap<String, Option<String>>;

pub struct Tracker {
    bin: PathBuf,
    cwd: PathBuf,
}

/// Ids travel straight into subprocess argument lists, so anything outside
/// this alphabet is rejected before a process is ever spawned.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn parse_bead_list(stdout: &str, source: &str) -> Vec<Bead> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!("{}", LoopError::json_decode(source, err));
            return Vec::new();
        }
    };
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .filter(|v| v.is_object())
        .filter_map(|v| serde_json::from_value::<Bead>(v).ok())
        .filter(|b: &Bead| !b.id.is_empty())
        .collect()
}

fn parse_id_list(stdout: &str, source: &str) -> Vec<String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!("{}", LoopError::json_decode(source, err));
            return Vec::new();
        }
    };
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Object(map) => map
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

impl Tracker {
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            bin: config.tracker_bin.clone(),
            cwd: config.cwd.clone(),
        }
    }

    async fn run(&self, args: &[&str], timeout: std::time::Duration) -> Option<crate::exec::CmdOutput> {
        match run_command(&self.bin, args, &self.cwd, timeout).await {
            Ok(out) => Some(out),
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }

    /// Point-in-time bead state. Each of the three queries degrades
    /// independently; a timeout on one still yields the other lists.
    pub async fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot {
            taken_at: Some(Utc::now()),
            ..Default::default()
        };

        if let Some(out) = self.run(&["ready", "--json"], TRACKER_COMMAND_TIMEOUT).await {
            if out.success() {
                snapshot.ready = parse_bead_list(&out.stdout, "bd ready");
            }
        }
        if let Some(out) = self
            .run(
                &["list", "--status=in_progress", "--json"],
                TRACKER_COMMAND_TIMEOUT,
            )
            .await
        {
            if out.success() {
                snapshot.in_progress = parse_bead_list(&out.stdout, "bd list in_progress");
            }
        }
        let limit_arg = format!("--limit={}", crate::config::CLOSED_TASKS_QUERY_LIMIT);
        if let Some(out) = self
            .run(
                &["list", "--status=closed", &limit_arg, "--json"],
                TRACKER_COMMAND_TIMEOUT,
            )
            .await
        {
            if out.success() {
                snapshot.closed = parse_bead_list(&out.stdout, "bd list closed");
            }
        }

        snapshot
    }

    /// Single-item fetch; unwraps the one-element array some tracker
    /// versions emit.
    pub async fn show(&self, id: &str) -> Option<Bead> {
        if !valid_id(id) {
            tracing::warn!(id, "rejecting invalid bead id");
            return None;
        }
        let out = self.run(&["show", id, "--json"], TRACKER_SHOW_TIMEOUT).await?;
        if !out.success() {
            return None;
        }
        parse_bead_list(&out.stdout, "bd show").into_iter().next()
    }

    /// Direct children of a parent bead.
    pub async fn children(&self, parent_id: &str) -> Vec<Bead> {
        if !valid_id(parent_id) {
            tracing::warn!(id = parent_id, "rejecting invalid bead id");
            return Vec::new();
        }
        let parent_arg = format!("--parent={parent_id}");
        let Some(out) = self
            .run(&["list", &parent_arg, "--all", "--json"], TRACKER_COMMAND_TIMEOUT)
            .await
        else {
            return Vec::new();
        };
        if !out.success() {
            return Vec::new();
        }
        parse_bead_list(&out.stdout, "bd list children")
    }

    /// Epic ids the tracker would close right now (dry run).
    pub async fn close_eligible_epics(&self) -> Vec<String> {
        let Some(out) = self
            .run(
                &["epic", "close-eligible", "--dry-run", "--json"],
                TRACKER_COMMAND_TIMEOUT,
            )
            .await
        else {
            return Vec::new();
        };
        if !out.success() {
            return Vec::new();
        }
        parse_id_list(&out.stdout, "bd epic close-eligible")
    }

    /// Commit the closures the dry run reported.
    pub async fn close_eligible_epics_apply(&self) -> bool {
        match self
            .run(&["epic", "close-eligible"], TRACKER_COMMAND_TIMEOUT)
            .await
        {
            Some(out) if out.success() => true,
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "failed to close eligible epics");
                false
            }
            None => false,
        }
    }

    /// Best-effort state refresh; failures are warnings, never fatal.
    pub async fn sync(&self) -> bool {
        match self.run(&["sync"], GIT_SYNC_TIMEOUT).await {
            Some(out) if out.success() => true,
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "bd sync failed");
                false
            }
            None => false,
        }
    }

    /// File a follow-up bug bead (e.g. after a merge conflict).
    pub async fn create_bug(&self, title: &str, description: &str, priority: u8) -> bool {
        let priority = priority.to_string();
        match self
            .run(
                &[
                    "create",
                    "--title",
                    title,
                    "--type",
                    "bug",
                    "--priority",
                    &priority,
                    "--description",
                    description,
                ],
                TRACKER_COMMAND_TIMEOUT,
            )
            .await
        {
            Some(out) if out.success() => true,
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "failed to create bug bead");
                false
            }
            None => false,
        }
    }

    /// Raw comment log for a bead. The rework-feedback channel between serve
    /// and cook is this log; it is read verbatim and never rewritten.
    pub async fn comments_for(&self, id: &str) -> Option<String> {
        if !valid_id(id) {
            tracing::warn!(id, "rejecting invalid bead id");
            return None;
        }
        let out = self.run(&["comments", id], TRACKER_SHOW_TIMEOUT).await?;
        if !out.success() {
            return None;
        }
        Some(out.stdout)
    }

    /// Build the bead→epic ancestor map in one pass over the ready list.
    ///
    /// Parents already in the snapshot are resolved from its index; parents
    /// outside it cost at most one `show` each across the whole pass thanks
    /// to memoization. Walks stop at depth 10.
    pub async fn epic_ancestor_map(&self, snapshot: &Snapshot) -> AncestorMap {
        let mut map: AncestorMap = HashMap::new();
        let mut fetched: HashMap<String, Option<Bead>> = HashMap::new();

        for bead in &snapshot.ready {
            if map.contains_key(&bead.id) {
                continue;
            }
            let mut chain: Vec<String> = Vec::new();
            let mut current = bead.clone();
            let mut epic: Option<String> = None;

            for _ in 0..HIERARCHY_MAX_DEPTH {
                if current.is_epic() {
                    epic = Some(current.id.clone());
                    break;
                }
                if let Some(known) = map.get(&current.id) {
                    epic = known.clone();
                    break;
                }
                chain.push(current.id.clone());
                let Some(parent_id) = current.parent.clone() else {
                    break;
                };
                let parent = if let Some(b) = snapshot.by_id(&parent_id) {
                    Some(b.clone())
                } else if let Some(cached) = fetched.get(&parent_id) {
                    cached.clone()
                } else {
                    let resolved = self.show(&parent_id).await;
                    fetched.insert(parent_id.clone(), resolved.clone());
                    resolved
                };
                match parent {
                    Some(p) => current = p,
                    None => break,
                }
            }

            for id in chain {
                map.insert(id, epic.clone());
            }
            map.insert(bead.id.clone(), epic);
        }

        map
    }
}

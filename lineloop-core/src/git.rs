//! Gateway over the `git` CLI. The working tree is shared with the
//! assistant, so every mutation goes through the same binary the assistant
//! uses; only commands and exit codes matter here.

use std::path::PathBuf;

use crate::config::{GIT_COMMAND_TIMEOUT, GIT_SYNC_TIMEOUT, LoopConfig};
use crate::exec::{CmdOutput, run_command};
use crate::tracker::valid_id;

/// How an epic merge failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeError {
    /// Merge conflicted; the merge was aborted and the epic branch restored.
    Conflict,
    /// Conflict recovery itself failed (`merge --abort` or the checkout back).
    AbortFailed,
    CheckoutFailed,
    Other,
}

pub struct Git {
    bin: PathBuf,
    cwd: PathBuf,
}

impl Git {
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            bin: config.git_bin.clone(),
            cwd: config.cwd.clone(),
        }
    }

    async fn run(
        &self,
        args: &[&str],
        timeout: std::time::Duration,
    ) -> Option<CmdOutput> {
        match run_command(&self.bin, args, &self.cwd, timeout).await {
            Ok(out) => Some(out),
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }

    pub async fn current_branch(&self) -> Option<String> {
        let out = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"], GIT_COMMAND_TIMEOUT)
            .await?;
        if !out.success() {
            return None;
        }
        let branch = out.stdout.trim().to_string();
        if branch.is_empty() { None } else { Some(branch) }
    }

    pub async fn has_uncommitted_changes(&self) -> bool {
        match self.run(&["status", "--porcelain"], GIT_COMMAND_TIMEOUT).await {
            Some(out) if out.success() => !out.stdout.trim().is_empty(),
            _ => false,
        }
    }

    pub async fn latest_commit(&self) -> Option<String> {
        let out = self
            .run(&["log", "-1", "--format=%h"], GIT_COMMAND_TIMEOUT)
            .await?;
        if !out.success() {
            return None;
        }
        let hash = out.stdout.trim().to_string();
        if hash.is_empty() { None } else { Some(hash) }
    }

    /// Commit (and best-effort push) pending work before leaving a branch.
    pub async fn auto_commit_wip(&self, branch: &str) -> bool {
        if !self.has_uncommitted_changes().await {
            return false;
        }
        match self.run(&["add", "-A"], GIT_SYNC_TIMEOUT).await {
            Some(out) if out.success() => {}
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "git add failed");
                return false;
            }
            None => return false,
        }
        let message = format!("WIP: work in progress on {branch}");
        match self
            .run(&["commit", "-m", &message], GIT_SYNC_TIMEOUT)
            .await
        {
            Some(out) if out.success() => {}
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "git commit failed");
                return false;
            }
            None => return false,
        }
        if let Some(push) = self.run(&["push", "origin", branch], GIT_SYNC_TIMEOUT).await {
            if !push.success() {
                tracing::warn!(
                    stderr = %push.stderr.trim(),
                    "git push failed (WIP commit succeeded locally)"
                );
            }
        }
        tracing::info!(branch, "auto-committed WIP");
        true
    }

    async fn checkout_main_updated(&self) -> bool {
        match self.run(&["checkout", "main"], GIT_SYNC_TIMEOUT).await {
            Some(out) if out.success() => {}
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "failed to checkout main");
                return false;
            }
            None => return false,
        }
        if let Some(pull) = self.run(&["pull", "--rebase"], GIT_SYNC_TIMEOUT).await {
            if !pull.success() {
                // Stale main is survivable; the merge or branch-off still runs.
                tracing::warn!(stderr = %pull.stderr.trim(), "failed to pull main (continuing)");
            }
        }
        true
    }

    /// Make `epic/<epic_id>` the current branch, creating it if needed.
    ///
    /// Returns `(branch, created)`; `(None, false)` means no change was made,
    /// either because we are already there or because the switch was aborted
    /// to preserve uncommitted work. Switch order: local branch, then the
    /// remote's copy, then fresh from main.
    pub async fn ensure_epic_branch(&self, epic_id: &str) -> (Option<String>, bool) {
        if !valid_id(epic_id) {
            tracing::warn!(epic_id, "epic id not usable as a branch name");
            return (None, false);
        }
        let expected = format!("epic/{epic_id}");
        let current = self.current_branch().await;

        if current.as_deref() == Some(expected.as_str()) {
            return (None, false);
        }

        // Leaving another epic's branch with a dirty tree: snapshot the work
        // first, and abort the switch if that fails.
        if let Some(current) = current.as_deref() {
            if current.starts_with("epic/") && self.has_uncommitted_changes().await {
                if !self.auto_commit_wip(current).await {
                    tracing::warn!(
                        branch = current,
                        "failed to commit WIP, aborting branch switch to preserve work"
                    );
                    return (None, false);
                }
            }
        }

        if let Some(out) = self.run(&["checkout", &expected], GIT_SYNC_TIMEOUT).await {
            if out.success() {
                tracing::info!(branch = %expected, "switched to epic branch");
                return (Some(expected), false);
            }
        }

        // Not local; the remote may have it.
        self.run(&["fetch", "origin", &expected], GIT_SYNC_TIMEOUT).await;
        let remote_ref = format!("origin/{expected}");
        if let Some(out) = self
            .run(&["checkout", "-b", &expected, &remote_ref], GIT_SYNC_TIMEOUT)
            .await
        {
            if out.success() {
                tracing::info!(branch = %expected, "checked out epic branch from remote");
                return (Some(expected), false);
            }
        }

        // Fresh branch from main.
        if !self.checkout_main_updated().await {
            return (None, false);
        }
        match self.run(&["checkout", "-b", &expected], GIT_SYNC_TIMEOUT).await {
            Some(out) if out.success() => {
                tracing::info!(branch = %expected, "created epic branch");
                (Some(expected), true)
            }
            Some(out) => {
                tracing::warn!(
                    branch = %expected,
                    stderr = %out.stderr.trim(),
                    "failed to create epic branch"
                );
                (None, false)
            }
            None => (None, false),
        }
    }

    /// Merge a completed epic's branch into main with `--no-ff`, then delete
    /// the branch locally and remotely (best effort) and push main.
    ///
    /// Only runs when the epic branch is current. On conflict the merge is
    /// aborted and the epic branch restored; the caller decides whether to
    /// file a follow-up bead.
    pub async fn merge_epic_to_main(
        &self,
        epic_id: &str,
        epic_title: &str,
    ) -> Result<(), MergeError> {
        if !valid_id(epic_id) {
            tracing::warn!(epic_id, "epic id not usable as a branch name");
            return Err(MergeError::Other);
        }
        let epic_branch = format!("epic/{epic_id}");
        let current = self.current_branch().await;
        if current.as_deref() != Some(epic_branch.as_str()) {
            tracing::debug!(branch = %epic_branch, "not on epic branch, skipping merge");
            return Err(MergeError::Other);
        }

        if !self.checkout_main_updated().await {
            return Err(MergeError::Other);
        }

        let message = format!("Merge epic {epic_id}: {epic_title}");
        let merge = self
            .run(
                &["merge", "--no-ff", &epic_branch, "-m", &message],
                GIT_SYNC_TIMEOUT,
            )
            .await;

        let merged = matches!(&merge, Some(out) if out.success());
        if !merged {
            match self.run(&["merge", "--abort"], GIT_SYNC_TIMEOUT).await {
                Some(out) if out.success() => {}
                _ => {
                    tracing::error!(epic_id, "failed to abort conflicted merge");
                    return Err(MergeError::AbortFailed);
                }
            }
            match self.run(&["checkout", &epic_branch], GIT_SYNC_TIMEOUT).await {
                Some(out) if out.success() => {}
                _ => {
                    tracing::error!(branch = %epic_branch, "failed to return to epic branch");
                    return Err(MergeError::CheckoutFailed);
                }
            }
            tracing::warn!(epic_id, "merge conflict, epic branch restored");
            return Err(MergeError::Conflict);
        }

        self.run(&["branch", "-d", &epic_branch], GIT_SYNC_TIMEOUT).await;
        self.run(&["push", "origin", "main"], GIT_SYNC_TIMEOUT).await;
        self.run(&["push", "origin", "--delete", &epic_branch], GIT_SYNC_TIMEOUT)
            .await;
        tracing::info!(branch = %epic_branch, "merged and deleted epic branch");
        Ok(())
    }

    /// One-time fetch + pull at loop start. Warn-only; a missing upstream is
    /// expected on fresh checkouts and logged at debug.
    pub async fn sync_at_start(&self) {
        match self.run(&["fetch"], GIT_SYNC_TIMEOUT).await {
            Some(out) if out.success() => {
                if let Some(pull) = self.run(&["pull", "--rebase"], GIT_SYNC_TIMEOUT).await {
                    if !pull.success() {
                        if pull.stderr.to_lowercase().contains("no tracking information") {
                            tracing::debug!("git pull skipped (no upstream)");
                        } else {
                            tracing::warn!(stderr = %pull.stderr.trim(), "git pull --rebase failed");
                        }
                    }
                }
            }
            Some(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "git fetch failed");
            }
            None => {}
        }
    }
}

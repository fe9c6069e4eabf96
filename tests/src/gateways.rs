//! Gateway behavior against the stub executables: tracker parsing and id
//! validation, the branch-ensure ladder, WIP preservation, and merge
//! conflict recovery.

use crate::fixtures::*;

use lineloop_core::git::{Git, MergeError};
use lineloop_core::model::IssueType;
use lineloop_core::tracker::Tracker;

fn bd_log(fx: &LoopFixture) -> String {
    fx.read_state("bd.log")
}

#[tokio::test]
async fn snapshot_parses_disjoint_lists() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "ready.json",
        r#"[{"id":"e1","title":"big epic","issue_type":"epic","status":"ready"},
            {"id":"t1","title":"small task","issue_type":"task","status":"ready"}]"#,
    )?;
    fx.write_state(
        "in_progress.json",
        r#"[{"id":"t2","title":"working","issue_type":"task","status":"in_progress"}]"#,
    )?;
    fx.write_state(
        "closed.json",
        r#"[{"id":"t0","title":"done","issue_type":"task","status":"closed"}]"#,
    )?;

    let config = fx.config();
    let tracker = Tracker::new(&config);
    let snapshot = tracker.snapshot().await;

    assert_eq!(snapshot.ready.len(), 2);
    assert_eq!(snapshot.in_progress.len(), 1);
    assert_eq!(snapshot.closed.len(), 1);
    assert_eq!(snapshot.ready_work_ids(), vec!["t1"]);

    // The three lists never share an id.
    for bead in &snapshot.ready {
        assert!(!snapshot.in_progress_ids().contains(&bead.id.as_str()));
        assert!(!snapshot.closed_ids().contains(&bead.id.as_str()));
    }
    for bead in &snapshot.in_progress {
        assert!(!snapshot.closed_ids().contains(&bead.id.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn invalid_ids_never_reach_the_subprocess() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    let config = fx.config();
    let tracker = Tracker::new(&config);

    assert!(tracker.show("bad id; rm -rf /").await.is_none());
    assert!(tracker.children("$(reboot)").await.is_empty());
    assert!(tracker.comments_for("a/b").await.is_none());
    assert!(
        !bd_log(&fx).contains("bad id"),
        "invalid id must be rejected locally"
    );
    assert!(bd_log(&fx).is_empty());
    Ok(())
}

#[tokio::test]
async fn ancestor_map_memoizes_out_of_snapshot_parents() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "ready.json",
        r#"[{"id":"t1","title":"one","issue_type":"task","status":"ready","parent":"f1"},
            {"id":"t2","title":"two","issue_type":"task","status":"ready","parent":"f1"}]"#,
    )?;
    fx.write_state("in_progress.json", "[]")?;
    fx.write_state("closed.json", "[]")?;
    fx.write_state(
        "show-f1.json",
        r#"{"id":"f1","title":"shared feature","issue_type":"feature","status":"open","parent":"e1"}"#,
    )?;
    fx.write_state(
        "show-e1.json",
        r#"{"id":"e1","title":"shared epic","issue_type":"epic","status":"open"}"#,
    )?;

    let config = fx.config();
    let tracker = Tracker::new(&config);
    let snapshot = tracker.snapshot().await;
    let map = tracker.epic_ancestor_map(&snapshot).await;

    assert_eq!(map.get("t1"), Some(&Some("e1".to_string())));
    assert_eq!(map.get("t2"), Some(&Some("e1".to_string())));

    let show_f1_calls = bd_log(&fx)
        .lines()
        .filter(|l| l.starts_with("show f1"))
        .count();
    assert_eq!(show_f1_calls, 1, "shared parent fetched exactly once");
    Ok(())
}

#[tokio::test]
async fn show_unwraps_single_element_array() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_default_bd_stub()?;
    fx.write_state(
        "show-t1.json",
        r#"[{"id":"t1","title":"wrapped","issue_type":"task","status":"ready"}]"#,
    )?;
    let config = fx.config();
    let tracker = Tracker::new(&config);
    let bead = tracker.show("t1").await.expect("bead parsed");
    assert_eq!(bead.title, "wrapped");
    assert_eq!(bead.issue_type, IssueType::Task);
    Ok(())
}

#[tokio::test]
async fn ensure_epic_branch_switches_to_local_branch() -> TestResult {
    let fx = LoopFixture::new()?;
    let config = fx.config();
    let git = Git::new(&config);

    let (branch, created) = git.ensure_epic_branch("e1").await;
    assert_eq!(branch.as_deref(), Some("epic/e1"));
    assert!(!created);
    assert_eq!(fx.read_state("branch").trim(), "epic/e1");
    Ok(())
}

#[tokio::test]
async fn ensure_epic_branch_creates_from_main_when_nowhere_else() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("no-local-branch", "")?;
    fx.write_state("no-remote-branch", "")?;
    let config = fx.config();
    let git = Git::new(&config);

    let (branch, created) = git.ensure_epic_branch("e2").await;
    assert_eq!(branch.as_deref(), Some("epic/e2"));
    assert!(created, "fallback path creates the branch fresh");

    let log = fx.git_log().join("\n");
    assert!(log.contains("fetch origin epic/e2"), "remote was tried: {log}");
    assert!(log.contains("checkout main"), "branched off main: {log}");
    assert!(log.contains("pull --rebase"), "main refreshed first: {log}");
    Ok(())
}

#[tokio::test]
async fn ensure_epic_branch_is_noop_on_correct_branch() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("branch", "epic/e1\n")?;
    let config = fx.config();
    let git = Git::new(&config);

    let (branch, created) = git.ensure_epic_branch("e1").await;
    assert!(branch.is_none());
    assert!(!created);
    let log = fx.git_log().join("\n");
    assert!(!log.contains("checkout"), "no switch issued: {log}");
    Ok(())
}

#[tokio::test]
async fn dirty_epic_branch_gets_wip_commit_before_switch() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("branch", "epic/old\n")?;
    fx.write_state("porcelain", " M src/lib.rs\n")?;
    let config = fx.config();
    let git = Git::new(&config);

    let (branch, _) = git.ensure_epic_branch("e1").await;
    assert_eq!(branch.as_deref(), Some("epic/e1"));

    let log = fx.git_log().join("\n");
    assert!(log.contains("add -A"), "WIP staged: {log}");
    assert!(
        log.contains("commit -m WIP: work in progress on epic/old"),
        "WIP committed with the branch name: {log}"
    );
    assert!(log.contains("push origin epic/old"), "WIP pushed: {log}");
    Ok(())
}

#[tokio::test]
async fn merge_conflict_aborts_and_restores_epic_branch() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("branch", "epic/e1\n")?;
    fx.write_state("fail-merge", "")?;
    let config = fx.config();
    let git = Git::new(&config);

    let result = git.merge_epic_to_main("e1", "the epic").await;
    assert_eq!(result, Err(MergeError::Conflict));

    let log = fx.git_log().join("\n");
    assert!(log.contains("merge --abort"), "conflicted merge aborted: {log}");
    assert_eq!(
        fx.read_state("branch").trim(),
        "epic/e1",
        "returned to the epic branch after abort"
    );
    assert!(!log.contains("push origin main"), "nothing pushed on conflict: {log}");
    Ok(())
}

#[tokio::test]
async fn merge_requires_being_on_the_epic_branch() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("branch", "main\n")?;
    let config = fx.config();
    let git = Git::new(&config);

    let result = git.merge_epic_to_main("e1", "the epic").await;
    assert_eq!(result, Err(MergeError::Other));
    let log = fx.git_log().join("\n");
    assert!(!log.contains("merge --no-ff"), "no merge attempted: {log}");
    Ok(())
}

#[tokio::test]
async fn successful_merge_cleans_up_branches() -> TestResult {
    let fx = LoopFixture::new()?;
    fx.write_state("branch", "epic/e1\n")?;
    let config = fx.config();
    let git = Git::new(&config);

    let result = git.merge_epic_to_main("e1", "the epic").await;
    assert_eq!(result, Ok(()));

    let log = fx.git_log().join("\n");
    assert!(log.contains("merge --no-ff epic/e1 -m Merge epic e1: the epic"));
    assert!(log.contains("branch -d epic/e1"));
    assert!(log.contains("push origin main"));
    assert!(log.contains("push origin --delete epic/e1"));
    Ok(())
}

#![allow(dead_code)]

pub(crate) use std::fs;
pub(crate) use std::os::unix::fs::PermissionsExt;
pub(crate) use std::path::{Path, PathBuf};
pub(crate) use std::time::Duration;

pub(crate) use lineloop_core::config::LoopConfig;
pub(crate) use lineloop_core::config::PhaseTimeouts;
pub(crate) use tempfile::TempDir;

pub(crate) type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// A disposable project directory with stub `bd` / `claude` / `git`
/// executables and a small state area the stubs read and mutate.
///
/// Layout:
///   <root>/bin/      stub executables (0755 shell scripts)
///   <root>/state/    canned tracker JSON the bd stub serves
///   <root>/.git      marker so health checks pass
///   <root>/.beads    marker so health checks pass
pub(crate) struct LoopFixture {
    pub tempdir: TempDir,
}

impl LoopFixture {
    pub fn new() -> TestResult<Self> {
        let tempdir = TempDir::new()?;
        fs::create_dir_all(tempdir.path().join("bin"))?;
        fs::create_dir_all(tempdir.path().join("state"))?;
        fs::create_dir_all(tempdir.path().join(".git"))?;
        fs::create_dir_all(tempdir.path().join(".beads"))?;
        let fixture = Self { tempdir };
        fixture.write_default_git_stub()?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        self.tempdir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    pub fn write_state(&self, name: &str, contents: &str) -> TestResult {
        fs::write(self.state_dir().join(name), contents)?;
        Ok(())
    }

    pub fn read_state(&self, name: &str) -> String {
        fs::read_to_string(self.state_dir().join(name)).unwrap_or_default()
    }

    pub fn write_executable(&self, name: &str, body: &str) -> TestResult<PathBuf> {
        let path = self.path().join("bin").join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}"))?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
        Ok(path)
    }

    /// The standard bd stub: serves the JSON files under state/ and accepts
    /// the write commands without doing anything.
    pub fn write_default_bd_stub(&self) -> TestResult<PathBuf> {
        self.write_executable(
            "bd",
            r#"dir="$(dirname "$0")/../state"
echo "$@" >> "$dir/bd.log"
case "$1" in
  ready) cat "$dir/ready.json" ;;
  list)
    case "$2" in
      --status=in_progress) cat "$dir/in_progress.json" ;;
      --status=closed) cat "$dir/closed.json" ;;
      --parent=*) parent="${2#--parent=}"; cat "$dir/children-$parent.json" 2>/dev/null || echo '[]' ;;
      *) echo '[]' ;;
    esac ;;
  show) cat "$dir/show-$2.json" 2>/dev/null || echo '[]' ;;
  epic) cat "$dir/close-eligible.json" 2>/dev/null || echo '[]' ;;
  comments) cat "$dir/comments-$2.txt" 2>/dev/null ;;
  sync) : ;;
  create) echo "$@" >> "$dir/created.log" ;;
esac
exit 0"#,
        )
    }

    /// A git stub that records every invocation and answers the read
    /// queries from state files. Marker files flip selected commands into
    /// failures so branch-ladder and conflict paths can be exercised.
    pub fn write_default_git_stub(&self) -> TestResult<PathBuf> {
        self.write_state("branch", "main\n")?;
        self.write_state("porcelain", "")?;
        self.write_executable(
            "git",
            r#"dir="$(dirname "$0")/../state"
echo "$@" >> "$dir/git.log"
case "$1" in
  rev-parse) cat "$dir/branch" ;;
  status) cat "$dir/porcelain" ;;
  log) echo "abc1234" ;;
  checkout)
    shift
    if [ "$1" = "-b" ]; then
      case "$*" in
        *origin/*) if [ -f "$dir/no-remote-branch" ]; then exit 1; fi ;;
      esac
      echo "$2" > "$dir/branch"
    else
      case "$1" in
        epic/*) if [ -f "$dir/no-local-branch" ]; then exit 1; fi ;;
      esac
      echo "$1" > "$dir/branch"
    fi
    ;;
  merge)
    if [ "$2" = "--abort" ]; then exit 0; fi
    if [ -f "$dir/fail-merge" ]; then exit 1; fi ;;
esac
exit 0"#,
        )
    }

    pub fn git_log(&self) -> Vec<String> {
        self.read_state("git.log")
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Loop configuration pointing every external binary at the stubs.
    pub fn config(&self) -> LoopConfig {
        let bin = self.path().join("bin");
        LoopConfig {
            cwd: self.path().to_path_buf(),
            assistant_bin: bin.join("claude"),
            tracker_bin: bin.join("bd"),
            git_bin: bin.join("git"),
            human_output: false,
            skip_initial_sync: true,
            idle_timeout: Duration::ZERO,
            phase_timeouts: PhaseTimeouts {
                cook: Duration::from_secs(20),
                serve: Duration::from_secs(20),
                tidy: Duration::from_secs(20),
                plate: Duration::from_secs(20),
                close_service: Duration::from_secs(20),
            },
            ..Default::default()
        }
    }
}

pub(crate) fn ready_task(id: &str, title: &str) -> String {
    format!(r#"{{"id":"{id}","title":"{title}","issue_type":"task","status":"ready"}}"#)
}

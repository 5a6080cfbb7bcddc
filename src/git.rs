use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::{OsStr, OsString};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use std::{io, str};

use anyhow::{anyhow, bail, Context as _};
#[allow(unused_imports)]
use log::{debug, info, warn};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::process::{CommandExt, OutputExt};

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

// Newtypery for Git IDs, same pattern as the rest of this codebase: Deref
// lets expressions on the outer type reach the inner type's methods, but
// doesn't implement the inner type's traits for us, so those get forwarded
// by hand below.
impl Hash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct PersistentWorktree {
    pub path: PathBuf,
    pub git_binary: PathBuf,
}

impl Worktree for PersistentWorktree {
    fn path(&self) -> &Path {
        &self.path
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

/// Wrapper for a Command that holds a semaphore permit for as long as the
/// process exists, to avoid running into file descriptor exhaustion when
/// many git subprocesses are in flight at once (sync ticks, per-run
/// clones, diff queries), without needing retry logic that would risk a
/// livelock.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    fn env(&mut self, key: impl AsRef<OsStr>, val: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.env(key, val);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<std::process::Output> {
        self.command.execute().await
    }

    pub async fn output(&mut self) -> io::Result<std::process::Output> {
        self.command.output().await
    }
}

trait WorktreePriv: Worktree {
    fn git<'a, I, S>(&'a self, args: I) -> futures::future::BoxFuture<'a, GitCommand>
    where
        I: IntoIterator<Item = S> + Send + 'a,
        S: AsRef<OsStr>,
    {
        use futures::FutureExt as _;
        (async {
            let mut cmd = Command::new(self.git_binary());
            cmd.current_dir(self.path());
            cmd.args(args);
            GitCommand {
                _permit: COMMAND_SEM.acquire().await.unwrap(),
                command: cmd,
            }
        })
        .boxed()
    }
}

impl<W: Worktree + ?Sized> WorktreePriv for W {}

/// Shared functionality between whatever kind of git working tree we're
/// dealing with (today, just `PersistentWorktree`, but kept as a trait so
/// tests can exercise the same operations against disposable fixture
/// repos without duplicating the subprocess plumbing).
pub trait Worktree: Debug + Sync {
    fn path(&self) -> &Path;
    fn git_binary(&self) -> &Path;

    async fn lookup_git_dir(&self, rev_parse_arg: &str) -> anyhow::Result<PathBuf> {
        let output = self
            .git(["rev-parse", rev_parse_arg])
            .await
            .execute()
            .await
            .map_err(|e| anyhow!("'git rev-parse {rev_parse_arg}' failed: {e}"))?;
        let mut bytes = output.stdout;
        while bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        Ok(PathBuf::from(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn rev_list<S>(&self, range_spec: S) -> anyhow::Result<Vec<CommitHash>>
    where
        S: AsRef<OsStr>,
    {
        let output = self
            .git(["rev-list"])
            .await
            .arg(range_spec)
            .execute()
            .await
            .context("'git rev-list' failed")?;
        let out_str = str::from_utf8(&output.stdout).context("non utf-8 rev-list output")?;
        Ok(out_str.lines().map(CommitHash::new).collect())
    }

    async fn checkout(&self, commit: &CommitHash) -> anyhow::Result<()> {
        self.git(["checkout"])
            .await
            .arg(commit)
            .output()
            .await?
            .ok()
            .context(format!("checking out revision {commit:?} in {:?}", self.path()))
    }

    /// Most recent commit hash that touched `path`, within the given
    /// revision range (or the whole history if `range` is empty).
    async fn log_hash_for_path(&self, range: &str, path: &str) -> anyhow::Result<Option<CommitHash>> {
        let mut cmd = self.git(["log", "-n1", "--format=%H"]).await;
        if !range.is_empty() {
            cmd.arg(range);
        }
        cmd.arg("--").arg(path);
        let output = cmd.execute().await.context("'git log' for path hash failed")?;
        let s = String::from_utf8(output.stdout).context("non-utf8 git log output")?;
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CommitHash::new(s)))
        }
    }

    /// True iff any commit in `since..HEAD` touched `path`. Implemented
    /// with `git diff --quiet`, whose exit status spec.md §4.1 pins down
    /// exactly: 1 means changes present, 0 means none, anything else is a
    /// real failure.
    async fn diff_has_changes(&self, since: &CommitHash, path: &str) -> anyhow::Result<bool> {
        let output = self
            .git(["diff", "--quiet"])
            .await
            .arg(format!("{since}..HEAD"))
            .arg("--")
            .arg(path)
            .output()
            .await
            .context("'git diff --quiet' failed to spawn")?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => bail!(
                "'git diff --quiet' exited unexpectedly: {:?}\nstderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        }
    }

    async fn rev_parse<S>(&self, rev_spec: S) -> anyhow::Result<Option<CommitHash>>
    where
        S: AsRef<OsStr>,
    {
        let mut cmd = self.git(["log", "-n1", "--format=%H"]).await;
        let cmd = cmd.arg(rev_spec);
        let output = cmd.output().await.context("failed to run 'git log -n1'")?;
        let exit_code = output
            .status
            .code()
            .ok_or_else(|| anyhow!("git log killed by signal"))?;
        // Empirically, git returns 128 when the range is invalid.
        if exit_code == 128 {
            return Ok(None);
        }
        if exit_code != 0 {
            bail!("'git log -n1' failed with code {exit_code}");
        }
        let out_string = String::from_utf8(output.stdout).context("reading git log output")?;
        let trimmed = out_string.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(CommitHash::new(trimmed)))
    }
}

/// Maintains a local mirror of a remote repository, reasonably close to
/// HEAD of a configured branch, and answers the hash/changelog/clone
/// queries the Scheduler and Runner need. See spec.md §4.1.
pub struct GitMirror {
    path: PathBuf,
    git_binary: PathBuf,
    remote: String,
    branch: String,
    revision: String,
    depth: Option<u32>,
    sync_interval: Duration,
    // Exclusive for writes (fetch/clone), shared for reads too, so a read
    // never interleaves with a fetch in progress -- spec.md §4.1's
    // concurrency rule.
    lock: Mutex<()>,
    stop: CancellationToken,
}

impl GitMirror {
    pub fn new(
        path: PathBuf,
        git_binary: PathBuf,
        remote: String,
        branch: String,
        revision: String,
        depth: Option<u32>,
        sync_interval: Duration,
    ) -> anyhow::Result<Self> {
        if !path.is_absolute() {
            bail!("git mirror path must be absolute, got {path:?}");
        }
        if remote.trim().is_empty() {
            bail!("git mirror remote must not be empty");
        }
        if matches!(depth, Some(0)) {
            bail!("git mirror depth must not be zero");
        }
        Ok(Self {
            path,
            git_binary,
            remote,
            branch,
            revision,
            depth,
            sync_interval,
            lock: Mutex::new(()),
            stop: CancellationToken::new(),
        })
    }

    fn worktree(&self) -> PersistentWorktree {
        PersistentWorktree {
            path: self.path.clone(),
            git_binary: self.git_binary.clone(),
        }
    }

    /// Performs an initial clone if absent, then runs sync ticks on the
    /// configured interval until `StopSync` is called. Returns once the
    /// background loop exits (on cancellation or an unrecoverable error).
    pub async fn start_sync(&self, on_result: impl Fn(bool, Duration) + Send) -> anyhow::Result<()> {
        self.initial_clone_if_absent().await?;

        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let per_tick_deadline = self.sync_interval.saturating_sub(Duration::from_secs(1));
                    let started = tokio::time::Instant::now();
                    let result = timeout(per_tick_deadline, self.sync_tick()).await;
                    let elapsed = started.elapsed();
                    match result {
                        Ok(Ok(())) => on_result(true, elapsed),
                        Ok(Err(e)) => {
                            warn!("git sync tick failed: {e:#}");
                            on_result(false, elapsed);
                        }
                        Err(_elapsed) => {
                            warn!("git sync tick did not complete within {per_tick_deadline:?}");
                            on_result(false, elapsed);
                        }
                    }
                }
            }
        }
    }

    pub fn stop_sync(&self) {
        self.stop.cancel();
    }

    /// Performs the initial clone if the mirror path is empty, without
    /// starting the background ticker. Used by the `--once` CLI path,
    /// which wants the mirror populated but never enters the periodic
    /// sync loop `start_sync` otherwise runs forever.
    pub async fn ensure_cloned(&self) -> anyhow::Result<()> {
        self.initial_clone_if_absent().await
    }

    async fn initial_clone_if_absent(&self) -> anyhow::Result<()> {
        if self.path.join(".git").exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("creating mirror dir {:?}", self.path))?;
        let _guard = self.lock.lock().await;
        self.clone_mirror().await
    }

    async fn clone_attempt(&self, wt: &PersistentWorktree) -> anyhow::Result<std::process::Output> {
        let mut cmd = wt.git(["clone", "--no-checkout", "-b"]).await;
        cmd.arg(&self.branch);
        if let Some(depth) = self.depth {
            cmd.arg("--depth").arg(depth.to_string());
        }
        cmd.arg(&self.remote).arg(&self.path);
        cmd.execute().await
    }

    async fn clone_mirror(&self) -> anyhow::Result<()> {
        let wt = self.worktree();
        match self.clone_attempt(&wt).await {
            Ok(_) => Ok(()),
            Err(e) if is_dir_exists_not_empty(&e) => {
                warn!("mirror dir exists and is not empty, purging and retrying clone once");
                fs::remove_dir_all(&self.path).await.ok();
                fs::create_dir_all(&self.path).await?;
                self.clone_attempt(&wt).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// One sync tick: compare our local ref to the remote, fetch if
    /// they differ, then gc. Must run under the mirror lock.
    async fn sync_tick(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let wt = self.worktree();

        let remote_ref = if self.revision == "HEAD" {
            format!("refs/heads/{}", self.branch)
        } else {
            format!("refs/tags/{}", self.revision)
        };
        let ls_remote = wt
            .git(["ls-remote"])
            .await
            .arg(&self.remote)
            .arg(&remote_ref)
            .execute()
            .await
            .context("git ls-remote failed")?;
        let remote_hash = String::from_utf8_lossy(&ls_remote.stdout)
            .split_whitespace()
            .next()
            .map(str::to_owned);

        let local_hash = wt.rev_parse("HEAD").await.context("rev-parse HEAD in mirror")?;

        if let (Some(remote_hash), Some(local_hash)) = (&remote_hash, &local_hash) {
            if remote_hash.as_str() == local_hash.as_str() {
                return Ok(());
            }
        }

        let mut fetch = wt.git(["fetch", "-f", "--tags"]).await;
        if let Some(depth) = self.depth {
            fetch.arg("--depth").arg(depth.to_string());
        }
        fetch.arg("origin").arg(&self.branch);
        fetch.execute().await.context("git fetch failed")?;

        wt.git(["gc", "--prune=all"])
            .await
            .execute()
            .await
            .context("git gc failed")?;
        Ok(())
    }

    /// Short hash of the most recent commit touching `path` at the
    /// mirror's current revision.
    pub async fn hash_for_path(&self, path: &str) -> Result<CommitHash, CoreError> {
        let _guard = self.lock.lock().await;
        let wt = self.worktree();
        wt.log_hash_for_path(&self.revision, path)
            .await
            .map_err(|e| CoreError::Git(format!("{e:#}")))?
            .ok_or_else(|| CoreError::Git(format!("no commits touched path {path:?}")))
    }

    /// Did any commit between `since_hash` and the mirror's current
    /// revision touch `path`?
    pub async fn has_changes_for_path(&self, path: &str, since_hash: &str) -> Result<bool, CoreError> {
        let _guard = self.lock.lock().await;
        let wt = self.worktree();
        wt.diff_has_changes(&CommitHash::new(since_hash), path)
            .await
            .map_err(|e| CoreError::Git(format!("{e:#}")))
    }

    /// Creates a shallow checkout of `subpath` into `dst_dir`, returning
    /// the hash that was checked out. Must not be called from inside a
    /// sync callback (it takes the same lock `sync_tick` does); the
    /// Scheduler/Runner trigger this on the Runner's own schedule, never
    /// from within the Git polling loop, so no reentrancy can arise.
    pub async fn clone_local(
        &self,
        env: &[(OsString, OsString)],
        dst_dir: &Path,
        subpath: &str,
    ) -> Result<CommitHash, CoreError> {
        let _guard = self.lock.lock().await;
        let wt = self.worktree();
        let commit = wt
            .rev_parse(&self.revision)
            .await
            .map_err(|e| CoreError::Git(format!("{e:#}")))?
            .ok_or_else(|| CoreError::Git(format!("revision {:?} not found in mirror", self.revision)))?;

        fs::create_dir_all(dst_dir)
            .await
            .map_err(|e| CoreError::Git(format!("creating scratch dir {dst_dir:?}: {e}")))?;

        let mut archive_cmd = wt.git(["archive", "--format=tar"]).await;
        archive_cmd.arg(commit.as_str()).arg("--").arg(subpath);
        for (k, v) in env {
            archive_cmd.env(k, v);
        }
        archive_cmd.command.stdout(Stdio::piped());

        let mut archive_child = archive_cmd
            .command
            .spawn()
            .map_err(|e| CoreError::Git(format!("spawning git archive: {e}")))?;
        let mut archive_stdout = archive_child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Git("git archive produced no stdout pipe".to_owned()))?;

        let mut tar_cmd = Command::new("tar");
        tar_cmd.args(["-x", "-C"]).arg(dst_dir).stdin(Stdio::piped());
        let mut tar_child = tar_cmd
            .spawn()
            .map_err(|e| CoreError::Git(format!("spawning tar: {e}")))?;
        let mut tar_stdin = tar_child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Git("tar produced no stdin pipe".to_owned()))?;

        let copy_result = tokio::io::copy(&mut archive_stdout, &mut tar_stdin).await;
        drop(tar_stdin);
        copy_result.map_err(|e| CoreError::Git(format!("piping git archive into tar: {e}")))?;

        let archive_status = archive_child
            .wait()
            .await
            .map_err(|e| CoreError::Git(format!("waiting for git archive: {e}")))?;
        let tar_status = tar_child
            .wait()
            .await
            .map_err(|e| CoreError::Git(format!("waiting for tar: {e}")))?;

        if !archive_status.success() {
            return Err(CoreError::Git(format!("git archive failed: {archive_status:?}")));
        }
        if !tar_status.success() {
            return Err(CoreError::Git(format!("tar extraction failed: {tar_status:?}")));
        }

        Ok(commit)
    }
}

fn is_dir_exists_not_empty(e: &anyhow::Error) -> bool {
    let msg = format!("{e:#}");
    msg.contains("already exists and is not an empty directory")
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug)]
    pub struct TempRepo {
        temp_dir: TempDir,
        git_binary: PathBuf,
    }

    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            let zelf = Self {
                temp_dir: TempDir::with_prefix("fixture-").expect("couldn't make tempdir"),
                git_binary: PathBuf::from("git"),
            };
            zelf.git(["init", "-b", "master"]).await.execute().await?;
            zelf.git(["config", "user.email", "test@example.com"])
                .await
                .execute()
                .await?;
            zelf.git(["config", "user.name", "Test"]).await.execute().await?;
            Ok(zelf)
        }
    }

    impl Worktree for TempRepo {
        fn path(&self) -> &Path {
            self.temp_dir.path()
        }

        fn git_binary(&self) -> &Path {
            &self.git_binary
        }
    }

    pub trait WorktreeExt: Worktree {
        async fn commit_file<S: AsRef<OsStr>>(
            &self,
            relative_path: &str,
            contents: &str,
            message: S,
        ) -> anyhow::Result<CommitHash> {
            let full_path = self.path().join(relative_path);
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&full_path, contents).await?;
            self.git(["add", "-A"]).await.execute().await?;
            self.git(["commit", "-m"])
                .await
                .arg(message)
                .execute()
                .await
                .context("'git commit' failed")?;
            self.rev_parse("HEAD")
                .await?
                .ok_or_else(|| anyhow!("no HEAD after committing"))
        }
    }

    impl<W: Worktree> WorktreeExt for W {}
}

#[cfg(test)]
mod tests {
    use super::test_utils::{TempRepo, WorktreeExt};
    use super::*;

    #[tokio::test]
    async fn log_hash_for_path_finds_most_recent_touching_commit() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit_file("a/one.txt", "1", "first").await.unwrap();
        let hash_b = repo.commit_file("b/two.txt", "2", "second").await.unwrap();
        repo.commit_file("a/one.txt", "again", "third touches a again")
            .await
            .unwrap();

        let found = repo.log_hash_for_path("", "b").await.unwrap();
        assert_eq!(found, Some(hash_b));
    }

    #[tokio::test]
    async fn diff_has_changes_detects_path_touched_since() {
        let repo = TempRepo::new().await.unwrap();
        let base = repo.commit_file("a/one.txt", "1", "first").await.unwrap();
        repo.commit_file("b/two.txt", "2", "touches only b").await.unwrap();

        assert!(!repo.diff_has_changes(&base, "a").await.unwrap());
        assert!(repo.diff_has_changes(&base, "b").await.unwrap());
    }

    #[tokio::test]
    async fn rev_parse_returns_none_for_invalid_range() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit_file("a.txt", "1", "first").await.unwrap();
        assert_eq!(repo.rev_parse("not-a-real-ref").await.unwrap(), None);
    }
}

use std::ffi::OsStr;
use std::process::{self, Output};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::CoreError;

/// Extension trait for `tokio::process::Command` giving us a single
/// `execute` call that spawns, waits, and turns a non-zero exit into a
/// readable error including both stdio streams. Callers who need to
/// inspect the exit code themselves (rather than treating non-zero as
/// fatal) should use `output()` instead, same as the stdlib API.
pub trait CommandExt {
    #[allow(async_fn_in_trait)]
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {:?}", self.as_std().get_program()))?;
        output.ok().with_context(|| format!("{:?}", self.as_std()))?;
        Ok(output)
    }
}

/// Same idea for `std::process::Command`, used only where we can't afford
/// to be async (notably `Drop` impls, where cleanup commands must run
/// synchronously).
pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for process::Command {
    fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self.output().with_context(|| format!("spawning {self:?}"))?;
        output.ok().with_context(|| format!("{self:?}"))?;
        Ok(output)
    }
}

pub trait OutputExt {
    /// The process exit code, assuming it wasn't killed by a signal. Most
    /// callers that need to distinguish specific exit codes (rather than
    /// just success/failure) want this rather than `ExitStatus::code()`
    /// directly, since that returns `None` both for "killed by signal" and
    /// for platforms where it's simply unsupported, and we want a loud
    /// error rather than silently treating a kill as some arbitrary code.
    fn code_not_killed(&self) -> anyhow::Result<i32>;

    /// `Ok(())` if the process exited successfully, otherwise an error
    /// describing the exit status and both stdio streams.
    fn ok(&self) -> anyhow::Result<()>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process killed by signal: {:?}", self.status))
    }

    fn ok(&self) -> anyhow::Result<()> {
        if self.status.success() {
            return Ok(());
        }
        bail!(
            "exited with {:?}\nstdout:\n{}\nstderr:\n{}",
            self.status,
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

/// Runs a subprocess under a deadline, distinguishing "ran and failed" from
/// "didn't finish in time" the way spec's error taxonomy requires (a
/// `Timeout` is reported to the metrics sink separately from an ordinary
/// `ApplyError`).
pub async fn run_with_deadline(cmd: &mut Command, deadline: Duration) -> Result<Output, CoreError> {
    match timeout(deadline, cmd.output()).await {
        Err(_elapsed) => Err(CoreError::Timeout(deadline)),
        Ok(Err(spawn_err)) => Err(CoreError::Apply {
            message: format!("failed to spawn {:?}: {spawn_err}", cmd.as_std().get_program()),
            exit_code: None,
        }),
        Ok(Ok(output)) => Ok(output),
    }
}

/// Render an argument list for inclusion in a `LastRun.command` field, the
/// way the spec wants a "shell-equivalent" of what actually ran.
pub fn display_command(program: &OsStr, args: &[impl AsRef<OsStr>]) -> String {
    let mut s = program.to_string_lossy().into_owned();
    for arg in args {
        s.push(' ');
        s.push_str(&arg.as_ref().to_string_lossy());
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_succeeds_on_zero_exit() {
        let mut cmd = Command::new("true");
        cmd.execute().await.expect("true should succeed");
    }

    #[tokio::test]
    async fn execute_fails_on_nonzero_exit() {
        let mut cmd = Command::new("false");
        assert!(cmd.execute().await.is_err());
    }

    #[tokio::test]
    async fn deadline_exceeded_is_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_with_deadline(&mut cmd, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn deadline_not_exceeded_returns_output() {
        let mut cmd = Command::new("true");
        let result = run_with_deadline(&mut cmd, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[test]
    fn display_command_formats_args() {
        assert_eq!(
            display_command(OsStr::new("kubectl"), &["apply", "-f", "-"]),
            "kubectl apply -f -"
        );
    }
}

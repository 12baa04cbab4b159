//! Sub-process launcher abstraction (§1 "assumes a sub-process launcher
//! that can start a program with an environment, stream its output, kill
//! it, and guarantee no orphaned descendants survive", §9
//! `ProcessGroup::kill_all`).
//!
//! Each run's child is spawned into its own POSIX process group (`setsid`
//! in a `pre_exec` hook); tearing the run down means signalling the whole
//! group, which also takes out any descendants the test binary forked —
//! no `/proc` walk or environment-marker scan needed on platforms with
//! real process groups.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{JoshuaError, JoshuaResult};

/// Everything a finished (or killed) child run produced.
#[derive(Debug, Clone)]
pub struct ChildOutcome {
    pub code: i32,
    pub output: Vec<u8>,
}

/// A running child, its process group, and the combined stdout+stderr
/// buffer being accumulated.
pub struct ChildHandle {
    child: tokio::process::Child,
    pgid: i32,
}

impl ChildHandle {
    /// Spawn `program` in `cwd` with `env`, in a fresh process group.
    pub fn spawn(program: &str, cwd: &Path, env: &[(String, String)]) -> JoshuaResult<Self> {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| JoshuaError::Io(format!("failed to spawn {program}: {e}")))?;
        let pgid = child
            .id()
            .ok_or_else(|| JoshuaError::Io("child exited before its pid could be read".to_string()))? as i32;
        Ok(ChildHandle { child, pgid })
    }

    /// Wait for the child to exit on its own, capturing combined output.
    pub async fn wait_with_output(mut self) -> JoshuaResult<ChildOutcome> {
        let mut stdout = self.child.stdout.take();
        let mut stderr = self.child.stderr.take();
        let mut output = Vec::new();

        let status = self.child.wait().await.map_err(|e| JoshuaError::Io(e.to_string()))?;
        if let Some(mut s) = stdout.take() {
            let _ = s.read_to_end(&mut output).await;
        }
        if let Some(mut s) = stderr.take() {
            let _ = s.read_to_end(&mut output).await;
        }
        Ok(ChildOutcome {
            code: status.code().unwrap_or(-1),
            output,
        })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }
}

/// §9 `ProcessGroup::kill_all` — abstracts descendant-kill behind a POSIX
/// process-group signal. On a platform without process groups this would
/// need to fall back to enumerating descendants via an environment
/// marker; every target this crate ships for has one.
pub struct ProcessGroup {
    pgid: i32,
}

const MAX_KILL_ATTEMPTS: u32 = 10;
const KILL_RETRY_DELAY: Duration = Duration::from_millis(50);

impl ProcessGroup {
    pub fn new(pgid: i32) -> Self {
        ProcessGroup { pgid }
    }

    pub fn kill_all(&self) -> JoshuaResult<()> {
        for attempt in 1..=MAX_KILL_ATTEMPTS {
            let result = unsafe { libc::kill(-self.pgid, libc::SIGKILL) };
            if result == 0 {
                return Ok(());
            }
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ESRCH) {
                return Ok(()); // group already gone
            }
            tracing::warn!(pgid = self.pgid, attempt, error = %errno, "kill attempt failed, retrying");
            std::thread::sleep(KILL_RETRY_DELAY);
        }
        Err(JoshuaError::FatalChildCleanup(format!(
            "process group {} survived {MAX_KILL_ATTEMPTS} SIGKILL attempts",
            self.pgid
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_runs_a_command_and_captures_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo hello; exit 3").current_dir(tmp.path());
        let output = cmd.output().await.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn kill_all_on_an_already_dead_pgid_succeeds() {
        // A pid that is very unlikely to be alive / a valid group leader.
        let group = ProcessGroup::new(999_999);
        assert!(group.kill_all().is_ok());
    }
}

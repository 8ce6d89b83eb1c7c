//! Subprocess execution for the external OpenPGP tools.
//!
//! One invocation pattern covers every tool family: spawn with piped
//! stdio, feed the message on stdin, collect stdout/stderr, and bound the
//! whole run with a timeout. A hung tool is killed rather than blocking
//! the session indefinitely.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Captured output of one finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    /// Whether the tool exited with status zero.
    pub success: bool,
    /// Exit code, when the tool exited normally.
    pub code: Option<i32>,
    /// Raw standard output (message bytes).
    pub stdout: Vec<u8>,
    /// Raw standard error (diagnostics and status lines).
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    /// Standard output decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One pending tool invocation.
#[derive(Debug)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    input: Option<Vec<u8>>,
    limit: Duration,
}

impl ToolCommand {
    /// Creates an invocation of `program` with the given time limit.
    #[must_use]
    pub fn new(program: impl Into<String>, limit: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            input: None,
            limit,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Supplies the bytes written to the child's stdin.
    #[must_use]
    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(bytes.into());
        self
    }

    /// Runs the tool to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] when the binary cannot be started,
    /// [`Error::Timeout`] when the limit expires (the child is killed),
    /// or [`Error::Io`] when writing the input fails.
    pub async fn run(self) -> Result<ToolOutput> {
        debug!(tool = %self.program, args = ?self.args, "running OpenPGP tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            tool: self.program.clone(),
            source,
        })?;

        if let Some(bytes) = self.input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits early (bad args, unusable input) closes
                // its end of the pipe; that is reported through the exit
                // status, not as a write error here.
                if let Err(e) = stdin.write_all(&bytes).await {
                    debug!(tool = %self.program, error = %e, "stdin write cut short");
                }
                drop(stdin);
            }
        }

        let output = match timeout(self.limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                warn!(tool = %self.program, limit = ?self.limit, "tool timed out, killing it");
                return Err(Error::Timeout {
                    tool: self.program,
                    limit: self.limit,
                });
            }
        };

        debug!(tool = %self.program, code = ?output.status.code(), "tool finished");
        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Writes a passphrase to a private temp file for `--passphrase-file`
/// style handoff.
///
/// The file is created with owner-only permissions and removed when the
/// returned guard is dropped. The passphrase never appears on a command
/// line or in the process environment.
///
/// # Errors
///
/// Returns an error when the temp file cannot be created or written.
pub fn passphrase_file(passphrase: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(passphrase.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Searches `$PATH` for an executable with the given name.
#[must_use]
pub fn find_in_path(binary: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = ToolCommand::new("definitely-not-a-real-pgp-tool", Duration::from_secs(5))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit() {
        let out = ToolCommand::new("sh", Duration::from_secs(5))
            .args(["-c", "printf hello; exit 0"])
            .run()
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout_text(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn feeds_stdin() {
        let out = ToolCommand::new("cat", Duration::from_secs(5))
            .input("round trip")
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout_text(), "round trip");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_is_killed() {
        let err = ToolCommand::new("sleep", Duration::from_millis(50))
            .arg("30")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn passphrase_file_holds_the_bytes() {
        let file = passphrase_file("hunter2").unwrap();
        let read = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(read, "hunter2");
    }

    #[cfg(unix)]
    #[test]
    fn passphrase_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let file = passphrase_file("secret").unwrap();
        let mode = file.as_file().metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "group/other bits must be clear");
    }

    #[test]
    fn find_in_path_misses_nonsense() {
        assert!(find_in_path("no-such-binary-for-sure-12345").is_none());
    }
}

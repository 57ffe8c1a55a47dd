//! External command execution.
//!
//! Storage nodes never call `std::process` directly. They describe commands
//! as [`CommandSpec`]s and hand them to a [`SystemOps`], which is the single
//! seam between the engine and the host (and the place tests substitute).

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{BenchError, BenchResult, SubprocessError};

/// A command line plus the bits of environment it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Written to the process' stdin, which is then closed.
    #[serde(skip)]
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Display name of the program (its file name).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Build a `std::process::Command` with stdio left at its defaults.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Everything storage nodes need from the host.
pub trait SystemOps: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here;
    /// see [`must_run`].
    fn run(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput>;

    fn path_exists(&self, path: &Path) -> bool;

    fn is_block_device(&self, path: &Path) -> bool;

    fn create_dir(&self, path: &Path) -> BenchResult<()>;

    /// Overwrite the first 512 bytes of a device with zeroes.
    fn zero_first_sector(&self, path: &Path) -> BenchResult<()>;
}

/// Run a command and turn a non-zero exit into [`SubprocessError::CommandFailed`].
pub fn must_run(ops: &dyn SystemOps, cmd: &CommandSpec) -> BenchResult<CommandOutput> {
    let output = ops.run(cmd)?;
    if !output.success() {
        tracing::error!(
            command = %cmd,
            code = ?output.status_code,
            stderr = %output.stderr.trim_end(),
            "Command failed"
        );
        return Err(SubprocessError::CommandFailed {
            command: cmd.to_string(),
            code: output.status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
        .into());
    }
    Ok(output)
}

/// Poll `condition` every `interval` until it holds or `timeout` passes.
///
/// Only used for kernel device nodes, which offer nothing to wait on.
pub fn poll_until(
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut condition: impl FnMut() -> bool,
) -> BenchResult<()> {
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(BenchError::Timeout {
                operation: what.to_string(),
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        std::thread::sleep(interval);
    }
}

/// The real host: `std::process::Command` and `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn run(&self, spec: &CommandSpec) -> BenchResult<CommandOutput> {
        tracing::info!(command = %spec, "Running command");

        let mut cmd = spec.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .map_err(BenchError::io(format!("writing stdin of {}", spec.program_name())))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(BenchError::io(format!("waiting for {}", spec.program_name())))?;

        let output = CommandOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        tracing::debug!(
            command = %spec,
            code = ?output.status_code,
            stdout = %output.stdout.trim_end(),
            stderr = %output.stderr.trim_end(),
            "Command finished"
        );

        Ok(output)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_block_device(&self, path: &Path) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn create_dir(&self, path: &Path) -> BenchResult<()> {
        std::fs::create_dir_all(path)
            .map_err(BenchError::io(format!("creating directory {}", path.display())))
    }

    fn zero_first_sector(&self, path: &Path) -> BenchResult<()> {
        tracing::info!(device = %path.display(), "Zeroing first sector");
        let mut dev = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(BenchError::io(format!("opening {}", path.display())))?;
        dev.write_all(&[0u8; 512])
            .and_then(|_| dev.sync_all())
            .map_err(BenchError::io(format!("zeroing {}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let cmd = CommandSpec::new("/usr/sbin/dmsetup")
            .arg("create")
            .arg("my target");
        assert_eq!(cmd.to_string(), "/usr/sbin/dmsetup create 'my target'");
        assert_eq!(cmd.program_name(), "dmsetup");
    }

    #[test]
    fn test_host_run_captures_output() {
        let out = HostSystem
            .run(&CommandSpec::new("/bin/sh").arg("-c").arg("echo out; echo err >&2; exit 3"))
            .unwrap();
        assert_eq!(out.status_code, Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn test_host_run_feeds_stdin() {
        let out = HostSystem
            .run(&CommandSpec::new("/bin/cat").stdin("0 20971520 linear /dev/pmem0 0"))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "0 20971520 linear /dev/pmem0 0");
    }

    #[test]
    fn test_must_run_fails_on_nonzero() {
        let err = must_run(&HostSystem, &CommandSpec::new("/bin/sh").arg("-c").arg("exit 1"))
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Subprocess(SubprocessError::CommandFailed { code: Some(1), .. })
        ));
    }

    #[test]
    fn test_spawn_failure() {
        let err = HostSystem
            .run(&CommandSpec::new("/nonexistent/binary"))
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Subprocess(SubprocessError::SpawnFailed { .. })
        ));
    }

    #[test]
    fn test_poll_until() {
        let mut calls = 0;
        poll_until(Duration::from_millis(1), Duration::from_secs(1), "counter", || {
            calls += 1;
            calls == 3
        })
        .unwrap();
        assert_eq!(calls, 3);

        let err = poll_until(Duration::from_millis(5), Duration::from_millis(20), "never", || false)
            .unwrap_err();
        assert!(err.is_timeout());
    }
}

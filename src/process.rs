//! Subprocess execution for every external tool the pipeline drives.
//!
//! `Cmd` is a small builder around [`std::process::Command`]:
//!
//! - environment overrides are layered on top of the inherited environment,
//!   never replacing it; `PATH` in particular can only be extended
//! - a nonzero exit becomes [`BuildError::ToolFailure`] carrying the argv
//! - [`Cmd::run_capturing`] tees combined stdout/stderr to the console while
//!   buffering it for the caller to parse afterwards
//!
//! ```rust,ignore
//! use axle_builder::process::Cmd;
//!
//! Cmd::new("make")
//!     .dir(&bootloader_dir)
//!     .env("USE_GCC", "1")
//!     .error_msg("bootloader build failed")
//!     .run()?;
//! ```

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use tracing::{debug, info};

use crate::error::BuildError;

/// Result of a finished process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    /// Combined stdout/stderr, only for the capturing runners.
    pub output: Option<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn text(&self) -> &str {
        self.output.as_deref().unwrap_or("")
    }
}

/// Builder for an external tool invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    path_prefixes: Vec<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
    echo: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            path_prefixes: crate::host::default_path_prefixes(),
            error_msg: None,
            allow_fail: false,
            echo: true,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Working directory for the child.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Override one environment variable. A `PATH` override is folded into
    /// the search-path prefixes so the inherited `PATH` survives.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        if key.as_ref() == "PATH" {
            self.path_prefixes
                .extend(std::env::split_paths(value.as_ref()));
        } else {
            self.env
                .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        }
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (k, v) in vars {
            self = self.env(k, v);
        }
        self
    }

    /// Put `dir` in front of the inherited `PATH`.
    pub fn prepend_path(mut self, dir: &Path) -> Self {
        self.path_prefixes.push(dir.to_path_buf());
        self
    }

    /// Context attached to the error when the tool fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output instead of failing on nonzero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Do not echo captured output to the console.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// The command line as it will be executed.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Run with inherited stdio.
    pub fn run(&self) -> Result<ProcessOutput> {
        let mut command = self.command()?;
        let status = command
            .status()
            .with_context(|| format!("Failed to run {}", self.program.to_string_lossy()))?;
        self.check(ProcessOutput {
            status,
            output: None,
        })
    }

    /// Run, streaming combined stdout/stderr line by line to the console
    /// while buffering it. The buffered text is returned in
    /// [`ProcessOutput::output`].
    pub fn run_capturing(&self) -> Result<ProcessOutput> {
        let mut command = self.command()?;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.to_string_lossy()))?;
        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let (tx, rx) = mpsc::channel();
        let readers = [spawn_line_reader(stdout, tx.clone()), spawn_line_reader(stderr, tx)];

        // The channel disconnects once both pipes hit EOF.
        let mut buffer = String::new();
        for line in rx {
            if self.echo {
                println!("{line}");
            }
            buffer.push_str(&line);
            buffer.push('\n');
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.program.to_string_lossy()))?;
        self.check(ProcessOutput {
            status,
            output: Some(buffer),
        })
    }

    fn command(&self) -> Result<Command> {
        let argv = self.argv().join(" ");
        match &self.cwd {
            Some(cwd) => info!("{} (in {})", argv, cwd.display()),
            None => info!("{}", argv),
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if !self.path_prefixes.is_empty() {
            command.env("PATH", self.extended_path()?);
        }
        for (key, value) in &self.env {
            debug!(
                "  env {}={}",
                key.to_string_lossy(),
                value.to_string_lossy()
            );
            command.env(key, value);
        }
        Ok(command)
    }

    fn extended_path(&self) -> Result<OsString> {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        // Later prefixes win, so they go first.
        let dirs = self
            .path_prefixes
            .iter()
            .rev()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).context("PATH entry contains a separator")
    }

    fn check(&self, output: ProcessOutput) -> Result<ProcessOutput> {
        if output.success() || self.allow_fail {
            return Ok(output);
        }
        let err = anyhow::Error::new(BuildError::ToolFailure {
            argv: self.argv(),
            exit_code: output.code(),
        });
        Err(match &self.error_msg {
            Some(msg) => err.context(msg.clone()),
            None => err,
        })
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> std::thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        // Lines are split on raw bytes; invalid UTF-8 is replaced, not fatal.
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_returns_status() {
        let out = Cmd::new("true").run().unwrap();
        assert!(out.success());
        assert!(out.output.is_none());
    }

    #[test]
    fn nonzero_exit_is_tool_failure() {
        let err = Cmd::new("sh").args(["-c", "exit 3"]).run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ToolFailure { argv, exit_code }) => {
                assert_eq!(argv, &["sh", "-c", "exit 3"]);
                assert_eq!(*exit_code, Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_msg_wraps_but_keeps_tool_failure() {
        let err = Cmd::new("false")
            .error_msg("kernel link failed")
            .run()
            .unwrap_err();
        assert_eq!(err.to_string(), "kernel link failed");
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolFailure { .. })
        ));
    }

    #[test]
    fn allow_fail_reports_status() {
        let out = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!out.success());
    }

    #[test]
    fn capturing_collects_stdout_and_stderr() {
        let out = Cmd::new("sh")
            .args(["-c", "echo first; echo second 1>&2; echo third"])
            .quiet()
            .run_capturing()
            .unwrap();
        let text = out.text();
        assert!(text.contains("first\n"));
        assert!(text.contains("second\n"));
        assert!(text.contains("third\n"));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn capturing_survives_invalid_utf8() {
        let out = Cmd::new("sh")
            .args(["-c", "printf 'before\\n\\377\\377\\nafter\\n'"])
            .quiet()
            .run_capturing()
            .unwrap();
        let lines: Vec<_> = out.text().lines().collect();
        assert_eq!(lines, ["before", "\u{FFFD}\u{FFFD}", "after"]);
    }

    #[test]
    fn capturing_still_fails_on_nonzero_exit() {
        let err = Cmd::new("sh")
            .args(["-c", "echo partial; exit 1"])
            .quiet()
            .run_capturing()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolFailure {
                exit_code: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn env_overrides_merge_with_inherited_environment() {
        std::env::set_var("AXLE_INHERITED_VAR", "inherited");
        let out = Cmd::new("sh")
            .args(["-c", "printf '%s:%s' \"$AXLE_TEST_VAR\" \"$AXLE_INHERITED_VAR\""])
            .env("AXLE_TEST_VAR", "set")
            .quiet()
            .run_capturing()
            .unwrap();
        assert_eq!(out.text().trim(), "set:inherited");
    }

    #[test]
    fn path_is_extended_not_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let out = Cmd::new("sh")
            .args(["-c", "printf '%s' \"$PATH\""])
            .env("PATH", tmp.path())
            .quiet()
            .run_capturing()
            .unwrap();
        let path = out.text().trim().to_string();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, tmp.path());
        // `sh` itself was still found through the inherited entries.
        assert!(std::env::split_paths(&path).count() > 1);
    }
}

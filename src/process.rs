//! External command execution.
//!
//! Everything the supervisor does ultimately shells out to a tool
//! (ssh-keygen, gpg, duplicity). [`Cmd`] wraps `std::process::Command` with
//! the pieces those call sites need: captured output, per-command environment,
//! bytes fed to stdin, and a hard wall-clock timeout that kills the child
//! rather than hanging the caller.
//!
//! Output pipes are drained by short-lived reader threads so a chatty child
//! cannot deadlock against a full pipe while we wait on it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Poll interval while waiting for a child with a deadline.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Outcome of a completed (or killed) command.
#[derive(Debug)]
pub struct CmdOutput {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// True when the command was killed at its deadline.
    pub timed_out: bool,
}

impl CmdOutput {
    /// True when the command ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Builder for an external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for this invocation only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Feed `bytes` to the child's stdin, then close it.
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// The command line without its final token.
    ///
    /// Used for debug logging of invocations whose last argument is a
    /// sensitive destination.
    pub fn redacted_line(&self) -> String {
        let mut tokens = Vec::with_capacity(self.args.len());
        tokens.push(self.program.as_str());
        if let Some((_, rest)) = self.args.split_last() {
            tokens.extend(rest.iter().map(String::as_str));
        }
        tokens.join(" ")
    }

    /// Run to completion, capturing output.
    pub fn run(self) -> Result<CmdOutput> {
        self.run_inner(None)
    }

    /// Run with a wall-clock bound. At the deadline the child is killed and
    /// the result reports `timed_out = true`.
    pub fn run_with_timeout(self, timeout: Duration) -> Result<CmdOutput> {
        self.run_inner(Some(timeout))
    }

    fn run_inner(self, timeout: Option<Duration>) -> Result<CmdOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;
        // Readers start before stdin is fed so neither side can block the
        // other on a full pipe.
        let stdout_reader = thread::spawn(move || read_all(stdout));
        let stderr_reader = thread::spawn(move || read_all(stderr));

        if let Some(bytes) = self.stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            let mut stdin = child.stdin.take().context("failed to open child stdin")?;
            stdin
                .write_all(&bytes)
                .with_context(|| format!("writing stdin of '{}'", self.program))?;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let (code, timed_out) = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for '{}'", self.program))?
            {
                break (status.code(), false);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break (None, true);
                }
            }
            thread::sleep(WAIT_POLL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        Ok(CmdOutput {
            code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
        })
    }
}

fn read_all(mut source: impl Read) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = source.read_to_end(&mut buf);
    buf
}

/// Locate a program on PATH.
pub fn which(program: &str) -> Option<PathBuf> {
    // Absolute paths are checked directly.
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.exists().then_some(path);
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Check whether a program is available on PATH.
pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_output_and_code() {
        let output = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .run()
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_nonzero_exit_is_not_success() {
        let output = Cmd::new("sh").args(["-c", "exit 3"]).run().unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let result = Cmd::new("definitely_not_a_real_command_12345").run();
        assert!(result.is_err());
    }

    #[test]
    fn test_stdin_bytes_reach_child() {
        let output = Cmd::new("cat")
            .stdin_bytes(b"hello".to_vec())
            .run()
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_env_is_per_invocation() {
        let output = Cmd::new("sh")
            .args(["-c", "printf %s \"$GITNEST_TEST_VAR\""])
            .env("GITNEST_TEST_VAR", "42")
            .run()
            .unwrap();
        assert_eq!(output.stdout, "42");
    }

    #[test]
    fn test_timeout_kills_the_child() {
        let start = Instant::now();
        let output = Cmd::new("sleep")
            .arg("30")
            .run_with_timeout(Duration::from_millis(200))
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        // Killed near the deadline, not after the full sleep.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_fast_command_beats_its_timeout() {
        let output = Cmd::new("true")
            .run_with_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(output.success());
        assert!(!output.timed_out);
    }

    #[test]
    fn test_redacted_line_drops_final_token() {
        let cmd = Cmd::new("duplicity")
            .args(["incremental", "--include", "/private", "/"])
            .arg("s3://bucket/with-secret");
        let line = cmd.redacted_line();
        assert!(!line.contains("s3://bucket/with-secret"));
        assert!(line.starts_with("duplicity incremental"));
    }

    #[test]
    fn test_which_finds_sh() {
        assert!(exists("sh"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}

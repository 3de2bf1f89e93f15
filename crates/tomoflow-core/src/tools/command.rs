//! Spawning an external program with a deadline.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::consts::PROCESS_POLL_INTERVAL_MS;

use super::{ExecContext, FailureKind, ToolFailure};

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// One call of an external program.
#[derive(Clone, Debug, Default)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Text written to the program's stdin, which is closed afterwards.
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    /// Files that must exist after a successful exit.
    pub expected_outputs: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `flag` followed by `value`.
    pub fn opt(self, flag: &str, value: impl ToString) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    pub fn path_opt(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).arg(path.to_string_lossy().into_owned())
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn expect_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_outputs.push(path.into());
        self
    }

    fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Run `inv` to completion and return its stdout.
///
/// The child is killed once `ctx.deadline` passes. A non-zero exit or a
/// missing expected output is a failure.
pub fn run_invocation(inv: &ToolInvocation, ctx: &ExecContext) -> Result<String, ToolFailure> {
    let command_line = inv.display();
    debug!(command = %command_line, "Spawning external tool");

    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    if let Some(dir) = &inv.current_dir {
        cmd.current_dir(dir);
    }
    let mut child = cmd.spawn().map_err(|e| {
        ToolFailure::launch(format!("cannot start {}: {e}", inv.program.display()))
    })?;

    if let (Some(input), Some(mut pipe)) = (inv.stdin.clone(), child.stdin.take()) {
        thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        });
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = thread::spawn(move || drain(stdout));
    let err_handle = thread::spawn(move || drain(stderr));

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                return Err(ToolFailure::launch(format!("waiting on {command_line}: {e}")));
            }
        }
        if ctx.expired() {
            let _ = child.kill();
            let _ = child.wait();
            warn!(command = %command_line, "Killed external tool at deadline");
            return Err(ToolFailure::timeout(started.elapsed()));
        }
        thread::sleep(Duration::from_millis(PROCESS_POLL_INTERVAL_MS));
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    if !status.success() {
        let code = status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(ToolFailure::new(
            FailureKind::ExitStatus,
            format!(
                "{} exited with {code}: {}",
                inv.program.display(),
                tail(&stderr)
            ),
        ));
    }

    if let Some(missing) = inv.expected_outputs.iter().find(|p| !p.exists()) {
        return Err(ToolFailure::new(
            FailureKind::MissingOutput,
            format!("{} did not produce {}", inv.program.display(), missing.display()),
        ));
    }
    Ok(stdout)
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use bstr::ByteSlice;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A single subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl ShellCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(|a| a.into()).collect(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn program(&self) -> &str {
        self.args.first().map(|s| s.as_str()).unwrap_or_default()
    }
}

impl Display for ShellCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.args.join(" "))
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ShellOutput {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: vec![],
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            stdout: vec![],
            stderr: stderr.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    pub fn stdout_str(&self) -> String {
        self.stdout.to_str_lossy().into_owned()
    }

    pub fn stderr_str(&self) -> String {
        self.stderr.to_str_lossy().into_owned()
    }

    /// Converts a non-zero exit code into an internal error carrying stderr.
    pub fn check(self, command: &str) -> crate::Result<ShellOutput> {
        if self.is_error() {
            return crate::common::error::internal_error(format!(
                "{command} failed with code {}: {}",
                self.code,
                self.stderr.to_str_lossy().trim()
            ));
        }
        Ok(self)
    }
}

/// Capability to run external programs. Production code spawns real processes, tests answer
/// from canned rules.
pub trait ShellExecutor: Send + Sync {
    fn execute(&self, command: ShellCommand) -> BoxFuture<'_, ShellOutput>;
}

pub type ExecutorRef = Arc<dyn ShellExecutor>;

#[derive(Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new_ref() -> ExecutorRef {
        Arc::new(ProcessExecutor)
    }
}

impl ShellExecutor for ProcessExecutor {
    fn execute(&self, command: ShellCommand) -> BoxFuture<'_, ShellOutput> {
        Box::pin(async move {
            log::debug!("Running command `{command}`");
            let output = run_process(&command).await;
            if output.is_error() {
                log::debug!(
                    "Command `{command}` exited with {}: {}",
                    output.code,
                    output.stderr.to_str_lossy().trim()
                );
            }
            output
        })
    }
}

async fn run_process(command: &ShellCommand) -> ShellOutput {
    let Some((program, args)) = command.args.split_first() else {
        return ShellOutput::failure(-1, "Empty command line");
    };
    let mut process = Command::new(program);
    process
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        process.current_dir(cwd);
    }
    process.stdin(if command.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ShellOutput::failure(-1, format!("Cannot start {program}: {error}"));
        }
    };

    if let (Some(input), Some(mut pipe)) = (command.stdin.clone(), child.stdin.take()) {
        // Written concurrently so that a chatty child cannot deadlock on a full stdout pipe.
        tokio::spawn(async move {
            if let Err(error) = pipe.write_all(&input).await {
                log::debug!("Cannot write stdin of child process: {error}");
            }
        });
    }

    match child.wait_with_output().await {
        Ok(output) => ShellOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        },
        Err(error) => ShellOutput::failure(-1, format!("Cannot wait for {program}: {error}")),
    }
}

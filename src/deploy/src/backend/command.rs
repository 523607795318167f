/// Subprocess runner shared by the CLI-backed backends.
///
/// Non-zero exits become [`DeployError::Backend`] tagged by
/// [`classify_failure`], so error wording never leaves this module.
use crate::error::{BackendErrorKind, DeployError, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Map command stderr to a backend error kind.
pub fn classify_failure(stderr: &str) -> BackendErrorKind {
    let text = stderr.to_ascii_lowercase();
    if text.contains("failed calling webhook")
        || (text.contains("webhook") && text.contains("no endpoints available"))
    {
        BackendErrorKind::WebhookUnavailable
    } else if text.contains("connection refused") {
        BackendErrorKind::ConnectionRefused
    } else if text.contains("operation not permitted") {
        BackendErrorKind::OperationNotPermitted
    } else if text.contains("dial tcp") || text.contains("i/o timeout") {
        BackendErrorKind::DialFailure
    } else if text.contains("alreadyexists") || text.contains("already exists") {
        BackendErrorKind::AlreadyExists
    } else if text.contains("notfound") || text.contains("not found") {
        BackendErrorKind::NotFound
    } else {
        BackendErrorKind::Other
    }
}

/// Runs one external program with fixed leading arguments.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    base_args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments prepended to every invocation (e.g. `--context`).
    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run and return the output regardless of exit status.
    pub async fn output(&self, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        tracing::debug!("[Command] {} {}", self.program, args.join(" "));

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|e| {
            DeployError::backend(
                BackendErrorKind::Other,
                format!("spawn {}", self.program),
                e.to_string(),
            )
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run and fail with a classified error on non-zero exit.
    pub async fn run(
        &self,
        operation: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput> {
        let output = self.output(args, stdin).await?;
        if output.success() {
            return Ok(output);
        }

        let message = output
            .stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("No output available")
            .trim()
            .to_string();
        let kind = classify_failure(&output.stderr);
        tracing::debug!(
            "[Command] {} exited with {} ({:?}): {}",
            operation,
            output.exit_code,
            kind,
            message
        );
        Err(DeployError::backend(kind, operation, message))
    }
}

pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

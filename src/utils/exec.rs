//! External command execution.
//!
//! Every external tool (compiler, format builder, page converter) runs
//! through a [`CommandRunner`]. The production [`ProcessRunner`] spawns the
//! tool with `tokio::process`, captures combined output, enforces a timeout
//! and kills the child as soon as the job's cancellation token fires.
//!
//! # Example
//!
//! ```ignore
//! let mut vars = Vars::new();
//! vars.set("main", "main.tex");
//! let spec = CommandSpec::from_template("compile", &config.commands.compile, &vars, root, timeout)?;
//! let output = runner.run(&spec, token.cancellation()).await?;
//! ```

use async_trait::async_trait;
use regex::Regex;
use smallvec::SmallVec;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::OnceLock,
    time::Duration,
};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("`{0}` command template is empty")]
    EmptyCommand(&'static str),

    #[error("Failed to execute `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Failed { message: String, output: String },

    #[error("`{name}` timed out after {}s", .after.as_secs())]
    Timeout { name: String, after: Duration },

    #[error("`{name}` cancelled")]
    Cancelled { name: String },
}

impl ExecError {
    /// Captured tool output, if the tool got far enough to produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

// ============================================================================
// Command Templates
// ============================================================================

/// Placeholder values substituted into `{name}` slots of a command template.
#[derive(Debug, Default, Clone)]
pub struct Vars(SmallVec<[(&'static str, String); 8]>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Replace every known `{key}` in `template`. Unknown slots are kept verbatim.
    pub fn expand(&self, template: &str) -> String {
        self.0.iter().fold(template.to_owned(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
    }
}

/// A fully expanded command ready to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Stage label used in logs (`compile`, `render`, ...).
    pub label: &'static str,
    pub argv: Vec<OsString>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl CommandSpec {
    /// Expand a template; arguments that expand to nothing are dropped.
    pub fn from_template(
        label: &'static str,
        template: &[String],
        vars: &Vars,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<Self, ExecError> {
        let argv: Vec<OsString> = template
            .iter()
            .map(|arg| vars.expand(arg))
            .filter(|arg| !arg.is_empty())
            .map(OsString::from)
            .collect();

        if argv.is_empty() {
            return Err(ExecError::EmptyCommand(label));
        }

        Ok(Self {
            label,
            argv,
            cwd: cwd.to_path_buf(),
            timeout,
        })
    }

    /// Program name for log display.
    pub fn name(&self) -> String {
        self.argv
            .first()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Argument by position after the program, lossily converted.
    #[cfg(test)]
    pub fn arg(&self, index: usize) -> Option<String> {
        self.argv
            .get(index + 1)
            .map(|s| s.to_string_lossy().into_owned())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// stdout followed by stderr.
    pub combined: String,
}

// ============================================================================
// Runner
// ============================================================================

/// Executes commands on behalf of the build stages.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, or until `cancel` fires or the timeout elapses.
    ///
    /// A non-zero exit is an error carrying the captured output.
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError>;
}

/// Spawns real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let name = spec.name();
        let mut command = Command::new(&spec.argv[0]);
        command
            .args(&spec.argv[1..])
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future below kills a cancelled or timed-out child
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ExecError::Spawn {
            name: name.clone(),
            source,
        })?;

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ExecError::Cancelled { name }),
            waited = tokio::time::timeout(spec.timeout, child.wait_with_output()) => match waited {
                Err(_) => return Err(ExecError::Timeout { name, after: spec.timeout }),
                Ok(Err(source)) => return Err(ExecError::Spawn { name, source }),
                Ok(Ok(output)) => output,
            },
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let message = format_error(spec.label, &name, &output.status.to_string(), &combined);
            return Err(ExecError::Failed {
                message,
                output: combined,
            });
        }

        Ok(CommandOutput { combined })
    }
}

// ============================================================================
// Output Filtering
// ============================================================================

fn strip_ansi(s: &str) -> std::borrow::Cow<'_, str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi regex"));
    re.replace_all(s, "")
}

/// Filter rule selecting the interesting lines of tool output.
///
/// Used to keep failure messages short: compilers print pages of progress
/// chatter before the actual error.
pub struct FilterRule {
    /// Prefixes of lines worth keeping.
    pub keep_prefixes: &'static [&'static str],
}

impl FilterRule {
    pub const fn new(keep_prefixes: &'static [&'static str]) -> Self {
        Self { keep_prefixes }
    }

    fn keeps(&self, line: &str) -> bool {
        !line.is_empty() && self.keep_prefixes.iter().any(|p| line.starts_with(p))
    }

    /// Lines matching the rule, ANSI stripped.
    pub fn select(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .map(|l| strip_ansi(l).trim().to_owned())
            .filter(|l| self.keeps(l))
            .collect()
    }
}

/// TeX-family error lines (`! Undefined control sequence.`, `l.12 ...`).
pub const ERROR_FILTER: FilterRule = FilterRule::new(&["!", "l.", "Error", "error:"]);

/// Lines of tail context when no error line is recognised.
const TAIL_LINES: usize = 15;

/// Format command error message with filtering.
fn format_error(label: &str, name: &str, status: &str, output: &str) -> String {
    let mut msg = format!("Command `{name}` ({label}) failed with {status}");

    let mut lines = ERROR_FILTER.select(output);
    if lines.is_empty() {
        let all: Vec<_> = output.lines().map(|l| strip_ansi(l).into_owned()).collect();
        lines = all[all.len().saturating_sub(TAIL_LINES)..].to_vec();
    }
    for line in lines.iter().filter(|l| !l.trim().is_empty()) {
        msg.push('\n');
        msg.push_str(line);
    }
    msg
}

// ============================================================================
// Tests
// ============================================================================

//! Safe command builder with allowlisting, argument validation and timeouts.

use crate::error::ValidationError;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Timeout applied when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Programs that are explicitly allowed to be executed.
///
/// Each variant has a conventional program name; deployments that install the
/// tools elsewhere override it with [`SafeCommand::with_program_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AllowedProgram {
    /// The `awg` tool (key generation, `show`, `syncconf`).
    Awg,
    /// The `awg-quick` wrapper (`up`, `down`, `strip`).
    AwgQuick,
    /// The iproute2 `ip` tool, used to observe link state.
    Ip,
    /// The firewall setup script.
    FirewallSetup,
    /// The firewall cleanup script.
    FirewallCleanup,
}

impl AllowedProgram {
    /// Get the default program name/path to execute.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awg => "awg",
            Self::AwgQuick => "awg-quick",
            Self::Ip => "ip",
            Self::FirewallSetup => "/app/scripts/setup_iptables.sh",
            Self::FirewallCleanup => "/app/scripts/cleanup_iptables.sh",
        }
    }
}

impl fmt::Display for AllowedProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during safe command execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Validation of a command argument failed.
    #[error("argument validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// The program could not be started (missing binary, permissions).
    #[error("command execution failed: {message}")]
    ExecutionFailed {
        /// Description of the failure.
        message: String,
    },

    /// The command returned a non-zero exit code.
    #[error("command '{command}' exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        /// The command that was executed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The command did not finish in time and was killed.
    #[error("command '{command}' timed out after {timeout_secs}s")]
    Timeout {
        /// The command that was executed.
        command: String,
        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// An I/O error occurred while talking to the child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// Create an execution failed error.
    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Create a non-zero exit error.
    #[must_use]
    pub fn non_zero_exit(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::NonZeroExit {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Check if this is a validation error.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::ValidationFailed(_))
    }

    /// Check if the command ran out of time.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Characters that are never allowed in command arguments.
const FORBIDDEN_CHARS: &[char] = &['\0', '\n', '\r'];

/// Validate a command argument.
///
/// # Errors
///
/// Returns an error if the argument contains forbidden characters.
pub fn validate_argument(arg: &str, field_name: &str) -> Result<(), ValidationError> {
    match arg.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        Some(c) => Err(ValidationError::forbidden_character(field_name, c)),
        None => Ok(()),
    }
}

/// Validate a program path.
///
/// # Errors
///
/// Returns an error if the path is empty, traverses upwards or carries
/// shell metacharacters.
pub fn validate_program_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::empty("program_path"));
    }

    if path.contains("..") {
        return Err(ValidationError::path_traversal("program_path", ".."));
    }

    for c in path.chars() {
        if FORBIDDEN_CHARS.contains(&c) || matches!(c, ';' | '&' | '|' | '$' | '`') {
            return Err(ValidationError::forbidden_character("program_path", c));
        }
    }

    Ok(())
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Exit status code (0 for success, -1 when killed by a signal).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Get stdout as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the command succeeded (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A safe command builder that validates all inputs.
///
/// Validation problems are collected while building and reported by
/// [`execute`](Self::execute) before anything is spawned.
#[derive(Debug)]
pub struct SafeCommand {
    program: AllowedProgram,
    program_path: Option<String>,
    args: Vec<String>,
    validation_errors: Vec<ValidationError>,
    env_vars: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
}

impl SafeCommand {
    /// Create a new safe command for the given program.
    #[must_use]
    pub fn new(program: AllowedProgram) -> Self {
        Self {
            program,
            program_path: None,
            args: Vec::new(),
            validation_errors: Vec::new(),
            env_vars: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a custom path for the program instead of its default name.
    #[must_use]
    pub fn with_program_path(mut self, path: &str) -> Self {
        match validate_program_path(path) {
            Ok(()) => self.program_path = Some(path.to_string()),
            Err(e) => self.validation_errors.push(e),
        }
        self
    }

    /// Add a single argument to the command.
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        match validate_argument(arg, "argument") {
            Ok(()) => self.args.push(arg.to_string()),
            Err(e) => self.validation_errors.push(e),
        }
        self
    }

    /// Add multiple arguments to the command.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg.as_ref());
        }
        self
    }

    /// Set an environment variable for the command.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        if let Err(e) = validate_argument(key, "env_key") {
            self.validation_errors.push(e);
            return self;
        }
        if let Err(e) = validate_argument(value, "env_value") {
            self.validation_errors.push(e);
            return self;
        }
        self.env_vars.push((key.to_string(), value.to_string()));
        self
    }

    /// Feed bytes to the child's standard input.
    ///
    /// Stdin is not validated; it never reaches an argument vector.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Bound the total runtime of the command.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if there are any validation errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.validation_errors.is_empty()
    }

    /// Get any validation errors that occurred.
    #[must_use]
    pub fn errors(&self) -> &[ValidationError] {
        &self.validation_errors
    }

    fn program(&self) -> &str {
        self.program_path.as_deref().unwrap_or(self.program.as_str())
    }

    /// Build the command description for logging.
    fn command_description(&self) -> String {
        if self.args.is_empty() {
            return self.program().to_string();
        }
        format!("{} {}", self.program(), self.args.join(" "))
    }

    /// Execute the command and return the output.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Validation errors were collected during building
    /// - The command fails to start
    /// - The command exceeds its timeout
    /// - The command returns a non-zero exit code
    pub async fn execute(self) -> Result<CommandOutput, CommandError> {
        let description = self.command_description();
        let output = self.execute_unchecked().await?;

        if !output.success() {
            return Err(CommandError::non_zero_exit(
                description,
                output.exit_code,
                output.stderr_lossy().trim(),
            ));
        }

        Ok(output)
    }

    /// Execute the command without checking the exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if validation failed, the command couldn't be started
    /// or it exceeded its timeout.
    pub async fn execute_unchecked(mut self) -> Result<CommandOutput, CommandError> {
        if let Some(error) = self.validation_errors.drain(..).next() {
            return Err(CommandError::ValidationFailed(error));
        }

        let description = self.command_description();
        debug!(command = %description, "executing");

        let mut cmd = TokioCommand::new(self.program());
        cmd.args(&self.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CommandError::execution_failed(format!("{description}: {e}")))?;

        let input = self.stdin.take();
        let run = async move {
            if let (Some(input), Some(mut pipe)) = (input, child.stdin.take()) {
                pipe.write_all(&input).await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CommandError::Timeout {
                    command: description,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

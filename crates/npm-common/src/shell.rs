//! Shell command execution for the OS drivers.
//!
//! Commands are assembled from argument lists and every argument is quoted,
//! so set names and comments coming from cluster objects can never break out
//! of the command line.
//!
//! # Example
//!
//! ```ignore
//! use npm_common::shell::{self, IPTABLES_CMD};
//!
//! let cmd = shell::command_line(IPTABLES_CMD, &["-w", "60", "-N", "AZURE-NPM"]);
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{DriverError, DriverResult};

/// Path to the `iptables` command.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Characters that need escaping inside double quotes: $, `, ", \ and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Arguments made only of these characters are passed through unquoted.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_./:,=+@%-]+$").expect("Invalid regex pattern"));

/// Quotes a string for safe use in a shell command.
///
/// ```
/// use npm_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Joins a program and its arguments into one command line.
///
/// Plain tokens (flags, chain names, numbers) stay readable in logs; anything
/// else is quoted with [`shellquote`].
pub fn command_line<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = String::from(program);
    for arg in args {
        let arg = arg.as_ref();
        line.push(' ');
        if SHELL_SAFE_RE.is_match(arg) {
            line.push_str(arg);
        } else {
            line.push_str(&shellquote(arg));
        }
    }
    line
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout and stderr together for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Executes a command line through `/bin/sh -c`.
///
/// A non-zero exit code is not an error here; use [`exec_or_throw`] for that.
pub async fn exec(cmd: &str) -> DriverResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| DriverError::Spawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::debug!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command returned non-zero"
        );
    }

    Ok(result)
}

/// Executes a command line and turns a non-zero exit into an error.
///
/// Returns stdout on success.
pub async fn exec_or_throw(cmd: &str) -> DriverResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(DriverError::CommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_command_line_plain_tokens() {
        let cmd = command_line(IPTABLES_CMD, &["-w", "60", "-t", "filter", "-N", "AZURE-NPM"]);
        assert_eq!(cmd, "/sbin/iptables -w 60 -t filter -N AZURE-NPM");
    }

    #[test]
    fn test_command_line_quotes_unsafe_args() {
        let cmd = command_line(
            IPTABLES_CMD,
            &["-m", "comment", "--comment", "allow from ns/app; rm -rf"],
        );
        assert_eq!(
            cmd,
            "/sbin/iptables -m comment --comment \"allow from ns/app; rm -rf\""
        );
    }

    #[test]
    fn test_command_line_keeps_negation_quoted() {
        let cmd = command_line(IPTABLES_CMD, &["!", "--match-set"]);
        assert_eq!(cmd, "/sbin/iptables \"!\" --match-set");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "stdout\nstderr");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        match exec_or_throw("exit 3").await {
            Err(DriverError::CommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }
}

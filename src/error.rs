//! Typed errors carried underneath `anyhow`.
//!
//! Most code just `bail!`s with a message. These two types exist so callers
//! can tell a refused precondition from a failed external command with
//! `err.downcast_ref::<T>()`.

use std::fmt::Write as _;

/// A run was refused before any external work was attempted.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PreconditionError(pub String);

impl PreconditionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A wrapped external command exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("command failed ({}): {command}", exit_label(.code))]
pub struct CommandFailed {
    /// The command line as it was invoked.
    pub command: String,
    /// Exit code, `None` when the child was killed by a signal.
    pub code: Option<i32>,
    /// Combined stdout/stderr captured while the command ran.
    pub output: String,
}

impl CommandFailed {
    /// Multi-line diagnostic: command line, exit code, then the captured
    /// output indented by four spaces.
    pub fn diagnostic(&self) -> String {
        let mut out = format!(
            "command failed: {}\n  exit code: {}\n  output:\n",
            self.command,
            exit_label(&self.code)
        );
        if self.output.trim().is_empty() {
            out.push_str("    (no output)\n");
        }
        for line in self.output.lines() {
            let _ = writeln!(out, "    {line}");
        }
        out
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match *code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_indents_output() {
        let err = CommandFailed {
            command: "make -j8 bindeb-pkg".to_string(),
            code: Some(2),
            output: "line one\nline two\n".to_string(),
        };
        let text = err.diagnostic();
        assert!(text.starts_with("command failed: make -j8 bindeb-pkg\n"));
        assert!(text.contains("  exit code: 2\n"));
        assert!(text.contains("    line one\n    line two\n"));
    }

    #[test]
    fn signal_exit_has_label() {
        let err = CommandFailed {
            command: "curl".to_string(),
            code: None,
            output: String::new(),
        };
        assert!(err.to_string().contains("killed by signal"));
        assert!(err.diagnostic().contains("(no output)"));
    }
}

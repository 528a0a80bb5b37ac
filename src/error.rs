//! Error types for nimbus.
//!
//! Messages are lowercase and follow a consistent shape:
//! `"<operation> failed: <reason>"` for failures and
//! `"<entity> not found: <identifier>"` for missing resources. The engine
//! variant keeps the exact command line and stderr so callers can match
//! known substrings ("not running", "No such file") instead of guessing.

use thiserror::Error;

/// Result type alias using nimbus's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in nimbus operations.
#[derive(Error, Debug)]
pub enum Error {
    /// VM not found by name.
    #[error("vm not found: {name}")]
    VmNotFound {
        /// Name of the VM that was not found.
        name: String,
    },

    /// VM is in a state the operation does not accept.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the VM reported.
        actual: String,
    },

    /// VM is running but the engine reports no IPv4 address.
    #[error("vm has no ip address: {name}")]
    NoIpAddress {
        /// Name of the VM without an address.
        name: String,
    },

    /// The engine CLI exited non-zero.
    ///
    /// `command` is the full command line, `stderr` the captured stream.
    #[error("engine command failed: {command}: {stderr}")]
    Engine {
        /// The command line that was executed.
        command: String,
        /// Trimmed stderr output.
        stderr: String,
    },

    /// The engine produced output nimbus could not parse.
    #[error("engine output parse failed: {operation}: {reason}")]
    EngineOutput {
        /// The operation whose output was unparseable.
        operation: String,
        /// Why parsing failed.
        reason: String,
    },

    /// Input violated a schema rule before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Tunnel record absent for the given host port.
    #[error("tunnel not found: {port}")]
    TunnelNotFound {
        /// Host port of the missing tunnel.
        port: u16,
    },

    /// Network policy step failed inside the VM.
    #[error("network policy {step} failed: {reason}")]
    PolicyStep {
        /// Installation step that failed (e.g. "transfer script").
        step: String,
        /// Why it failed.
        reason: String,
    },

    /// Missing or incorrect token on a protected path.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Reverse-proxy transport to the VM failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Configuration operation failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g. "load", "save").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a VM not found error.
    pub fn vm_not_found(name: impl Into<String>) -> Self {
        Self::VmNotFound { name: name.into() }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an engine command error.
    pub fn engine(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Engine {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create an engine output parse error.
    pub fn engine_output(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EngineOutput {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Create a policy installation step error.
    pub fn policy_step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyStep {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Create a config operation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// True when the engine reported a missing in-VM path.
    ///
    /// Multipass surfaces missing files as `cat: ...: No such file or
    /// directory` on stderr; callers treat that as structured absence.
    pub fn is_no_such_file(&self) -> bool {
        matches!(self, Self::Engine { stderr, .. } if stderr.contains("No such file"))
    }
}

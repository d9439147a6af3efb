use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Rejected before any socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("node has neither a password nor a private key")]
    Missing,
    #[error("node has both a password and a private key; exactly one is allowed")]
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Refused,
    Timeout,
    AuthFailed,
    Unreachable,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectErrorKind::Refused => "refused",
            ConnectErrorKind::Timeout => "timeout",
            ConnectErrorKind::AuthFailed => "auth-failed",
            ConnectErrorKind::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("connection to {address} failed ({kind}): {message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub address: String,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("command timed out after {}s", after.as_secs())]
    Timeout { after: Duration },
    #[error("ssh channel error: {0}")]
    Channel(String),
    #[error("executor worker failed: {0}")]
    Worker(String),
}

impl ExecError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ExecError::Connect(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("no script template for distro '{distro}' and step '{step}'")]
    NotFound { distro: String, step: String },
    #[error("distro '{0}' has no known package family for repository blocks")]
    UnsupportedDistro(String),
    #[error("malformed template key '{0}', expected '<distro>_<step>'")]
    MalformedKey(String),
    #[error("repository block '{0}' is not terminated")]
    UnterminatedBlock(String),
    #[error("failed to persist templates: {0}")]
    Persist(String),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("log entry '{0}' not found")]
    NotFound(String),
    #[error("log entry '{id}' is already {status} and cannot change")]
    AlreadyTerminal { id: String, status: String },
    #[error("log entry cannot move to running")]
    NotTerminal,
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Failure of one orchestration step on one node.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("`{command}` exited with status {exit_code}: {stderr}")]
    RemoteCommand {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl StepError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, StepError::Exec(e) if e.is_connection_failure())
    }
}

/// What an operator needs to diagnose a failed step: the exact command and its output.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{step} failed on {node_name}: {message}")]
pub struct StepFailure {
    pub step: String,
    pub node_id: String,
    pub node_name: String,
    pub command: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node '{0}' not found")]
    NotFound(String),
    #[error("invalid node: {0}")]
    Invalid(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no package source at index {0}")]
    IndexOutOfRange(usize),
    #[error("invalid package source: {0}")]
    Invalid(String),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch requires at least one node id")]
    EmptySelection,
    #[error("unknown batch operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid batch parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot {action} while workflow is in {from}")]
    InvalidTransition { from: String, action: &'static str },
    #[error("invalid workflow input: {0}")]
    Validation(String),
    #[error("no join token available")]
    TokenMissing,
    #[error("join token expired at {0}")]
    TokenExpired(chrono::DateTime<chrono::Utc>),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Failed(#[from] StepFailure),
}

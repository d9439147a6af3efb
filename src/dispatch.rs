//! Audit-wrapped executor calls shared by the batch controller and the workflow.
//!
//! Every call opens a `running` log entry before the executor is touched and closes it with
//! the terminal status afterwards, so live observers always see both ends of a step.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::error::{ExecError, StepError, StepFailure};
use crate::executor::{CommandOutput, RemoteExecutor};
use crate::models::{LogStatus, Node, NodeStatus};
use crate::registry::NodeRegistry;
use crate::templates::{RenderParams, ScriptTemplateStore};

/// Command recorded in the audit log for a bare connection check.
pub const CHECK_COMMAND: &str = "ssh connect";

pub struct Dispatcher {
    executor: Arc<dyn RemoteExecutor>,
    templates: Arc<ScriptTemplateStore>,
    audit: Arc<AuditLog>,
    registry: Arc<NodeRegistry>,
    command_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        templates: Arc<ScriptTemplateStore>,
        audit: Arc<AuditLog>,
        registry: Arc<NodeRegistry>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            templates,
            audit,
            registry,
            command_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    /// Render `step` for the node's distro. A render failure is logged as a failed entry.
    pub fn render(
        &self,
        node: &Node,
        operation: &str,
        step: &str,
        params: &RenderParams,
    ) -> Result<String, StepError> {
        match self.templates.render(&node.distro, step, params) {
            Ok(script) => Ok(script),
            Err(e) => {
                tracing::error!("Render of {} for {} failed: {}", step, node.name, e);
                self.record_failure(node, operation, "", &e.to_string());
                Err(e.into())
            }
        }
    }

    pub async fn run_step(
        &self,
        node: &Node,
        operation: &str,
        step: &str,
        params: &RenderParams,
    ) -> Result<CommandOutput, StepError> {
        let script = self.render(node, operation, step, params)?;
        self.run_script(node, operation, &script).await
    }

    /// Run an already rendered script. A non-zero exit comes back as
    /// [`StepError::RemoteCommand`] with the captured output.
    pub async fn run_script(
        &self,
        node: &Node,
        operation: &str,
        script: &str,
    ) -> Result<CommandOutput, StepError> {
        let entry = self.audit.start(node, operation, script)?;
        tracing::debug!("Dispatching {} to {} (log {})", operation, node.name, entry.id);
        let result = self
            .executor
            .run_script(node, script, self.command_timeout)
            .await;
        self.finish(node, &entry.id, script, result)
    }

    pub async fn check(&self, node: &Node, operation: &str) -> Result<(), StepError> {
        let entry = self.audit.start(node, operation, CHECK_COMMAND)?;
        let result = self.executor.check(node).await.map(|()| CommandOutput {
            stdout: format!("connected to {}", node.address()),
            stderr: String::new(),
            exit_code: 0,
        });
        self.finish(node, &entry.id, CHECK_COMMAND, result).map(|_| ())
    }

    /// Best-effort lifecycle update; a node deleted mid-operation is only logged.
    pub fn mark(&self, node: &Node, status: NodeStatus) {
        if let Err(e) = self.registry.set_status(&node.id, status) {
            tracing::warn!("Could not mark {} as {}: {}", node.name, status.as_str(), e);
        }
    }

    fn finish(
        &self,
        node: &Node,
        entry_id: &str,
        command: &str,
        result: Result<CommandOutput, ExecError>,
    ) -> Result<CommandOutput, StepError> {
        match result {
            Ok(output) if output.success() => {
                self.close(entry_id, LogStatus::Success, &output.combined());
                Ok(output)
            }
            Ok(output) => {
                self.close(entry_id, LogStatus::Failed, &output.combined());
                Err(StepError::RemoteCommand {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Err(e) => {
                self.close(entry_id, LogStatus::Failed, &e.to_string());
                if e.is_connection_failure() {
                    self.mark(node, NodeStatus::Unreachable);
                }
                Err(e.into())
            }
        }
    }

    fn close(&self, entry_id: &str, status: LogStatus, output: &str) {
        // The log may have been cleared while the command ran.
        if let Err(e) = self.audit.update_status(entry_id, status, output) {
            tracing::warn!("Could not close log entry {}: {}", entry_id, e);
        }
    }

    fn record_failure(&self, node: &Node, operation: &str, command: &str, message: &str) {
        match self.audit.start(node, operation, command) {
            Ok(entry) => self.close(&entry.id, LogStatus::Failed, message),
            Err(e) => tracing::warn!("Could not record failure for {}: {}", node.name, e),
        }
    }
}

/// Diagnostic report for a failed step, carrying the command and whatever it printed.
pub fn step_failure(node: &Node, step: &str, command: &str, err: &StepError) -> StepFailure {
    let (output, exit_code) = match err {
        StepError::RemoteCommand {
            exit_code,
            stdout,
            stderr,
            ..
        } => (
            CommandOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
            }
            .combined(),
            Some(*exit_code),
        ),
        _ => (String::new(), None),
    };
    StepFailure {
        step: step.to_string(),
        node_id: node.id.clone(),
        node_name: node.name.clone(),
        command: command.to_string(),
        output,
        exit_code,
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    //! Wiring shared by the dispatch, batch and workflow tests.

    use super::*;
    use crate::database::MemoryStore;
    use crate::executor::fake::FakeExecutor;
    use crate::models::{NodeDraft, NodeRole};

    pub struct Harness {
        pub exec: Arc<FakeExecutor>,
        pub registry: Arc<NodeRegistry>,
        pub audit: Arc<AuditLog>,
        pub dispatcher: Arc<Dispatcher>,
    }

    impl Harness {
        pub fn new(exec: FakeExecutor) -> Self {
            let store = Arc::new(MemoryStore::new());
            let exec = Arc::new(exec);
            let registry = Arc::new(NodeRegistry::new(store.clone()));
            let audit = Arc::new(AuditLog::open(store.clone(), 64).unwrap());
            let templates = Arc::new(ScriptTemplateStore::with_defaults(store));
            let dispatcher = Arc::new(Dispatcher::new(
                exec.clone(),
                templates,
                audit.clone(),
                registry.clone(),
                Duration::from_secs(5),
            ));
            Self {
                exec,
                registry,
                audit,
                dispatcher,
            }
        }

        pub fn add_node(&self, name: &str, role: NodeRole) -> Node {
            self.registry
                .create(NodeDraft {
                    name: name.into(),
                    ip: format!("10.0.0.{}", self.registry.list().unwrap().len() + 1),
                    port: 22,
                    username: "root".into(),
                    password: Some("secret".into()),
                    private_key: None,
                    distro: None,
                    node_type: role,
                })
                .unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::Harness;
    use super::*;
    use crate::error::CredentialError;
    use crate::executor::fake::{exit, refused, FakeExecutor};
    use crate::models::NodeRole;
    use crate::templates::PREFLIGHT;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn successful_step_opens_and_closes_one_entry() {
        let h = Harness::new(FakeExecutor::new());
        let node = h.add_node("a", NodeRole::Worker);
        let mut sub = h.audit.subscribe();

        h.dispatcher
            .run_step(&node, "preflight", PREFLIGHT, &RenderParams::new("1.30.2"))
            .await
            .unwrap();

        let started = sub.next().await.unwrap();
        let finished = sub.next().await.unwrap();
        assert_eq!(started.status, LogStatus::Running);
        assert_eq!(finished.status, LogStatus::Success);
        assert_eq!(h.audit.list_by_node(&node.id).len(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_remote_command_error() {
        let exec = FakeExecutor::new();
        exec.on(|_, _| Some(Ok(exit(2, "swap is enabled"))));
        let h = Harness::new(exec);
        let node = h.add_node("a", NodeRole::Worker);

        let err = h
            .dispatcher
            .run_step(&node, "preflight", PREFLIGHT, &RenderParams::new("1.30.2"))
            .await
            .unwrap_err();
        let report = step_failure(&node, PREFLIGHT, "script", &err);
        assert_eq!(report.exit_code, Some(2));
        assert_eq!(report.output, "swap is enabled");

        let entry = &h.audit.list_by_node(&node.id)[0];
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.output, "swap is enabled");
    }

    #[tokio::test]
    async fn connection_failure_marks_node_unreachable() {
        let exec = FakeExecutor::new();
        exec.on(|node, _| Some(Err(refused(node))));
        let h = Harness::new(exec);
        let node = h.add_node("a", NodeRole::Worker);

        let err = h.dispatcher.check(&node, "test-connection").await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(h.registry.get(&node.id).unwrap().status, NodeStatus::Unreachable);
    }

    #[tokio::test]
    async fn missing_credential_never_connects() {
        let h = Harness::new(FakeExecutor::new());
        let mut node = h.add_node("a", NodeRole::Worker);
        node.credential = None;

        let err = h.dispatcher.run_script(&node, "reset", "kubeadm reset -f").await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Exec(ExecError::Credential(CredentialError::Missing))
        ));
        assert_eq!(h.exec.connections.load(Ordering::SeqCst), 0);
        assert_eq!(h.audit.list()[0].status, LogStatus::Failed);
    }

    #[tokio::test]
    async fn render_failure_is_logged_without_dispatch() {
        let h = Harness::new(FakeExecutor::new());
        let node = h.add_node("a", NodeRole::Worker);

        let err = h
            .dispatcher
            .run_step(&node, "custom", "no_such_step", &RenderParams::new("1.30.2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Template(_)));
        assert!(h.exec.calls_for(&node.id).is_empty());
        let entry = &h.audit.list()[0];
        assert_eq!(entry.status, LogStatus::Failed);
        assert!(entry.output.contains("no_such_step"));
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::error::ExecError;
use crate::models::Node;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined for audit records.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs commands on managed hosts.
///
/// Implementations must check the node's credential before opening any connection and
/// must serialize calls against the same node.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Open and close a short-lived session to prove the node is reachable.
    async fn check(&self, node: &Node) -> Result<(), ExecError>;

    /// Run one command line. A non-zero exit is returned as data, not as an error.
    async fn run(&self, node: &Node, command: &str, timeout: Duration)
        -> Result<CommandOutput, ExecError>;

    /// Upload a script and run it to completion in one remote shell.
    async fn run_script(&self, node: &Node, script: &str, timeout: Duration)
        -> Result<CommandOutput, ExecError>;
}

/// One async mutex per node id; holding the guard gives exclusive use of that node.
#[derive(Default)]
pub struct NodeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, node_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = lock(&self.locks);
            locks
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        // Tokio mutexes queue waiters fairly, so calls run in submission order.
        lock.lock_owned().await
    }

    /// Run blocking `work` for a node on the blocking pool, bounded by `limit`.
    ///
    /// When the limit passes, the caller gets [`ExecError::Timeout`] once the worker has
    /// been cancelled and has returned. The node stays locked until then, so the next
    /// call for the same node never overlaps a worker that is still unwinding.
    pub async fn run_blocking<T, F>(&self, node_id: &str, limit: Duration, work: F) -> Result<T, ExecError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelSignal) -> Result<T, ExecError> + Send + 'static,
    {
        let _guard = self.acquire(node_id).await;
        let cancel = CancelSignal::default();
        let signal = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || work(&signal));

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ExecError::Worker(join.to_string())),
            Err(_) => {
                tracing::warn!("Call on node {} passed {:?}; cancelling", node_id, limit);
                cancel.cancel();
                if let Err(e) = task.await {
                    tracing::warn!("Cancelled worker for node {} failed: {}", node_id, e);
                }
                Err(ExecError::Timeout { after: limit })
            }
        }
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Tells a blocking worker its caller gave up. Hooks registered with
/// [`on_cancel`](Self::on_cancel) unblock it, e.g. by shutting down its socket.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<CancelHook>>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Run `hook` on cancellation, or right away if already cancelled.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = lock(&self.inner.hooks);
        if self.is_cancelled() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    pub fn cancel(&self) {
        let hooks = {
            let mut hooks = lock(&self.inner.hooks);
            self.inner.cancelled.store(true, Ordering::SeqCst);
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted executor used by unit tests across the crate.

    use super::*;
    use crate::error::{ConnectError, ConnectErrorKind, CredentialError};
    use std::sync::atomic::AtomicUsize;

    type Rule = Box<dyn Fn(&Node, &str) -> Option<Result<CommandOutput, ExecError>> + Send + Sync>;

    /// Answers every call with exit 0 unless a rule matches. Records every call.
    #[derive(Default)]
    pub struct FakeExecutor {
        rules: Mutex<Vec<Rule>>,
        pub calls: Mutex<Vec<(String, String)>>,
        pub connections: AtomicUsize,
        pub delay: Option<Duration>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn exit(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: code,
        }
    }

    pub fn refused(node: &Node) -> ExecError {
        ExecError::Connect(ConnectError::new(
            ConnectErrorKind::Refused,
            node.address(),
            "connection refused",
        ))
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn on<F>(&self, rule: F)
        where
            F: Fn(&Node, &str) -> Option<Result<CommandOutput, ExecError>> + Send + Sync + 'static,
        {
            self.rules.lock().unwrap().push(Box::new(rule));
        }

        pub fn clear_rules(&self) {
            self.rules.lock().unwrap().clear();
        }

        pub fn calls_for(&self, node_id: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == node_id)
                .map(|(_, c)| c.clone())
                .collect()
        }

        async fn answer(&self, node: &Node, text: &str) -> Result<CommandOutput, ExecError> {
            if node.credential.is_none() {
                return Err(CredentialError::Missing.into());
            }
            self.connections.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((node.id.clone(), text.to_string()));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let rules = self.rules.lock().unwrap();
            for rule in rules.iter() {
                if let Some(result) = rule(node, text) {
                    return result;
                }
            }
            Ok(ok(""))
        }
    }

    #[async_trait]
    impl RemoteExecutor for FakeExecutor {
        async fn check(&self, node: &Node) -> Result<(), ExecError> {
            self.answer(node, "true").await.map(|_| ())
        }

        async fn run(&self, node: &Node, command: &str, _timeout: Duration)
            -> Result<CommandOutput, ExecError> {
            self.answer(node, command).await
        }

        async fn run_script(&self, node: &Node, script: &str, _timeout: Duration)
            -> Result<CommandOutput, ExecError> {
            self.answer(node, script).await
        }
    }
}

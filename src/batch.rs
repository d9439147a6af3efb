//! Fleet-wide operations fanned out over a bounded pool of workers.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::dispatch::Dispatcher;
use crate::error::{BatchError, StepError};
use crate::models::{ContainerRuntime, Node, NodeStatus};
use crate::templates::{self, RenderParams};

pub const DEFAULT_IMAGE_REPOSITORY: &str = "registry.k8s.io";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOp {
    TestConnection,
    Preflight,
    InstallDocker,
    InstallContainerd,
    InstallKubeadm,
    PullImages,
    DetectRuntime,
    Reset,
}

impl BatchOp {
    pub const ALL: [BatchOp; 8] = [
        BatchOp::TestConnection,
        BatchOp::Preflight,
        BatchOp::InstallDocker,
        BatchOp::InstallContainerd,
        BatchOp::InstallKubeadm,
        BatchOp::PullImages,
        BatchOp::DetectRuntime,
        BatchOp::Reset,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BatchOp::TestConnection => "test-connection",
            BatchOp::Preflight => "preflight",
            BatchOp::InstallDocker => "install-docker",
            BatchOp::InstallContainerd => "install-containerd",
            BatchOp::InstallKubeadm => "install-kubeadm",
            BatchOp::PullImages => "pull-images",
            BatchOp::DetectRuntime => "detect-runtime",
            BatchOp::Reset => "reset",
        }
    }

    /// Template step id, if the operation runs a script.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            BatchOp::TestConnection => None,
            BatchOp::Preflight => Some(templates::PREFLIGHT),
            BatchOp::InstallDocker => Some(templates::INSTALL_DOCKER),
            BatchOp::InstallContainerd => Some(templates::INSTALL_CONTAINERD),
            BatchOp::InstallKubeadm => Some(templates::INSTALL_KUBEADM),
            BatchOp::PullImages => Some(templates::PULL_IMAGES),
            BatchOp::DetectRuntime => Some(templates::DETECT_RUNTIME),
            BatchOp::Reset => Some(templates::RESET),
        }
    }

    /// Operations whose scripts pin a Kubernetes version.
    pub fn needs_version(&self) -> bool {
        matches!(self, BatchOp::InstallKubeadm | BatchOp::PullImages)
    }

    /// Operations that change the host and move it through `deploying`.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, BatchOp::TestConnection | BatchOp::DetectRuntime)
    }
}

impl FromStr for BatchOp {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchOp::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| BatchError::UnknownOperation(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub message: String,
}

impl BatchOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: BatchStatus::Success,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: BatchStatus::Failed,
            message: message.into(),
        }
    }
}

/// One entry per requested node id.
pub type BatchResult = BTreeMap<String, BatchOutcome>;

/// How a node's work ended inside [`BatchController::for_each`].
#[derive(Debug)]
pub enum Dispatched<T> {
    Ran(T),
    /// The id is not in the registry.
    NotFound(String),
    /// A stop was requested before this node was scheduled.
    Skipped,
    /// The worker task died.
    Aborted(String),
}

/// Cooperative stop flag, checked between nodes and between steps.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BatchController {
    dispatcher: Arc<Dispatcher>,
    // Shared by every batch, so the cap holds across concurrent requests too.
    permits: Arc<Semaphore>,
}

impl BatchController {
    pub fn new(dispatcher: Arc<Dispatcher>, max_concurrency: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Parse `op` and run it. Only malformed input fails the whole call.
    pub async fn run_named(
        &self,
        node_ids: &[String],
        op: &str,
        params: RenderParams,
    ) -> Result<BatchResult, BatchError> {
        let op = op.parse::<BatchOp>()?;
        self.run_batch(node_ids, op, params).await
    }

    pub async fn run_batch(
        &self,
        node_ids: &[String],
        op: BatchOp,
        params: RenderParams,
    ) -> Result<BatchResult, BatchError> {
        if node_ids.is_empty() {
            return Err(BatchError::EmptySelection);
        }
        let params = checked_params(op, params)?;
        tracing::info!("Running batch {} on {} nodes", op.name(), node_ids.len());

        let dispatcher = self.dispatcher.clone();
        let params = Arc::new(params);
        let runs = self
            .for_each(node_ids, None, move |node| {
                let dispatcher = dispatcher.clone();
                let params = params.clone();
                async move { run_op(&dispatcher, &node, op, &params).await }
            })
            .await;

        let mut results = BatchResult::new();
        for (id, run) in runs {
            let outcome = match run {
                Dispatched::Ran(outcome) => outcome,
                Dispatched::NotFound(message) => {
                    tracing::warn!("Batch {} skipped unknown node {}", op.name(), id);
                    BatchOutcome::failed(message)
                }
                Dispatched::Skipped => BatchOutcome {
                    status: BatchStatus::Skipped,
                    message: "stopped before dispatch".into(),
                },
                Dispatched::Aborted(message) => BatchOutcome::failed(message),
            };
            results.insert(id, outcome);
        }
        Ok(results)
    }

    /// Run `work` once per distinct id, at most the configured cap at a time.
    ///
    /// Unknown ids and aborted workers are reported in the map, never as an error, and
    /// one node's failure does not affect the others.
    pub async fn for_each<T, F, Fut>(
        &self,
        node_ids: &[String],
        stop: Option<StopHandle>,
        work: F,
    ) -> BTreeMap<String, Dispatched<T>>
    where
        T: Send + 'static,
        F: Fn(Node) -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        let ids: BTreeSet<String> = node_ids.iter().cloned().collect();
        let mut results = BTreeMap::new();
        let mut set = JoinSet::new();

        for id in &ids {
            let node = match self.dispatcher.registry().get(id) {
                Ok(node) => node,
                Err(e) => {
                    results.insert(id.clone(), Dispatched::NotFound(e.to_string()));
                    continue;
                }
            };
            let permits = self.permits.clone();
            let stop = stop.clone();
            let fut = work(node);
            let id = id.clone();
            set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (id, Dispatched::Aborted("worker pool closed".into()));
                };
                if stop.as_ref().is_some_and(StopHandle::is_requested) {
                    return (id, Dispatched::Skipped);
                }
                (id, Dispatched::Ran(fut.await))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, run)) => {
                    results.insert(id, run);
                }
                Err(e) => tracing::error!("Batch worker failed: {}", e),
            }
        }

        // A panicked worker loses its id; account for it here.
        for id in ids {
            results
                .entry(id)
                .or_insert_with(|| Dispatched::Aborted("worker task aborted".into()));
        }
        results
    }
}

async fn run_op(dispatcher: &Dispatcher, node: &Node, op: BatchOp, params: &RenderParams) -> BatchOutcome {
    let Some(step) = op.step() else {
        return match dispatcher.check(node, op.name()).await {
            Ok(()) => {
                dispatcher.mark(node, NodeStatus::Reachable);
                BatchOutcome::success(format!("{} is reachable", node.address()))
            }
            Err(e) => BatchOutcome::failed(e.to_string()),
        };
    };

    if op.is_mutating() {
        dispatcher.mark(node, NodeStatus::Deploying);
    }
    let params = node_params(node, params);
    match dispatcher.run_step(node, op.name(), step, &params).await {
        Ok(output) => {
            if op == BatchOp::DetectRuntime {
                return record_runtime(dispatcher, node, &output.stdout);
            }
            if op.is_mutating() {
                let status = if op == BatchOp::Reset {
                    NodeStatus::Reachable
                } else {
                    NodeStatus::Ready
                };
                dispatcher.mark(node, status);
            }
            BatchOutcome::success(format!("{} completed", op.name()))
        }
        Err(e) => {
            if op.is_mutating() && !e.is_connection_failure() {
                dispatcher.mark(node, NodeStatus::Failed);
            }
            BatchOutcome::failed(failure_message(&e))
        }
    }
}

fn record_runtime(dispatcher: &Dispatcher, node: &Node, stdout: &str) -> BatchOutcome {
    let fingerprint = stdout.lines().map(str::trim).find(|l| !l.is_empty());
    let runtime = fingerprint.filter(|l| *l != "none").map(str::to_string);
    if let Err(e) = dispatcher.registry().set_runtime(&node.id, runtime.clone()) {
        tracing::warn!("Could not store runtime for {}: {}", node.name, e);
    }
    match runtime {
        Some(runtime) => BatchOutcome::success(runtime),
        None => BatchOutcome::success("no container runtime found"),
    }
}

/// Reject input an operation's scripts cannot render into a working command.
fn checked_params(op: BatchOp, mut params: RenderParams) -> Result<RenderParams, BatchError> {
    if op.needs_version() {
        params.version = templates::normalize_version(&params.version).ok_or_else(|| {
            BatchError::InvalidParams(format!(
                "{} needs a version like 1.30.2, got '{}'",
                op.name(),
                params.version
            ))
        })?;
    }
    Ok(params)
}

/// Fill per-node defaults the caller did not supply.
fn node_params(node: &Node, params: &RenderParams) -> RenderParams {
    let mut params = params.clone();
    params
        .vars
        .entry("image_repository".into())
        .or_insert_with(|| DEFAULT_IMAGE_REPOSITORY.into());
    if !params.vars.contains_key("cri_socket") {
        let runtime = match node.container_runtime.as_deref() {
            Some(r) if r.starts_with("docker") => ContainerRuntime::Docker,
            _ => ContainerRuntime::Containerd,
        };
        params.vars.insert("cri_socket".into(), runtime.cri_socket().into());
    }
    params
}

fn failure_message(err: &StepError) -> String {
    match err {
        StepError::RemoteCommand {
            exit_code, stderr, ..
        } => {
            let tail = stderr.trim().lines().last().unwrap_or_default();
            format!("exited with status {exit_code}: {tail}")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::fixture::Harness;
    use crate::executor::fake::{exit, ok, refused, FakeExecutor};
    use crate::models::{LogStatus, NodeRole};
    use std::time::Duration;

    fn ids(nodes: &[&Node]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn operations_parse_from_kebab_case() {
        assert_eq!("install-docker".parse::<BatchOp>().unwrap(), BatchOp::InstallDocker);
        assert_eq!("detect-runtime".parse::<BatchOp>().unwrap(), BatchOp::DetectRuntime);
        assert!(matches!(
            "install_docker".parse::<BatchOp>(),
            Err(BatchError::UnknownOperation(_))
        ));
        for op in BatchOp::ALL {
            assert_eq!(op.name().parse::<BatchOp>().unwrap(), op);
        }
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let h = Harness::new(FakeExecutor::new());
        let batch = BatchController::new(h.dispatcher.clone(), 4);
        let err = batch
            .run_batch(&[], BatchOp::Preflight, RenderParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::EmptySelection));

        let err = batch
            .run_named(&["x".into()], "format-disk", RenderParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn version_pinned_operations_need_a_version() {
        let h = Harness::new(FakeExecutor::new());
        let a = h.add_node("a", NodeRole::Worker);
        let batch = BatchController::new(h.dispatcher.clone(), 4);

        for op in [BatchOp::InstallKubeadm, BatchOp::PullImages] {
            let err = batch
                .run_batch(&ids(&[&a]), op, RenderParams::default())
                .await
                .unwrap_err();
            assert!(matches!(err, BatchError::InvalidParams(_)));
        }
        let err = batch
            .run_batch(&ids(&[&a]), BatchOp::InstallKubeadm, RenderParams::new("1.30"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidParams(_)));
        assert!(h.exec.calls_for(&a.id).is_empty());
        assert!(h.audit.list_by_node(&a.id).is_empty());

        // A leading `v` is accepted and stripped before rendering.
        let results = batch
            .run_batch(&ids(&[&a]), BatchOp::InstallKubeadm, RenderParams::new("v1.30.2"))
            .await
            .unwrap();
        assert_eq!(results[&a.id].status, BatchStatus::Success);
        let script = h.exec.calls_for(&a.id).pop().unwrap();
        assert!(script.contains("/core:/stable:/v1.30/deb/"));
        assert!(script.contains("kubeadm=1.30.2-*"));

        // Operations without a pinned version still run on defaults.
        let results = batch
            .run_batch(&ids(&[&a]), BatchOp::Preflight, RenderParams::default())
            .await
            .unwrap();
        assert_eq!(results[&a.id].status, BatchStatus::Success);
    }

    #[tokio::test]
    async fn one_result_per_id_despite_failures() {
        let exec = FakeExecutor::new();
        let h = Harness::new(exec);
        let good = h.add_node("good", NodeRole::Worker);
        let refusing = h.add_node("refusing", NodeRole::Worker);
        let broken = h.add_node("broken", NodeRole::Worker);
        let (r, b) = (refusing.id.clone(), broken.id.clone());
        h.exec.on(move |node, _| (node.id == r).then(|| Err(refused(node))));
        h.exec.on(move |node, _| (node.id == b).then(|| Ok(exit(100, "E: Unable to locate package"))));

        let batch = BatchController::new(h.dispatcher.clone(), 2);
        let mut requested = ids(&[&good, &refusing, &broken]);
        requested.push("missing".into());
        requested.push(good.id.clone());

        let results = batch
            .run_batch(&requested, BatchOp::InstallDocker, RenderParams::new("1.30.2"))
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[&good.id].status, BatchStatus::Success);
        assert_eq!(results[&refusing.id].status, BatchStatus::Failed);
        assert_eq!(results[&broken.id].status, BatchStatus::Failed);
        assert!(results[&broken.id].message.contains("Unable to locate package"));
        assert_eq!(results["missing"].status, BatchStatus::Failed);

        assert_eq!(h.registry.get(&good.id).unwrap().status, NodeStatus::Ready);
        assert_eq!(h.registry.get(&refusing.id).unwrap().status, NodeStatus::Unreachable);
        assert_eq!(h.registry.get(&broken.id).unwrap().status, NodeStatus::Failed);

        // Every attempt is durable in the audit log.
        for node in [&good, &refusing, &broken] {
            let entries = h.audit.list_by_node(&node.id);
            assert_eq!(entries.len(), 1);
            assert_ne!(entries[0].status, LogStatus::Running);
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let h = Harness::new(FakeExecutor::with_delay(Duration::from_millis(30)));
        let nodes: Vec<Node> = (0..8)
            .map(|i| h.add_node(&format!("n{i}"), NodeRole::Worker))
            .collect();
        let batch = BatchController::new(h.dispatcher.clone(), 3);

        let requested: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let results = batch
            .run_batch(&requested, BatchOp::TestConnection, RenderParams::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 8);
        assert!(results.values().all(|o| o.status == BatchStatus::Success));
        let peak = h.exec.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "batch did not run concurrently");
    }

    #[tokio::test]
    async fn detect_runtime_records_fingerprint() {
        let exec = FakeExecutor::new();
        exec.on(|node, _| (node.name == "d").then(|| Ok(ok("docker 24.0.7\n"))));
        exec.on(|node, _| (node.name == "bare").then(|| Ok(ok("none\n"))));
        let h = Harness::new(exec);
        let d = h.add_node("d", NodeRole::Worker);
        let bare = h.add_node("bare", NodeRole::Worker);

        let batch = BatchController::new(h.dispatcher.clone(), 4);
        batch
            .run_batch(&ids(&[&d, &bare]), BatchOp::DetectRuntime, RenderParams::default())
            .await
            .unwrap();

        let d = h.registry.get(&d.id).unwrap();
        assert_eq!(d.container_runtime.as_deref(), Some("docker 24.0.7"));
        assert_eq!(h.registry.get(&bare.id).unwrap().container_runtime, None);
        // Detection is read-only.
        assert_eq!(d.status, NodeStatus::Unknown);
    }

    #[tokio::test]
    async fn stop_skips_unscheduled_nodes() {
        let h = Harness::new(FakeExecutor::new());
        let a = h.add_node("a", NodeRole::Worker);
        let batch = BatchController::new(h.dispatcher.clone(), 1);

        let stop = StopHandle::new();
        stop.request();
        let runs = batch
            .for_each(&ids(&[&a]), Some(stop), |node| async move { node.id })
            .await;
        assert!(matches!(runs[&a.id], Dispatched::Skipped));
        assert!(h.exec.calls_for(&a.id).is_empty());
    }

    #[test]
    fn node_params_fill_runtime_socket() {
        let now = chrono::Utc::now();
        let node = Node {
            id: "n".into(),
            name: "n".into(),
            ip: "10.0.0.1".into(),
            port: 22,
            username: "root".into(),
            credential: None,
            distro: "ubuntu".into(),
            node_type: NodeRole::Worker,
            status: NodeStatus::Unknown,
            container_runtime: Some("docker 24.0.7".into()),
            created_at: now,
            updated_at: now,
        };
        let params = node_params(&node, &RenderParams::new("1.30.2"));
        assert_eq!(params.vars["cri_socket"], ContainerRuntime::Docker.cri_socket());
        assert_eq!(params.vars["image_repository"], DEFAULT_IMAGE_REPOSITORY);

        let explicit = RenderParams::new("1.30.2").var("image_repository", "mirror.local/k8s");
        assert_eq!(node_params(&node, &explicit).vars["image_repository"], "mirror.local/k8s");
    }
}

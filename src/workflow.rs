//! Cluster bootstrap state machine.
//!
//! `SelectNodes -> Configure -> InitMaster -> JoinWorkers -> Complete`, with `Failed`
//! reachable from any non-terminal step. Each transition is an explicit call; long-running
//! steps dispatch through the batch controller and record per-step, per-node results.
//!
//! A stop request is honoured between steps only. A remote command already running is
//! never interrupted.
//!
//! Every state change is published on a `watch` channel, so readers can follow a step
//! while the workflow itself is busy running it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::batch::{BatchController, BatchOp, BatchResult, Dispatched, StopHandle, DEFAULT_IMAGE_REPOSITORY};
use crate::dispatch::{step_failure, Dispatcher};
use crate::error::{BatchError, StepFailure, WorkflowError};
use crate::executor::CommandOutput;
use crate::models::{ContainerRuntime, Node, NodeRole, NodeStatus, PodNetwork};
use crate::sources::PackageSources;
use crate::templates::{self, RenderParams};
use crate::token::{extract_join_token, JoinToken, TokenExtraction};

/// Prints `joined` on a host whose kubelet already belongs to a cluster.
const JOINED_CHECK: &str = "test -f /etc/kubernetes/kubelet.conf && echo joined || true";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStep {
    SelectNodes,
    Configure,
    InitMaster,
    JoinWorkers,
    Complete,
    Failed,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::SelectNodes => "select-nodes",
            WorkflowStep::Configure => "configure",
            WorkflowStep::InitMaster => "init-master",
            WorkflowStep::JoinWorkers => "join-workers",
            WorkflowStep::Complete => "complete",
            WorkflowStep::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    SuccessWithoutToken,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub message: String,
}

impl StepRecord {
    fn new(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Steps the operator may leave out, e.g. on hosts prepared by other tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkipSteps {
    pub preflight: bool,
    pub runtime_install: bool,
    pub kubeadm_install: bool,
    pub image_pull: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub version: String,
    pub pod_network: PodNetwork,
    pub runtime: ContainerRuntime,
    pub pod_cidr: String,
    pub service_cidr: String,
    /// Mirror root; falls back to the default package source, then to official repos.
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default = "default_image_repository")]
    pub image_repository: String,
    /// Defaults to the master's address.
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default)]
    pub skip: SkipSteps,
}

fn default_image_repository() -> String {
    DEFAULT_IMAGE_REPOSITORY.to_string()
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if templates::normalize_version(&self.version).is_none() {
            return Err(WorkflowError::Validation(format!(
                "version '{}' is not of the form 1.30.2",
                self.version
            )));
        }
        let pods: Ipv4Cidr = self.pod_cidr.parse().map_err(WorkflowError::Validation)?;
        let services: Ipv4Cidr = self.service_cidr.parse().map_err(WorkflowError::Validation)?;
        if pods.overlaps(&services) {
            return Err(WorkflowError::Validation(format!(
                "pod CIDR {} overlaps service CIDR {}",
                self.pod_cidr, self.service_cidr
            )));
        }
        if self.image_repository.trim().is_empty() {
            return Err(WorkflowError::Validation("image repository is required".into()));
        }
        if let Some(addr) = &self.advertise_address {
            addr.parse::<Ipv4Addr>()
                .map_err(|_| WorkflowError::Validation(format!("'{addr}' is not an IPv4 address")))?;
        }
        Ok(())
    }

    /// Steps run on the master, in order.
    pub fn master_steps(&self) -> Vec<&'static str> {
        let mut steps = self.host_steps();
        if !self.skip.image_pull {
            steps.push(templates::PULL_IMAGES);
        }
        steps.push(templates::INIT_MASTER);
        steps.push(templates::INSTALL_NETWORK);
        steps
    }

    /// Steps run on each worker, in order.
    pub fn worker_steps(&self) -> Vec<&'static str> {
        let mut steps = self.host_steps();
        steps.push(templates::JOIN_WORKER);
        steps
    }

    fn host_steps(&self) -> Vec<&'static str> {
        let mut steps = Vec::new();
        if !self.skip.preflight {
            steps.push(templates::PREFLIGHT);
        }
        if !self.skip.runtime_install {
            steps.push(self.runtime.install_step());
        }
        if !self.skip.kubeadm_install {
            steps.push(templates::INSTALL_KUBEADM);
        }
        steps
    }

    fn render_params(&self, advertise_address: &str, token: Option<&JoinToken>) -> RenderParams {
        let mut params = RenderParams::new(self.version.trim().trim_start_matches('v'))
            .with_repo(self.repo_url.clone())
            .var("pod_cidr", self.pod_cidr.trim())
            .var("service_cidr", self.service_cidr.trim())
            .var(
                "advertise_address",
                self.advertise_address.as_deref().unwrap_or(advertise_address),
            )
            .var("image_repository", self.image_repository.trim())
            .var("cri_socket", self.runtime.cri_socket())
            .var("network_manifest", self.pod_network.manifest_url());
        if let Some(token) = token {
            params = params
                .var("endpoint", token.endpoint.as_str())
                .var("token", token.token.as_str())
                .var("ca_cert_hash", token.ca_cert_hash.as_str());
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    fn mask(prefix: u8) -> u32 {
        match prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        let mask = Self::mask(self.prefix.min(other.prefix));
        self.network & mask == other.network & mask
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("'{s}' is not an IPv4 CIDR");
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        Ok(Self {
            network: u32::from(addr) & Self::mask(prefix),
            prefix,
        })
    }
}

/// Serializable view of a workflow for the API layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub step: WorkflowStep,
    pub master: Option<String>,
    pub workers: Vec<String>,
    pub config: Option<ClusterConfig>,
    /// step id -> node id -> result.
    pub steps: BTreeMap<String, BTreeMap<String, StepRecord>>,
    /// Set once every master step has finished.
    pub master_ready: bool,
    pub join_token: Option<JoinToken>,
    /// The unrecoverable error that moved the workflow to `failed`.
    pub failure: Option<StepFailure>,
    /// Latest failure per worker; cleared when the worker joins.
    pub worker_failures: BTreeMap<String, StepFailure>,
    pub warnings: Vec<String>,
}

impl WorkflowState {
    fn new(join_token: Option<JoinToken>) -> Self {
        Self {
            step: WorkflowStep::SelectNodes,
            master: None,
            workers: Vec::new(),
            config: None,
            steps: BTreeMap::new(),
            master_ready: false,
            join_token,
            failure: None,
            worker_failures: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record(&self, step: &str, node_id: &str) -> Option<&StepRecord> {
        self.steps.get(step).and_then(|nodes| nodes.get(node_id))
    }

    fn set_record(&mut self, step: &str, node_id: &str, record: StepRecord) {
        self.steps
            .entry(step.to_string())
            .or_default()
            .insert(node_id.to_string(), record);
    }

    fn succeeded(&self, step: &str, node_id: &str) -> bool {
        self.record(step, node_id)
            .is_some_and(|r| matches!(r.status, StepStatus::Success | StepStatus::SuccessWithoutToken))
    }

    /// Steps already finished on a node; a resumed run does not repeat them.
    fn finished_steps(&self, node_id: &str) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter(|(step, _)| self.succeeded(step, node_id))
            .map(|(step, _)| step.clone())
            .collect()
    }
}

pub struct ClusterWorkflow {
    batch: Arc<BatchController>,
    sources: Option<Arc<PackageSources>>,
    stop: StopHandle,
    state: WorkflowState,
    published: Arc<watch::Sender<WorkflowState>>,
}

impl ClusterWorkflow {
    pub fn new(batch: Arc<BatchController>, sources: Option<Arc<PackageSources>>) -> Self {
        let state = WorkflowState::new(None);
        let (published, _) = watch::channel(state.clone());
        Self {
            batch,
            sources,
            stop: StopHandle::new(),
            state,
            published: Arc::new(published),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Latest published state; readable without access to the workflow.
    pub fn watch(&self) -> watch::Receiver<WorkflowState> {
        self.published.subscribe()
    }

    fn publish(&self) {
        self.published.send_replace(self.state.clone());
    }

    pub fn step(&self) -> WorkflowStep {
        self.state.step
    }

    /// Handle usable while a step is running; the workflow itself may be borrowed.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        tracing::info!("Stop requested for workflow in {}", self.state.step);
        self.stop.request();
    }

    /// Start over at `SelectNodes`. A still-valid join token is kept so worker-only runs
    /// can follow a finished cluster.
    pub fn restart(&mut self) {
        let token = self.state.join_token.take().filter(JoinToken::is_valid);
        self.state = WorkflowState::new(token);
        self.stop.clear();
        self.publish();
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.batch.dispatcher()
    }

    fn ensure(&self, allowed: bool, action: &'static str) -> Result<(), WorkflowError> {
        if allowed {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTransition {
                from: self.state.step.to_string(),
                action,
            })
        }
    }

    fn valid_token(&self) -> Result<JoinToken, WorkflowError> {
        let token = self.state.join_token.clone().ok_or(WorkflowError::TokenMissing)?;
        if token.is_valid() {
            Ok(token)
        } else {
            Err(WorkflowError::TokenExpired(token.expires_at))
        }
    }

    fn config(&self) -> Result<&ClusterConfig, WorkflowError> {
        self.state
            .config
            .as_ref()
            .ok_or_else(|| WorkflowError::Validation("cluster is not configured".into()))
    }

    /// `SelectNodes -> Configure`. Re-selecting is allowed until init starts.
    pub fn select_nodes(&mut self, master: Option<&str>, workers: &[String]) -> Result<(), WorkflowError> {
        let step = self.state.step;
        self.ensure(
            matches!(step, WorkflowStep::SelectNodes | WorkflowStep::Configure),
            "select nodes",
        )?;

        let mut seen = BTreeSet::new();
        let workers: Vec<String> = workers
            .iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty() && seen.insert(w.clone()))
            .collect();
        let master = master.map(str::trim).filter(|m| !m.is_empty());

        if master.is_none() && workers.is_empty() {
            return Err(WorkflowError::Validation("select at least one node".into()));
        }
        if let Some(m) = master {
            if workers.iter().any(|w| w == m) {
                return Err(WorkflowError::Validation(format!(
                    "node {m} cannot be both master and worker"
                )));
            }
        }

        let registry = self.dispatcher().registry();
        let roles = master
            .map(|id| (id, NodeRole::Master))
            .into_iter()
            .chain(workers.iter().map(|id| (id.as_str(), NodeRole::Worker)));
        for (id, wanted) in roles {
            let node = registry.get(id)?;
            if node.node_type != wanted {
                return Err(WorkflowError::Validation(format!(
                    "node {} is registered as a {}, not a {}",
                    node.name,
                    node.node_type.as_str(),
                    wanted.as_str()
                )));
            }
        }
        if master.is_none() {
            // Worker-only runs join an existing cluster.
            self.valid_token()?;
        }

        self.state.master = master.map(str::to_string);
        self.state.workers = workers;
        self.state.step = WorkflowStep::Configure;
        tracing::info!(
            "Selected master {:?} and {} workers",
            self.state.master,
            self.state.workers.len()
        );
        self.publish();
        Ok(())
    }

    /// Validate and store the cluster configuration.
    pub fn configure(&mut self, mut config: ClusterConfig) -> Result<(), WorkflowError> {
        self.ensure(self.state.step == WorkflowStep::Configure, "configure")?;
        config.validate()?;
        config.repo_url = config
            .repo_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .or_else(|| self.sources.as_ref().and_then(|s| s.default_url()));
        self.state.config = Some(config);
        self.publish();
        Ok(())
    }

    /// `Configure -> InitMaster`. Runs the master pipeline; on a join token moves to
    /// `JoinWorkers`, or straight to `Complete` when no workers were selected.
    ///
    /// Callable again after a stop; steps that already succeeded are not repeated.
    pub async fn init_master(&mut self) -> Result<WorkflowStep, WorkflowError> {
        let result = self.run_master().await;
        self.publish();
        result
    }

    async fn run_master(&mut self) -> Result<WorkflowStep, WorkflowError> {
        let step = self.state.step;
        self.ensure(
            step == WorkflowStep::Configure
                || (step == WorkflowStep::InitMaster && !self.state.master_ready),
            "initialize the master",
        )?;
        let config = self.config()?.clone();
        self.stop.clear();

        let Some(master_id) = self.state.master.clone() else {
            self.valid_token()?;
            self.state.master_ready = true;
            return Ok(self.advance_after_init());
        };

        let node = self.dispatcher().registry().get(&master_id)?;
        self.state.step = WorkflowStep::InitMaster;
        let params = config.render_params(&node.ip, None);
        let finished = self.state.finished_steps(&node.id);
        let dispatcher = self.dispatcher().clone();
        let mut touched = false;

        for step in config.master_steps() {
            if finished.contains(step) {
                continue;
            }
            if self.stop.is_requested() {
                tracing::info!("Workflow stopped before {} on {}", step, node.name);
                if touched {
                    dispatcher.mark(&node, status_after_stop(node.status));
                }
                return Ok(self.state.step);
            }
            if step == templates::INIT_MASTER {
                // A new control plane invalidates any earlier token.
                self.state.join_token = None;
            }
            dispatcher.mark(&node, NodeStatus::Deploying);
            touched = true;
            self.state
                .set_record(step, &node.id, StepRecord::new(StepStatus::Running, ""));
            self.publish();

            match run_node_step(&dispatcher, &node, step, &params).await {
                Ok(output) if step == templates::INIT_MASTER => self.capture_token(&node, &output),
                Ok(_) => {
                    self.state
                        .set_record(step, &node.id, StepRecord::new(StepStatus::Success, ""));
                    self.publish();
                }
                Err(failure) => {
                    self.state.set_record(
                        step,
                        &node.id,
                        StepRecord::new(StepStatus::Failed, failure.message.clone()),
                    );
                    return Err(self.fail(failure));
                }
            }
        }

        dispatcher.mark(&node, NodeStatus::Ready);
        self.state.master_ready = true;
        if self.state.join_token.is_some() {
            Ok(self.advance_after_init())
        } else {
            tracing::warn!("Master initialized without a join token; waiting for one");
            Ok(self.state.step)
        }
    }

    fn capture_token(&mut self, node: &Node, output: &CommandOutput) {
        match extract_join_token(&output.combined(), Utc::now()) {
            TokenExtraction::Found(token) => {
                tracing::info!("Captured join token for {}", token.endpoint);
                self.state.join_token = Some(token);
                self.state.set_record(
                    templates::INIT_MASTER,
                    &node.id,
                    StepRecord::new(StepStatus::Success, "join token captured"),
                );
            }
            TokenExtraction::NotFound => {
                let warning = format!(
                    "no join command found in kubeadm init output on {}; provide a token manually",
                    node.name
                );
                self.state.set_record(
                    templates::INIT_MASTER,
                    &node.id,
                    StepRecord::new(StepStatus::SuccessWithoutToken, warning.clone()),
                );
                self.state.warnings.push(warning);
            }
        }
    }

    fn advance_after_init(&mut self) -> WorkflowStep {
        self.state.step = if self.state.workers.is_empty() {
            WorkflowStep::Complete
        } else {
            for worker in self.state.workers.clone() {
                if !self.state.succeeded(templates::JOIN_WORKER, &worker) {
                    self.state.set_record(
                        templates::JOIN_WORKER,
                        &worker,
                        StepRecord::new(StepStatus::Pending, ""),
                    );
                }
            }
            WorkflowStep::JoinWorkers
        };
        tracing::info!("Workflow advanced to {}", self.state.step);
        self.state.step
    }

    /// Accept an operator-supplied join token. After an init that printed none, this
    /// advances the workflow exactly as an extracted token would.
    pub fn provide_token(&mut self, token: JoinToken) -> Result<WorkflowStep, WorkflowError> {
        self.ensure(
            !matches!(self.state.step, WorkflowStep::Failed),
            "provide a join token",
        )?;
        token.check_format().map_err(WorkflowError::Validation)?;
        if !token.is_valid() {
            return Err(WorkflowError::TokenExpired(token.expires_at));
        }
        self.state.join_token = Some(token);
        if self.state.step == WorkflowStep::InitMaster && self.state.master_ready {
            self.advance_after_init();
        }
        self.publish();
        Ok(self.state.step)
    }

    /// Dispatch every worker that has not joined yet, concurrently.
    pub async fn join_workers(&mut self) -> Result<WorkflowStep, WorkflowError> {
        self.ensure(self.state.step == WorkflowStep::JoinWorkers, "join workers")?;
        let pending: Vec<String> = self
            .state
            .workers
            .iter()
            .filter(|w| !self.state.succeeded(templates::JOIN_WORKER, w))
            .cloned()
            .collect();
        self.run_workers(pending).await
    }

    /// Re-run the join pipeline for one worker. A worker that already joined is left
    /// untouched.
    pub async fn retry_worker(&mut self, node_id: &str) -> Result<WorkflowStep, WorkflowError> {
        self.ensure(self.state.step == WorkflowStep::JoinWorkers, "retry a worker")?;
        if !self.state.workers.iter().any(|w| w == node_id) {
            return Err(WorkflowError::Validation(format!(
                "node {node_id} is not a selected worker"
            )));
        }
        if self.state.succeeded(templates::JOIN_WORKER, node_id) {
            tracing::info!("Worker {} already joined; nothing to retry", node_id);
            return Ok(self.state.step);
        }
        self.run_workers(vec![node_id.to_string()]).await
    }

    async fn run_workers(&mut self, ids: Vec<String>) -> Result<WorkflowStep, WorkflowError> {
        let token = self.valid_token()?;
        let config = self.config()?.clone();
        self.stop.clear();

        let advertise = match &self.state.master {
            Some(id) => self.dispatcher().registry().get(id)?.ip,
            None => String::new(),
        };
        let params = Arc::new(config.render_params(&advertise, Some(&token)));
        let steps = Arc::new(config.worker_steps());
        let finished: Arc<BTreeMap<String, BTreeSet<String>>> = Arc::new(
            ids.iter()
                .map(|id| (id.clone(), self.state.finished_steps(id)))
                .collect(),
        );
        for id in &ids {
            self.state
                .set_record(templates::JOIN_WORKER, id, StepRecord::new(StepStatus::Running, ""));
        }
        self.publish();

        let dispatcher = self.dispatcher().clone();
        let stop = self.stop.clone();
        let progress = self.published.clone();
        let runs = self
            .batch
            .for_each(&ids, Some(self.stop.clone()), move |node| {
                let dispatcher = dispatcher.clone();
                let params = params.clone();
                let steps = steps.clone();
                let finished = finished.get(&node.id).cloned().unwrap_or_default();
                let stop = stop.clone();
                let progress = progress.clone();
                async move {
                    let worker = WorkerContext {
                        dispatcher: &dispatcher,
                        node: &node,
                        params: &params,
                        stop: &stop,
                        progress: &progress,
                    };
                    run_worker(&worker, &steps, &finished).await
                }
            })
            .await;

        for (id, run) in runs {
            match run {
                Dispatched::Ran(run) => {
                    for (step, record) in run.records {
                        self.state.set_record(step, &id, record);
                    }
                    match run.outcome {
                        WorkerOutcome::Joined => {
                            self.state.worker_failures.remove(&id);
                        }
                        WorkerOutcome::Failed(failure) => {
                            self.state.worker_failures.insert(id, failure);
                        }
                        WorkerOutcome::Stopped => self.reset_join_record(&id),
                    }
                }
                Dispatched::Skipped => self.reset_join_record(&id),
                Dispatched::NotFound(message) | Dispatched::Aborted(message) => {
                    self.state.set_record(
                        templates::JOIN_WORKER,
                        &id,
                        StepRecord::new(StepStatus::Failed, message),
                    );
                }
            }
        }

        let all_joined = self
            .state
            .workers
            .iter()
            .all(|w| self.state.succeeded(templates::JOIN_WORKER, w));
        if all_joined {
            self.state.step = WorkflowStep::Complete;
            tracing::info!("All {} workers joined; cluster complete", self.state.workers.len());
        }
        self.publish();
        Ok(self.state.step)
    }

    fn reset_join_record(&mut self, id: &str) {
        self.state
            .set_record(templates::JOIN_WORKER, id, StepRecord::new(StepStatus::Pending, "stopped"));
    }

    fn fail(&mut self, failure: StepFailure) -> WorkflowError {
        tracing::error!("Workflow failed: {}", failure);
        self.state.step = WorkflowStep::Failed;
        self.state.failure = Some(failure.clone());
        WorkflowError::Failed(failure)
    }
}

/// `kubeadm reset` plus local cleanup on each node, regardless of any workflow state.
pub async fn reset_nodes(batch: &BatchController, node_ids: &[String]) -> Result<BatchResult, BatchError> {
    batch
        .run_batch(node_ids, BatchOp::Reset, RenderParams::default())
        .await
}

enum WorkerOutcome {
    Joined,
    Failed(StepFailure),
    Stopped,
}

struct WorkerRun {
    records: Vec<(&'static str, StepRecord)>,
    outcome: WorkerOutcome,
}

struct WorkerContext<'a> {
    dispatcher: &'a Dispatcher,
    node: &'a Node,
    params: &'a RenderParams,
    stop: &'a StopHandle,
    progress: &'a watch::Sender<WorkflowState>,
}

impl WorkerContext<'_> {
    fn report(&self, records: &mut Vec<(&'static str, StepRecord)>, step: &'static str, record: StepRecord) {
        self.progress
            .send_modify(|state| state.set_record(step, &self.node.id, record.clone()));
        records.push((step, record));
    }

    /// Whether the host already joined a cluster, e.g. in an earlier run.
    async fn already_joined(&self) -> Result<bool, StepFailure> {
        match self
            .dispatcher
            .run_script(self.node, "join-check", JOINED_CHECK)
            .await
        {
            Ok(output) => Ok(output.stdout.lines().any(|l| l.trim() == "joined")),
            Err(e) => Err(step_failure(self.node, templates::JOIN_WORKER, JOINED_CHECK, &e)),
        }
    }
}

async fn run_worker(
    worker: &WorkerContext<'_>,
    steps: &[&'static str],
    finished: &BTreeSet<String>,
) -> WorkerRun {
    let (dispatcher, node) = (worker.dispatcher, worker.node);
    let mut records = Vec::new();

    if !finished.contains(templates::JOIN_WORKER) {
        match worker.already_joined().await {
            Ok(true) => {
                tracing::info!("{} already belongs to a cluster; skipping its join", node.name);
                worker.report(
                    &mut records,
                    templates::JOIN_WORKER,
                    StepRecord::new(StepStatus::Success, "already joined"),
                );
                dispatcher.mark(node, NodeStatus::Ready);
                return WorkerRun {
                    records,
                    outcome: WorkerOutcome::Joined,
                };
            }
            Ok(false) => {}
            Err(failure) => {
                let record = StepRecord::new(StepStatus::Failed, failure.message.clone());
                worker.report(&mut records, templates::JOIN_WORKER, record);
                return WorkerRun {
                    records,
                    outcome: WorkerOutcome::Failed(failure),
                };
            }
        }
    }

    let mut touched = false;
    for &step in steps {
        if finished.contains(step) {
            continue;
        }
        if worker.stop.is_requested() {
            if touched {
                dispatcher.mark(node, status_after_stop(node.status));
            }
            return WorkerRun {
                records,
                outcome: WorkerOutcome::Stopped,
            };
        }
        dispatcher.mark(node, NodeStatus::Deploying);
        touched = true;
        worker.report(&mut records, step, StepRecord::new(StepStatus::Running, ""));
        match run_node_step(dispatcher, node, step, worker.params).await {
            Ok(_) => worker.report(&mut records, step, StepRecord::new(StepStatus::Success, "")),
            Err(failure) => {
                worker.report(
                    &mut records,
                    step,
                    StepRecord::new(StepStatus::Failed, failure.message.clone()),
                );
                if step != templates::JOIN_WORKER {
                    worker.report(
                        &mut records,
                        templates::JOIN_WORKER,
                        StepRecord::new(StepStatus::Failed, format!("{step} failed")),
                    );
                }
                return WorkerRun {
                    records,
                    outcome: WorkerOutcome::Failed(failure),
                };
            }
        }
    }
    dispatcher.mark(node, NodeStatus::Ready);
    WorkerRun {
        records,
        outcome: WorkerOutcome::Joined,
    }
}

/// Status for a node whose run stopped after at least one successful step. It answered,
/// so it is at least reachable; a node that was already ready stays ready.
fn status_after_stop(before: NodeStatus) -> NodeStatus {
    match before {
        NodeStatus::Ready => NodeStatus::Ready,
        _ => NodeStatus::Reachable,
    }
}

/// Render and run one step, converting any failure into a diagnostic report.
async fn run_node_step(
    dispatcher: &Dispatcher,
    node: &Node,
    step: &str,
    params: &RenderParams,
) -> Result<CommandOutput, StepFailure> {
    let operation = step.replace('_', "-");
    let script = match dispatcher.render(node, &operation, step, params) {
        Ok(script) => script,
        Err(e) => {
            dispatcher.mark(node, NodeStatus::Failed);
            return Err(step_failure(node, step, "", &e));
        }
    };
    dispatcher
        .run_script(node, &operation, &script)
        .await
        .map_err(|e| {
            // Connection failures already marked the node unreachable.
            if !e.is_connection_failure() {
                dispatcher.mark(node, NodeStatus::Failed);
            }
            step_failure(node, step, &script, &e)
        })
}

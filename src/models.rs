use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CredentialError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DISTRO: &str = "ubuntu";

// ---- Nodes ----

/// SSH authentication for a node. Serialized externally tagged, so a stored node carries
/// either `{"password": ..}` or `{"privateKey": ..}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Credential {
    Password(String),
    PrivateKey(String),
}

impl Credential {
    /// Builds a credential from the two optional request fields. Blank strings count as unset.
    pub fn from_parts(
        password: Option<String>,
        private_key: Option<String>,
    ) -> Result<Option<Self>, CredentialError> {
        let password = password.filter(|p| !p.is_empty());
        let private_key = private_key.filter(|k| !k.trim().is_empty());
        match (password, private_key) {
            (Some(_), Some(_)) => Err(CredentialError::Ambiguous),
            (Some(p), None) => Ok(Some(Credential::Password(p))),
            (None, Some(k)) => Ok(Some(Credential::PrivateKey(k))),
            (None, None) => Ok(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey(_) => "privateKey",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Testing,
    Reachable,
    Unreachable,
    Deploying,
    Ready,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Testing => "testing",
            NodeStatus::Reachable => "reachable",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Deploying => "deploying",
            NodeStatus::Ready => "ready",
            NodeStatus::Failed => "failed",
        }
    }
}

// Stored records may predate a status value; anything unrecognised reads back as unknown.
impl Serialize for NodeStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "testing" => NodeStatus::Testing,
            "reachable" => NodeStatus::Reachable,
            "unreachable" => NodeStatus::Unreachable,
            "deploying" => NodeStatus::Deploying,
            "ready" => NodeStatus::Ready,
            "failed" => NodeStatus::Failed,
            _ => NodeStatus::Unknown,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default = "default_distro")]
    pub distro: String,
    pub node_type: NodeRole,
    pub status: NodeStatus,
    #[serde(default)]
    pub container_runtime: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_distro() -> String {
    DEFAULT_DISTRO.to_string()
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Node {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// JSON view for API responses; secrets are replaced by the auth kind.
    pub fn redacted(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "ip": self.ip,
            "port": self.port,
            "username": self.username,
            "authType": self.credential.as_ref().map(Credential::kind),
            "distro": self.distro,
            "nodeType": self.node_type,
            "status": self.status,
            "containerRuntime": self.container_runtime,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

/// Input for creating a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDraft {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub distro: Option<String>,
    pub node_type: NodeRole,
}

/// Partial update. Omitted fields keep their stored values, including the credential.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub distro: Option<String>,
    pub node_type: Option<NodeRole>,
}

// ---- Audit log ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Running,
    Success,
    Failed,
}

impl LogStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatus::Running)
    }

    /// Only running -> {success, failed} moves an entry.
    pub fn can_transition_to(&self, next: LogStatus) -> bool {
        matches!(self, LogStatus::Running) && next.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub node_id: String,
    pub node_name: String,
    pub operation: String,
    pub command: String,
    pub output: String,
    pub status: LogStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---- Cluster configuration ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Containerd,
}

impl ContainerRuntime {
    pub fn install_step(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "install_docker",
            ContainerRuntime::Containerd => "install_containerd",
        }
    }

    /// CRI endpoint handed to kubeadm. Docker is reached through cri-dockerd.
    pub fn cri_socket(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "unix:///var/run/cri-dockerd.sock",
            ContainerRuntime::Containerd => "unix:///run/containerd/containerd.sock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodNetwork {
    Flannel,
    Calico,
    Cilium,
}

impl PodNetwork {
    pub fn manifest_url(&self) -> &'static str {
        match self {
            PodNetwork::Flannel => {
                "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml"
            }
            PodNetwork::Calico => {
                "https://raw.githubusercontent.com/projectcalico/calico/v3.27.0/manifests/calico.yaml"
            }
            PodNetwork::Cilium => {
                "https://raw.githubusercontent.com/cilium/cilium/v1.14.5/install/kubernetes/quick-install.yaml"
            }
        }
    }
}

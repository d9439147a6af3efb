use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::database::{RecordStore, RecordStoreExt, NODES};
use crate::error::{CredentialError, ExecError, RegistryError};
use crate::executor::RemoteExecutor;
use crate::models::{Credential, Node, NodeDraft, NodePatch, NodeStatus, DEFAULT_DISTRO};

/// CRUD and lifecycle state for managed hosts.
pub struct NodeRegistry {
    store: Arc<dyn RecordStore>,
    // Serializes read-modify-write cycles; readers go straight to the store.
    write_lock: Mutex<()>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create(&self, draft: NodeDraft) -> Result<Node, RegistryError> {
        validate_address(&draft.name, &draft.ip, &draft.username)?;
        let credential = Credential::from_parts(draft.password, draft.private_key)?
            .ok_or(CredentialError::Missing)?;

        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            ip: draft.ip.trim().to_string(),
            port: draft.port,
            username: draft.username.trim().to_string(),
            credential: Some(credential),
            distro: draft
                .distro
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_DISTRO.to_string()),
            node_type: draft.node_type,
            status: NodeStatus::Unknown,
            container_runtime: None,
            created_at: now,
            updated_at: now,
        };

        let _w = self.writer();
        self.store.put_as(NODES, &node.id, &node)?;
        tracing::info!("Registered node {} ({})", node.name, node.address());
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Result<Node, RegistryError> {
        self.store
            .get_as::<Node>(NODES, id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Node>, RegistryError> {
        let mut nodes: Vec<Node> = self.store.list_as(NODES)?;
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(nodes)
    }

    /// Apply a partial update. A patch without password or key keeps the stored credential.
    pub fn update(&self, id: &str, patch: NodePatch) -> Result<Node, RegistryError> {
        let _w = self.writer();
        let mut node = self.get(id)?;

        if let Some(name) = patch.name {
            node.name = name.trim().to_string();
        }
        if let Some(ip) = patch.ip {
            node.ip = ip.trim().to_string();
        }
        if let Some(port) = patch.port {
            node.port = port;
        }
        if let Some(username) = patch.username {
            node.username = username.trim().to_string();
        }
        if let Some(distro) = patch.distro.filter(|d| !d.trim().is_empty()) {
            node.distro = distro.trim().to_lowercase();
        }
        if let Some(role) = patch.node_type {
            node.node_type = role;
        }
        if let Some(credential) = Credential::from_parts(patch.password, patch.private_key)? {
            node.credential = Some(credential);
        }
        validate_address(&node.name, &node.ip, &node.username)?;

        node.updated_at = Utc::now();
        self.store.put_as(NODES, &node.id, &node)?;
        Ok(node)
    }

    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let _w = self.writer();
        if self.store.delete(NODES, id)? {
            tracing::info!("Deleted node {}", id);
            Ok(())
        } else {
            Err(RegistryError::NotFound(id.to_string()))
        }
    }

    pub fn set_status(&self, id: &str, status: NodeStatus) -> Result<Node, RegistryError> {
        self.modify(id, |node| node.status = status)
    }

    pub fn set_runtime(&self, id: &str, runtime: Option<String>) -> Result<Node, RegistryError> {
        self.modify(id, |node| node.container_runtime = runtime)
    }

    fn modify<F: FnOnce(&mut Node)>(&self, id: &str, f: F) -> Result<Node, RegistryError> {
        let _w = self.writer();
        let mut node = self.get(id)?;
        f(&mut node);
        node.updated_at = Utc::now();
        self.store.put_as(NODES, &node.id, &node)?;
        Ok(node)
    }

    /// Open a short-lived session and record the node as reachable or unreachable.
    pub async fn test_connection(
        &self,
        id: &str,
        executor: &dyn RemoteExecutor,
    ) -> Result<bool, RegistryError> {
        let node = self.set_status(id, NodeStatus::Testing)?;
        match executor.check(&node).await {
            Ok(()) => {
                self.set_status(id, NodeStatus::Reachable)?;
                tracing::info!("Node {} is reachable", node.name);
                Ok(true)
            }
            Err(ExecError::Credential(e)) => {
                self.set_status(id, NodeStatus::Unknown)?;
                Err(e.into())
            }
            Err(e) => {
                self.set_status(id, NodeStatus::Unreachable)?;
                tracing::warn!("Node {} is unreachable: {}", node.name, e);
                Ok(false)
            }
        }
    }
}

fn validate_address(name: &str, ip: &str, username: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::Invalid("name is required".into()));
    }
    if ip.trim().is_empty() {
        return Err(RegistryError::Invalid("ip is required".into()));
    }
    if username.trim().is_empty() {
        return Err(RegistryError::Invalid("username is required".into()));
    }
    Ok(())
}

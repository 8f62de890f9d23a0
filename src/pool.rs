use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::crypto::SecretBox;
use crate::error::{HosterError, HosterResult};
use crate::orchestrator::agent::{AgentClient, AgentTarget};
use crate::orchestrator::local::LocalDocker;
use crate::orchestrator::Orchestrator;
use crate::store::db::Db;
use crate::store::entities::{NODES, SSH_KEYS};
use crate::store::EntityRow;

/// Lazy, cached agent connections, one per node.
///
/// First access dials and caches; later accesses reuse. Nodes marked
/// local share one daemon client instead of an SSH hop. The pool owns
/// no tunnels of its own; the proxy asks the cached agent client for
/// a fresh per-request tunnel.
pub struct HostPool {
    db: Db,
    crypto: SecretBox,
    config: Arc<Config>,
    clients: RwLock<HashMap<String, Arc<AgentClient>>>,
    local: OnceCell<Arc<LocalDocker>>,
}

impl HostPool {
    #[must_use]
    pub fn new(db: Db, crypto: SecretBox, config: Arc<Config>) -> Self {
        Self {
            db,
            crypto,
            config,
            clients: RwLock::new(HashMap::new()),
            local: OnceCell::new(),
        }
    }

    /// Orchestrator for a node row: the shared daemon client for
    /// local nodes, a cached agent client otherwise.
    pub async fn orchestrator(&self, node: &EntityRow) -> HosterResult<Arc<dyn Orchestrator>> {
        if node.attr_bool("local") {
            let local = self.local_docker().await?;
            return Ok(local as Arc<dyn Orchestrator>);
        }
        let agent = self.agent_for_node(node).await?;
        Ok(agent as Arc<dyn Orchestrator>)
    }

    /// Orchestrator by node id, loading and checking the row.
    pub async fn orchestrator_for(&self, node_id: &str) -> HosterResult<Arc<dyn Orchestrator>> {
        let node = self.load_node(node_id).await?;
        self.orchestrator(&node).await
    }

    /// Agent client by node id, for callers that need SSH-level
    /// operations (the proxy's tunnels). Local nodes have none.
    pub async fn agent(&self, node_id: &str) -> HosterResult<Arc<AgentClient>> {
        let node = self.load_node(node_id).await?;
        if node.attr_bool("local") {
            return Err(HosterError::BadRequest(format!(
                "node {node_id} is local and has no ssh client"
            )));
        }
        self.agent_for_node(&node).await
    }

    async fn agent_for_node(&self, node: &EntityRow) -> HosterResult<Arc<AgentClient>> {
        // Read-mostly fast path.
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&node.id) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        // Double-checked: another task may have built it while we
        // waited for the write lock.
        if let Some(client) = clients.get(&node.id) {
            return Ok(client.clone());
        }

        let target = self.build_target(node).await?;
        debug!(node = %node.id, host = %target.host, "building agent client");
        let client = Arc::new(AgentClient::new(target, self.config.agent_dir.clone()));
        clients.insert(node.id.clone(), client.clone());
        Ok(client)
    }

    async fn build_target(&self, node: &EntityRow) -> HosterResult<AgentTarget> {
        let key_id = node
            .attr_str("ssh_key_id")
            .ok_or_else(|| HosterError::Configuration(format!("node {} has no ssh key", node.id)))?;
        let key_row = self
            .db
            .fetch(SSH_KEYS, key_id)
            .await?
            .ok_or_else(|| HosterError::NotFound(format!("ssh_keys/{key_id}")))?;
        let ciphertext = key_row
            .attr_str("encrypted_key")
            .ok_or_else(|| HosterError::Internal(format!("ssh key {key_id} has no ciphertext")))?;
        let private_key = self.crypto.decrypt_string(ciphertext)?;

        Ok(AgentTarget {
            node_id: node.id.clone(),
            host: node
                .attr_str("ssh_host")
                .ok_or_else(|| {
                    HosterError::Configuration(format!("node {} has no ssh host", node.id))
                })?
                .to_string(),
            port: u16::try_from(node.attr_i64("ssh_port").unwrap_or(22)).unwrap_or(22),
            user: node.attr_str("ssh_user").unwrap_or("root").to_string(),
            private_key,
        })
    }

    async fn load_node(&self, node_id: &str) -> HosterResult<EntityRow> {
        let node = self
            .db
            .fetch(NODES, node_id)
            .await?
            .ok_or_else(|| HosterError::NotFound(format!("nodes/{node_id}")))?;
        if node.status == "deleted" {
            return Err(HosterError::NotFound(format!("nodes/{node_id}")));
        }
        Ok(node)
    }

    async fn local_docker(&self) -> HosterResult<Arc<LocalDocker>> {
        self.local
            .get_or_try_init(|| async {
                let docker = LocalDocker::connect().await?;
                Ok::<_, HosterError>(Arc::new(docker))
            })
            .await
            .cloned()
    }

    /// Drop a cached client (node deleted or unreachable for good).
    pub async fn remove(&self, node_id: &str) {
        let client = self.clients.write().await.remove(node_id);
        if let Some(client) = client {
            let _ = client.close().await;
            info!(node = node_id, "agent client removed from pool");
        }
    }

    /// Tear down and re-dial a node's client after its configuration
    /// changed.
    pub async fn refresh(&self, node_id: &str) -> HosterResult<Arc<AgentClient>> {
        self.remove(node_id).await;
        self.agent(node_id).await
    }

    /// Close every cached connection (shutdown).
    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.write().await.drain().collect();
        for (_, client) in clients {
            let _ = client.close().await;
        }
    }
}

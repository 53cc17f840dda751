//! Cluster management.
//!
//! Owns the local node identity, cluster bootstrap/join, and the single
//! write path for replicated configuration: every mutation flows through
//! [`ClusterService::propose`], which goes through Raft when the cluster
//! is initialized and falls back to a direct FSM apply in single-node
//! mode.

pub mod fsm;
pub mod lease;
pub mod raft;
pub mod router;

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sylve_common::model::{ClusterSshIdentity, NodeRecord};
use sylve_common::{Error, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::SylveConfig;
use crate::db::{self, Database};
use fsm::{ClusterFsm, Proposal};
use raft::{RaftConfig, RaftNode};

const META_LOCAL_NODE_ID: &str = "local_node_id";

/// Join request a prospective member sends to any existing member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub cluster_key: String,
    pub node: NodeRecord,
}

/// Join response carrying the cluster view the joiner seeds from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub cluster_key: String,
    pub nodes: Vec<NodeRecord>,
}

/// Cluster service: node identity plus the replicated-config write path.
pub struct ClusterService {
    db: Arc<Database>,
    fsm: Arc<ClusterFsm>,
    raft: RwLock<Option<Arc<RaftNode>>>,
    node_id: String,
    hostname: String,
    raft_addr: String,
    api_addr: String,
    api_port: u16,
    raft_config: RaftConfig,
    client: reqwest::Client,
}

impl ClusterService {
    /// Load or mint the local node identity and, when the cluster is
    /// already initialized, resume the Raft participant.
    pub async fn bootstrap(db: Arc<Database>, config: &SylveConfig) -> Result<Arc<Self>> {
        let pool = db.pool();

        let node_id = match db::raft::get_meta(pool, META_LOCAL_NODE_ID).await? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                db::raft::set_meta(pool, META_LOCAL_NODE_ID, &id).await?;
                id
            }
        };

        let hostname = SylveConfig::local_hostname();
        let raft_addr = config.cluster.raft_addr.clone();
        let api_host = raft_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let api_addr = format!("{}:{}", api_host, config.server.port);

        // Intra-cluster client; skip-verify is deliberate for the mesh.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Fatal(format!("Failed to build cluster HTTP client: {}", e)))?;

        let service = Arc::new(Self {
            fsm: Arc::new(ClusterFsm::new(db.clone())),
            raft: RwLock::new(None),
            db,
            node_id,
            hostname,
            raft_addr,
            api_addr,
            api_port: config.server.port,
            raft_config: RaftConfig {
                election_timeout: std::time::Duration::from_millis(
                    config.cluster.election_timeout_ms,
                ),
                heartbeat_interval: std::time::Duration::from_millis(
                    config.cluster.heartbeat_interval_ms,
                ),
                compaction_threshold: config.cluster.log_compaction_threshold,
            },
            client,
        });

        if let Some(key) = db::cluster::get_cluster_key(service.db.pool()).await? {
            service.start_raft(key).await?;
            info!("Resumed cluster membership as node {}", service.node_id);
        } else {
            info!("Running in single-node mode as node {}", service.node_id);
        }

        Ok(service)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn raft(&self) -> Option<Arc<RaftNode>> {
        self.raft.read().await.clone()
    }

    pub async fn cluster_key(&self) -> Result<Option<String>> {
        db::cluster::get_cluster_key(self.db.pool()).await
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(self.cluster_key().await, Ok(Some(_)))
    }

    /// Whether writes may be applied locally. True for the Raft leader
    /// and for single-node mode.
    pub async fn is_leader(&self) -> bool {
        match self.raft().await {
            Some(raft) => raft.is_leader().await,
            None => true,
        }
    }

    /// The leader's API address, derived from its Raft address (same
    /// host, configured API port).
    pub async fn leader_api_addr(&self) -> Result<String> {
        match self.raft().await {
            None => Ok(self.api_addr.clone()),
            Some(raft) => {
                let (_, raft_addr) = raft.leader().await.ok_or(Error::LeaderUnknown)?;
                let host = raft_addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(raft_addr.as_str());
                Ok(format!("{}:{}", host, self.api_port))
            }
        }
    }

    /// Apply a configuration mutation: through Raft when clustered,
    /// directly against the FSM in single-node mode.
    pub async fn propose(&self, proposal: Proposal) -> Result<()> {
        match self.raft().await {
            Some(raft) => raft.propose(proposal).await,
            None => self.fsm.apply(&proposal).await,
        }
    }

    pub async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        db::nodes::list(self.db.pool()).await
    }

    pub async fn node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        db::nodes::get(self.db.pool(), node_id).await
    }

    pub async fn local_node(&self) -> Result<Option<NodeRecord>> {
        self.node(&self.node_id).await
    }

    fn local_node_record(&self) -> NodeRecord {
        NodeRecord {
            id: self.node_id.clone(),
            hostname: self.hostname.clone(),
            raft_addr: self.raft_addr.clone(),
            api_addr: self.api_addr.clone(),
            guest_ids: Vec::new(),
        }
    }

    async fn start_raft(self: &Arc<Self>, cluster_key: String) -> Result<()> {
        let mut guard = self.raft.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let node = RaftNode::load(
            self.node_id.clone(),
            self.raft_addr.clone(),
            self.raft_config.clone(),
            self.db.clone(),
            self.fsm.clone(),
            self.client.clone(),
            cluster_key,
        )
        .await?;
        node.start();
        *guard = Some(node);
        Ok(())
    }

    /// Create a new cluster on this node: mint the cluster key, register
    /// ourselves in the node table, start Raft. Returns the key the
    /// operator hands to joining peers.
    pub async fn init_cluster(self: &Arc<Self>) -> Result<String> {
        if self.is_initialized().await {
            return Err(Error::conflict(
                "cluster_already_initialized",
                "this node is already part of a cluster",
            ));
        }

        let mut key_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let cluster_key = hex::encode(key_bytes);

        // Applied locally (no Raft yet), then Raft starts from this state.
        self.fsm
            .apply(&Proposal::ClusterKeyRotate {
                cluster_key: cluster_key.clone(),
            })
            .await?;
        self.fsm
            .apply(&Proposal::NodeUpsert {
                node: self.local_node_record(),
            })
            .await?;

        self.start_raft(cluster_key.clone()).await?;
        info!("Cluster initialized by node {}", self.node_id);
        Ok(cluster_key)
    }

    /// Join an existing cluster through any member's API address.
    pub async fn join_cluster(self: &Arc<Self>, peer_api: &str, cluster_key: &str) -> Result<()> {
        if self.is_initialized().await {
            return Err(Error::conflict(
                "cluster_already_initialized",
                "this node is already part of a cluster",
            ));
        }

        let request = JoinRequest {
            cluster_key: cluster_key.to_string(),
            node: self.local_node_record(),
        };
        // The joiner is not in the mesh yet; the shared key in the query
        // is its only credential.
        let url = format!(
            "http://{}/api/cluster/join-request?clusterkey={}",
            peer_api, cluster_key
        );
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::RemoteForward {
                node: peer_api.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RemoteForward {
                node: peer_api.to_string(),
                detail: format!("join rejected: {}", body),
            });
        }

        let join: sylve_common::ApiEnvelope<JoinResponse> = response
            .json()
            .await
            .map_err(|e| Error::Fatal(format!("invalid join response: {}", e)))?;
        let join = join
            .data
            .ok_or_else(|| Error::Fatal("join response carried no data".to_string()))?;

        // Seed the local replicated view, then join the Raft mesh; the
        // leader's next snapshot/append reconciles any drift.
        db::cluster::set_cluster_key(self.db.pool(), &join.cluster_key).await?;
        for node in &join.nodes {
            db::nodes::upsert(self.db.pool(), node).await?;
        }
        db::nodes::upsert(self.db.pool(), &self.local_node_record()).await?;

        self.start_raft(join.cluster_key).await?;
        info!("Joined cluster via {}", peer_api);
        Ok(())
    }

    /// Handle a peer's join request (leader-side).
    pub async fn handle_join(&self, request: JoinRequest) -> Result<JoinResponse> {
        let key = self
            .cluster_key()
            .await?
            .ok_or_else(|| Error::validation("this node is not part of a cluster"))?;
        if request.cluster_key != key {
            return Err(Error::conflict(
                "invalid_cluster_key",
                "cluster key does not match",
            ));
        }

        self.propose(Proposal::NodeUpsert {
            node: request.node.clone(),
        })
        .await?;

        Ok(JoinResponse {
            cluster_key: key,
            nodes: self.nodes().await?,
        })
    }

    /// Record a guest placement on this node (restore and rollback paths
    /// keep the placement set authoritative).
    pub async fn register_guest_id(&self, guest_id: u32) -> Result<()> {
        let mut node = self
            .local_node()
            .await?
            .unwrap_or_else(|| self.local_node_record());
        if !node.guest_ids.contains(&guest_id) {
            node.guest_ids.push(guest_id);
            node.guest_ids.sort_unstable();
            self.propose(Proposal::NodeUpsert { node }).await?;
        }
        Ok(())
    }

    /// Publish this node's cluster SSH public key so peers can authorize
    /// replication pipelines.
    pub async fn publish_ssh_identity(&self, public_key: &str) -> Result<()> {
        if public_key.trim().is_empty() {
            warn!("Skipping empty SSH identity for node {}", self.node_id);
            return Ok(());
        }
        self.propose(Proposal::ClusterSshIdentityUpsert {
            identity: ClusterSshIdentity {
                node_id: self.node_id.clone(),
                public_key: public_key.trim().to_string(),
            },
        })
        .await
    }

    pub async fn ssh_identities(&self) -> Result<Vec<ClusterSshIdentity>> {
        db::ssh_identities::list(self.db.pool()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> Arc<ClusterService> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let config = SylveConfig::default();
        ClusterService::bootstrap(db, &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_node_propose_applies_directly() {
        let service = service().await;
        assert!(!service.is_initialized().await);
        assert!(service.is_leader().await);

        service
            .propose(Proposal::NodeUpsert {
                node: NodeRecord {
                    id: "peer".to_string(),
                    hostname: "peer".to_string(),
                    raft_addr: "10.0.0.9:8182".to_string(),
                    api_addr: "10.0.0.9:8181".to_string(),
                    guest_ids: vec![],
                },
            })
            .await
            .unwrap();

        assert_eq!(service.nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_node_identity_is_stable() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let config = SylveConfig::default();

        let first = ClusterService::bootstrap(db.clone(), &config)
            .await
            .unwrap()
            .node_id()
            .to_string();
        let second = ClusterService::bootstrap(db, &config)
            .await
            .unwrap()
            .node_id()
            .to_string();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_init_cluster_registers_self() {
        let service = service().await;
        let key = service.init_cluster().await.unwrap();
        assert_eq!(key.len(), 64);
        assert!(service.is_initialized().await);

        let nodes = service.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, service.node_id());

        // Double init is rejected
        let err = service.init_cluster().await.unwrap_err();
        assert_eq!(err.code(), "cluster_already_initialized");
    }

    #[tokio::test]
    async fn test_handle_join_validates_key() {
        let service = service().await;
        service.init_cluster().await.unwrap();

        let request = JoinRequest {
            cluster_key: "wrong".to_string(),
            node: NodeRecord {
                id: "n2".to_string(),
                hostname: "n2".to_string(),
                raft_addr: "10.0.0.2:8182".to_string(),
                api_addr: "10.0.0.2:8181".to_string(),
                guest_ids: vec![],
            },
        };
        let err = service.handle_join(request).await.unwrap_err();
        assert_eq!(err.code(), "invalid_cluster_key");
    }

    #[tokio::test]
    async fn test_register_guest_id_is_idempotent() {
        let service = service().await;
        service.register_guest_id(100).await.unwrap();
        service.register_guest_id(100).await.unwrap();
        service.register_guest_id(104).await.unwrap();

        let node = service.local_node().await.unwrap().unwrap();
        assert_eq!(node.guest_ids, vec![100, 104]);
    }
}

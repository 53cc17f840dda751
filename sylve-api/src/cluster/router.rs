//! Request router: leader forwarding and runner-pinned node forwarding.
//!
//! A pure REST-level dispatch layer. Writes land on the leader; calls
//! pinned to a runner node are forwarded verbatim with a short-lived
//! cluster JWT. Bodies are never altered; only the `nodeId` query
//! parameter is stripped to avoid forwarding loops.

use std::sync::Arc;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sylve_common::{Error, Result};
use tracing::debug;

use super::ClusterService;

/// Cluster JWT lifetime; long enough for one forwarded call, short
/// enough that a captured token is useless.
pub const CLUSTER_TOKEN_TTL_SECS: u64 = 30;

/// Claims carried by the intra-cluster token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterClaims {
    /// Issuing node's hostname.
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

/// Mint a short-lived HS256 cluster token.
pub fn mint_cluster_token(hostname: &str, cluster_key: &str) -> Result<String> {
    let iat = chrono::Utc::now().timestamp() as u64;
    let claims = ClusterClaims {
        iss: hostname.to_string(),
        iat,
        exp: iat + CLUSTER_TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cluster_key.as_bytes()),
    )
    .map_err(|e| Error::Fatal(format!("Failed to sign cluster token: {}", e)))
}

/// Verify a cluster token and return its claims.
pub fn verify_cluster_token(token: &str, cluster_key: &str) -> Result<ClusterClaims> {
    let mut validation = Validation::default();
    validation.leeway = 5;
    decode::<ClusterClaims>(
        token,
        &DecodingKey::from_secret(cluster_key.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| Error::validation(format!("invalid cluster token: {}", e)))
}

/// Strip `nodeId` from a query string so a forwarded request cannot
/// bounce again.
pub fn strip_node_id_query(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            key != "nodeId"
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// A forwarded response: status and body, returned verbatim.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

pub struct ClusterRouter {
    cluster: Arc<ClusterService>,
}

impl ClusterRouter {
    pub fn new(cluster: Arc<ClusterService>) -> Self {
        Self { cluster }
    }

    /// True when the request names another node and has to travel.
    pub fn should_forward(&self, requested_node_id: &str) -> bool {
        !requested_node_id.is_empty() && requested_node_id != self.cluster.node_id()
    }

    async fn require_cluster_key(&self) -> Result<String> {
        self.cluster
            .cluster_key()
            .await?
            .ok_or_else(|| Error::validation("this node is not part of a cluster"))
    }

    /// Resolve a node's API address from the replicated node table.
    async fn resolve_api_addr(&self, node_id: &str) -> Result<String> {
        match self.cluster.node(node_id).await? {
            Some(node) => Ok(node.api_addr),
            None => Err(Error::not_found(
                "node_not_found",
                format!("node {} is not in the cluster", node_id),
            )),
        }
    }

    /// Forward a JSON call to a specific node, streaming status and body
    /// back verbatim. Authenticated with a fresh cluster JWT.
    pub async fn forward_to_node(
        &self,
        node_id: &str,
        method: reqwest::Method,
        path_and_query: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<ForwardedResponse> {
        let api_addr = self.resolve_api_addr(node_id).await?;
        let cluster_key = self.require_cluster_key().await?;
        let token = mint_cluster_token(self.cluster.hostname(), &cluster_key)?;

        let url = format!("http://{}{}", api_addr, path_and_query);
        debug!("Forwarding {} {} to node {}", method, url, node_id);

        let mut request = self
            .cluster
            .client()
            .request(method, &url)
            .header("X-Cluster-Token", format!("Bearer {}", token));
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| Error::RemoteForward {
            node: node_id.to_string(),
            detail: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::RemoteForward {
                node: node_id.to_string(),
                detail: e.to_string(),
            })?
            .to_vec();

        Ok(ForwardedResponse { status, body })
    }

    /// Forward a request to the current leader (reverse-proxy style).
    /// Legacy path authentication: `clusterkey=<shared>` query parameter.
    pub async fn forward_to_leader(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<ForwardedResponse> {
        let leader_api = self.cluster.leader_api_addr().await?;
        let cluster_key = self.require_cluster_key().await?;

        let mut query = strip_node_id_query(query);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!("clusterkey={}", cluster_key));

        let url = format!("http://{}{}?{}", leader_api, path, query);
        debug!("Forwarding {} {} to leader", method, url);

        let mut request = self.cluster.client().request(method, &url);
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(|e| Error::RemoteForward {
            node: "leader".to_string(),
            detail: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::RemoteForward {
                node: "leader".to_string(),
                detail: e.to_string(),
            })?
            .to_vec();

        Ok(ForwardedResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let token = mint_cluster_token("node-a", "shared-key").unwrap();
        let claims = verify_cluster_token(&token, "shared-key").unwrap();
        assert_eq!(claims.iss, "node-a");
        assert!(claims.exp - claims.iat == CLUSTER_TOKEN_TTL_SECS);
    }

    #[test]
    fn test_token_rejects_wrong_key() {
        let token = mint_cluster_token("node-a", "shared-key").unwrap();
        assert!(verify_cluster_token(&token, "other-key").is_err());
        assert!(verify_cluster_token("garbage", "shared-key").is_err());
    }

    #[test]
    fn test_strip_node_id_query() {
        assert_eq!(strip_node_id_query("nodeId=abc"), "");
        assert_eq!(strip_node_id_query("a=1&nodeId=abc&b=2"), "a=1&b=2");
        assert_eq!(strip_node_id_query(""), "");
        assert_eq!(strip_node_id_query("a=1"), "a=1");
    }

    #[tokio::test]
    async fn test_should_forward() {
        let db = std::sync::Arc::new(crate::db::Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let cluster =
            ClusterService::bootstrap(db, &crate::config::SylveConfig::default())
                .await
                .unwrap();
        let router = ClusterRouter::new(cluster.clone());

        assert!(!router.should_forward(""));
        assert!(!router.should_forward(cluster.node_id()));
        assert!(router.should_forward("some-other-node"));
    }
}

//! In-crate Raft consensus core.
//!
//! Terms, randomized election timeouts, heartbeat/append-entries with the
//! prev-log consistency check, commit at majority match, and a SQL-backed
//! log. Transport is JSON over the intra-cluster HTTP client; peers are
//! the replicated node table. The state machine it drives is
//! [`ClusterFsm`]; snapshots of the replicated tables stand in for the
//! compacted log prefix when a follower is too far behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sylve_common::model::NodeRecord;
use sylve_common::{Error, Result};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::fsm::{ClusterFsm, FsmSnapshot, Proposal};
use crate::db::{self, Database};

const META_CURRENT_TERM: &str = "current_term";
const META_VOTED_FOR: &str = "voted_for";
const META_LAST_APPLIED: &str = "last_applied";
const META_COMPACTED_THROUGH: &str = "compacted_through";
const META_COMPACTED_TERM: &str = "compacted_term";

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const RPC_TIMEOUT: Duration = Duration::from_secs(3);
const PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a log entry carries. `Noop` is the freshly-elected leader's
/// commit barrier; only `Config` reaches the FSM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogCommand {
    Noop,
    Config { proposal: Proposal },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: LogCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub through_index: u64,
    pub through_term: u64,
    pub data: FsmSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: String,
    pub leader_raft_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    /// Replaces the log prefix when the follower is behind the compaction
    /// horizon.
    pub snapshot: Option<SnapshotPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub compaction_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_millis(500),
            compaction_threshold: 4096,
        }
    }
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    /// Entries after the compaction horizon, ascending by index.
    log: Vec<LogEntry>,
    compacted_through: u64,
    compacted_term: u64,
    commit_index: u64,
    last_applied: u64,
    leader: Option<(String, String)>,
    peers: Vec<NodeRecord>,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    last_broadcast: Instant,
    waiters: HashMap<u64, oneshot::Sender<Result<()>>>,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.compacted_through)
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.compacted_term)
    }

    /// Term of the entry at `index`, if it is still known locally.
    fn entry_term(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.compacted_through {
            return Some(self.compacted_term);
        }
        self.log
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.term)
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        self.log.iter().filter(|e| e.index >= index).cloned().collect()
    }

    fn fail_waiters(&mut self) {
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(Error::NotLeader));
        }
    }
}

/// Index a majority of the cluster has replicated through, given the
/// leader's own last index and the followers' match indexes.
fn majority_match(own_last: u64, match_index: &HashMap<String, u64>, cluster_size: usize) -> u64 {
    let mut indexes: Vec<u64> = match_index.values().copied().collect();
    indexes.push(own_last);
    indexes.sort_unstable_by(|a, b| b.cmp(a));
    let majority = cluster_size / 2; // zero-based position of the median vote
    indexes.get(majority).copied().unwrap_or(0)
}

/// Candidate log at least as up-to-date as ours (Raft §5.4.1).
fn candidate_up_to_date(
    candidate_last_term: u64,
    candidate_last_index: u64,
    own_last_term: u64,
    own_last_index: u64,
) -> bool {
    candidate_last_term > own_last_term
        || (candidate_last_term == own_last_term && candidate_last_index >= own_last_index)
}

/// A Raft participant bound to one node identity.
pub struct RaftNode {
    node_id: String,
    raft_addr: String,
    config: RaftConfig,
    db: Arc<Database>,
    fsm: Arc<ClusterFsm>,
    client: reqwest::Client,
    cluster_key: String,
    state: Mutex<RaftState>,
}

impl RaftNode {
    /// Load persisted Raft state and build the node.
    pub async fn load(
        node_id: String,
        raft_addr: String,
        config: RaftConfig,
        db: Arc<Database>,
        fsm: Arc<ClusterFsm>,
        client: reqwest::Client,
        cluster_key: String,
    ) -> Result<Arc<Self>> {
        let pool = db.pool();
        let current_term = db::raft::get_meta(pool, META_CURRENT_TERM)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let voted_for = db::raft::get_meta(pool, META_VOTED_FOR)
            .await?
            .filter(|v| !v.is_empty());
        let last_applied = db::raft::get_meta(pool, META_LAST_APPLIED)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let compacted_through = db::raft::get_meta(pool, META_COMPACTED_THROUGH)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let compacted_term = db::raft::get_meta(pool, META_COMPACTED_TERM)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut log = Vec::new();
        for stored in db::raft::entries_from(pool, compacted_through + 1).await? {
            let command: LogCommand = serde_json::from_str(&stored.proposal)?;
            log.push(LogEntry {
                index: stored.index,
                term: stored.term,
                command,
            });
        }

        let now = Instant::now();
        let node = Arc::new(Self {
            node_id,
            raft_addr,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term,
                voted_for,
                log,
                compacted_through,
                compacted_term,
                commit_index: last_applied,
                last_applied,
                leader: None,
                peers: Vec::new(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline: now + config.election_timeout,
                last_broadcast: now,
                waiters: HashMap::new(),
            }),
            config,
            db,
            fsm,
            client,
            cluster_key,
        });
        Ok(node)
    }

    /// Spawn the tick loop.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            info!("Raft loop started on {}", node.node_id);
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = node.tick().await {
                    warn!("Raft tick failed: {}", e);
                }
            }
        });
    }

    fn random_timeout(&self) -> Duration {
        let base = self.config.election_timeout.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(base..base * 2))
    }

    /// Current leader as `(node_id, raft_addr)`, if known.
    pub async fn leader(&self) -> Option<(String, String)> {
        let st = self.state.lock().await;
        if st.role == Role::Leader {
            Some((self.node_id.clone(), self.raft_addr.clone()))
        } else {
            st.leader.clone()
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    async fn persist_term(&self, term: u64, voted_for: &Option<String>) -> Result<()> {
        let pool = self.db.pool();
        db::raft::set_meta(pool, META_CURRENT_TERM, &term.to_string()).await?;
        db::raft::set_meta(pool, META_VOTED_FOR, voted_for.as_deref().unwrap_or("")).await?;
        Ok(())
    }

    async fn persist_entry(&self, entry: &LogEntry) -> Result<()> {
        db::raft::append(
            self.db.pool(),
            &db::raft::StoredEntry {
                index: entry.index,
                term: entry.term,
                proposal: serde_json::to_string(&entry.command)?,
            },
        )
        .await
    }

    /// Propose a configuration mutation. Succeeds once the entry is
    /// committed and applied on this (leader) node; fails with the FSM's
    /// typed error when the apply rejects.
    pub async fn propose(self: &Arc<Self>, proposal: Proposal) -> Result<()> {
        let rx = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(match &st.leader {
                    Some(_) => Error::NotLeader,
                    None => Error::LeaderUnknown,
                });
            }

            let entry = LogEntry {
                index: st.last_log_index() + 1,
                term: st.current_term,
                command: LogCommand::Config { proposal },
            };
            self.persist_entry(&entry).await?;
            let (tx, rx) = oneshot::channel();
            st.waiters.insert(entry.index, tx);
            st.log.push(entry);
            rx
        };

        self.broadcast().await?;

        match tokio::time::timeout(PROPOSE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::LeaderUnknown),
            Err(_) => Err(Error::LeaderUnknown),
        }
    }

    async fn refresh_peers(&self) -> Result<Vec<NodeRecord>> {
        let nodes = db::nodes::list(self.db.pool()).await?;
        Ok(nodes.into_iter().filter(|n| n.id != self.node_id).collect())
    }

    async fn tick(self: &Arc<Self>) -> Result<()> {
        let peers = self.refresh_peers().await?;
        let now = Instant::now();

        let action = {
            let mut st = self.state.lock().await;
            st.peers = peers;
            match st.role {
                Role::Leader => {
                    if now >= st.last_broadcast + self.config.heartbeat_interval {
                        Some(TickAction::Broadcast)
                    } else {
                        None
                    }
                }
                Role::Follower | Role::Candidate => {
                    if now >= st.election_deadline {
                        Some(TickAction::Election)
                    } else {
                        None
                    }
                }
            }
        };

        match action {
            Some(TickAction::Broadcast) => self.broadcast().await,
            Some(TickAction::Election) => self.run_election().await,
            None => Ok(()),
        }
    }

    async fn run_election(self: &Arc<Self>) -> Result<()> {
        let (term, request, peers) = {
            let mut st = self.state.lock().await;
            st.role = Role::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.node_id.clone());
            st.leader = None;
            st.election_deadline = Instant::now() + self.random_timeout();
            self.persist_term(st.current_term, &st.voted_for).await?;

            debug!("Starting election for term {}", st.current_term);
            (
                st.current_term,
                VoteRequest {
                    term: st.current_term,
                    candidate_id: self.node_id.clone(),
                    last_log_index: st.last_log_index(),
                    last_log_term: st.last_log_term(),
                },
                st.peers.clone(),
            )
        };

        // Single-node cluster wins immediately.
        if peers.is_empty() {
            return self.become_leader(term).await;
        }

        let mut votes = 1usize;
        let mut handles = Vec::new();
        for peer in &peers {
            let url = self.peer_url(peer, "vote");
            let client = self.client.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                let response = client
                    .post(&url)
                    .timeout(RPC_TIMEOUT)
                    .json(&request)
                    .send()
                    .await
                    .ok()?;
                response.json::<VoteResponse>().await.ok()
            }));
        }

        for handle in handles {
            if let Ok(Some(resp)) = handle.await {
                if resp.term > term {
                    self.step_down(resp.term).await?;
                    return Ok(());
                }
                if resp.granted {
                    votes += 1;
                }
            }
        }

        let cluster_size = peers.len() + 1;
        if votes > cluster_size / 2 {
            self.become_leader(term).await?;
        }
        Ok(())
    }

    async fn become_leader(self: &Arc<Self>, term: u64) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.role != Role::Candidate || st.current_term != term {
                return Ok(());
            }
            info!("Won election for term {}", term);
            st.role = Role::Leader;
            st.leader = Some((self.node_id.clone(), self.raft_addr.clone()));
            let next = st.last_log_index() + 1;
            st.next_index = st.peers.iter().map(|p| (p.id.clone(), next)).collect();
            st.match_index = st.peers.iter().map(|p| (p.id.clone(), 0)).collect();

            // Commit barrier: entries from earlier terms only commit once
            // an entry of this term is replicated.
            let entry = LogEntry {
                index: next,
                term,
                command: LogCommand::Noop,
            };
            self.persist_entry(&entry).await?;
            st.log.push(entry);
        }
        self.broadcast().await
    }

    async fn step_down(&self, term: u64) -> Result<()> {
        let mut st = self.state.lock().await;
        if term > st.current_term {
            st.current_term = term;
            st.voted_for = None;
            self.persist_term(term, &None).await?;
        }
        if st.role != Role::Follower {
            debug!("Stepping down at term {}", st.current_term);
        }
        st.role = Role::Follower;
        st.election_deadline = Instant::now() + self.random_timeout();
        st.fail_waiters();
        Ok(())
    }

    fn peer_url(&self, peer: &NodeRecord, rpc: &str) -> String {
        format!(
            "http://{}/api/cluster/raft/{}?clusterkey={}",
            peer.api_addr, rpc, self.cluster_key
        )
    }

    /// Send append-entries (or a snapshot) to every peer and advance the
    /// commit index as responses come back.
    async fn broadcast(self: &Arc<Self>) -> Result<()> {
        let sends = {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return Ok(());
            }
            st.last_broadcast = Instant::now();

            if st.peers.is_empty() {
                // Single-node cluster: everything is trivially replicated.
                self.advance_commit(&mut st).await?;
                return Ok(());
            }

            let mut sends = Vec::new();
            for peer in st.peers.clone() {
                let next = *st.next_index.get(&peer.id).unwrap_or(&1);
                let request = if next <= st.compacted_through {
                    let data = self.fsm.snapshot().await?;
                    AppendRequest {
                        term: st.current_term,
                        leader_id: self.node_id.clone(),
                        leader_raft_addr: self.raft_addr.clone(),
                        prev_log_index: 0,
                        prev_log_term: 0,
                        entries: st.entries_from(st.compacted_through + 1),
                        leader_commit: st.commit_index,
                        snapshot: Some(SnapshotPayload {
                            through_index: st.compacted_through,
                            through_term: st.compacted_term,
                            data,
                        }),
                    }
                } else {
                    let prev = next - 1;
                    AppendRequest {
                        term: st.current_term,
                        leader_id: self.node_id.clone(),
                        leader_raft_addr: self.raft_addr.clone(),
                        prev_log_index: prev,
                        prev_log_term: st.entry_term(prev).unwrap_or(0),
                        entries: st.entries_from(next),
                        leader_commit: st.commit_index,
                        snapshot: None,
                    }
                };
                sends.push((peer, request));
            }
            sends
        };

        for (peer, request) in sends {
            let node = Arc::clone(self);
            let url = self.peer_url(&peer, "append");
            let sent_term = request.term;
            let sent_up_to = request
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or(request.prev_log_index.max(
                    request.snapshot.as_ref().map(|s| s.through_index).unwrap_or(0),
                ));
            tokio::spawn(async move {
                let response = node
                    .client
                    .post(&url)
                    .timeout(RPC_TIMEOUT)
                    .json(&request)
                    .send()
                    .await;
                let Ok(response) = response else { return };
                let Ok(resp) = response.json::<AppendResponse>().await else {
                    return;
                };
                if let Err(e) = node
                    .handle_append_response(&peer.id, sent_term, sent_up_to, resp)
                    .await
                {
                    warn!("append response handling failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn handle_append_response(
        self: &Arc<Self>,
        peer_id: &str,
        sent_term: u64,
        sent_up_to: u64,
        resp: AppendResponse,
    ) -> Result<()> {
        if resp.term > sent_term {
            return self.step_down(resp.term).await;
        }

        let mut st = self.state.lock().await;
        if st.role != Role::Leader || st.current_term != sent_term {
            return Ok(());
        }

        if resp.success {
            let matched = resp.match_index.max(sent_up_to.min(st.last_log_index()));
            st.match_index.insert(peer_id.to_string(), matched);
            st.next_index.insert(peer_id.to_string(), matched + 1);
            self.advance_commit(&mut st).await?;
        } else {
            // Log mismatch: back next_index off and retry next heartbeat.
            let next = st.next_index.entry(peer_id.to_string()).or_insert(1);
            *next = next.saturating_sub(1).max(1);
        }
        Ok(())
    }

    async fn advance_commit(&self, st: &mut RaftState) -> Result<()> {
        let cluster_size = st.peers.len() + 1;
        let candidate = majority_match(st.last_log_index(), &st.match_index, cluster_size);
        if candidate > st.commit_index && st.entry_term(candidate) == Some(st.current_term) {
            st.commit_index = candidate;
        }
        self.apply_committed(st).await
    }

    async fn apply_committed(&self, st: &mut RaftState) -> Result<()> {
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let entry = match st.log.iter().find(|e| e.index == index) {
                Some(e) => e.clone(),
                None => break,
            };

            let outcome = match &entry.command {
                LogCommand::Noop => Ok(()),
                LogCommand::Config { proposal } => self.fsm.apply(proposal).await,
            };

            // An apply rejection is an answered proposal, not a halted
            // state machine; all replicas reject deterministically.
            if let Some(tx) = st.waiters.remove(&index) {
                let _ = tx.send(outcome);
            } else if let Err(e) = outcome {
                debug!("apply of entry {} rejected: {}", index, e);
            }

            st.last_applied = index;
            db::raft::set_meta(self.db.pool(), META_LAST_APPLIED, &index.to_string()).await?;
        }

        if st.last_applied - st.compacted_through >= self.config.compaction_threshold {
            self.compact(st).await?;
        }
        Ok(())
    }

    /// Drop the applied log prefix; the SQL tables are the snapshot.
    async fn compact(&self, st: &mut RaftState) -> Result<()> {
        let through = st.last_applied;
        let term = st.entry_term(through).unwrap_or(st.compacted_term);
        db::raft::compact_through(self.db.pool(), through).await?;
        db::raft::set_meta(self.db.pool(), META_COMPACTED_THROUGH, &through.to_string()).await?;
        db::raft::set_meta(self.db.pool(), META_COMPACTED_TERM, &term.to_string()).await?;
        st.log.retain(|e| e.index > through);
        st.compacted_through = through;
        st.compacted_term = term;
        info!("Compacted raft log through index {}", through);
        Ok(())
    }

    /// RequestVote RPC handler.
    pub async fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state.lock().await;

        if req.term > st.current_term {
            st.current_term = req.term;
            st.voted_for = None;
            st.role = Role::Follower;
            self.persist_term(req.term, &None).await?;
            st.fail_waiters();
        }

        let up_to_date = candidate_up_to_date(
            req.last_log_term,
            req.last_log_index,
            st.last_log_term(),
            st.last_log_index(),
        );
        let granted = req.term >= st.current_term
            && up_to_date
            && st
                .voted_for
                .as_ref()
                .map(|v| v == &req.candidate_id)
                .unwrap_or(true);

        if granted {
            st.voted_for = Some(req.candidate_id.clone());
            st.election_deadline = Instant::now() + self.random_timeout();
            self.persist_term(st.current_term, &st.voted_for).await?;
        }

        Ok(VoteResponse {
            term: st.current_term,
            granted,
        })
    }

    /// AppendEntries RPC handler.
    pub async fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.state.lock().await;

        if req.term < st.current_term {
            return Ok(AppendResponse {
                term: st.current_term,
                success: false,
                match_index: 0,
            });
        }

        if req.term > st.current_term {
            st.current_term = req.term;
            st.voted_for = None;
            self.persist_term(req.term, &None).await?;
        }
        if st.role != Role::Follower {
            st.fail_waiters();
        }
        st.role = Role::Follower;
        st.leader = Some((req.leader_id.clone(), req.leader_raft_addr.clone()));
        st.election_deadline = Instant::now() + self.random_timeout();

        if let Some(snapshot) = &req.snapshot {
            self.fsm.restore(&snapshot.data).await?;
            db::raft::truncate_from(self.db.pool(), 0).await?;
            st.log.clear();
            st.compacted_through = snapshot.through_index;
            st.compacted_term = snapshot.through_term;
            st.commit_index = snapshot.through_index;
            st.last_applied = snapshot.through_index;
            db::raft::set_meta(
                self.db.pool(),
                META_COMPACTED_THROUGH,
                &snapshot.through_index.to_string(),
            )
            .await?;
            db::raft::set_meta(
                self.db.pool(),
                META_COMPACTED_TERM,
                &snapshot.through_term.to_string(),
            )
            .await?;
            db::raft::set_meta(
                self.db.pool(),
                META_LAST_APPLIED,
                &snapshot.through_index.to_string(),
            )
            .await?;
        } else if req.prev_log_index > 0 {
            match st.entry_term(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    return Ok(AppendResponse {
                        term: st.current_term,
                        success: false,
                        match_index: 0,
                    });
                }
            }
        }

        for entry in &req.entries {
            match st.entry_term(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflict: drop the divergent suffix.
                    db::raft::truncate_from(self.db.pool(), entry.index).await?;
                    st.log.retain(|e| e.index < entry.index);
                }
                None => {}
            }
            self.persist_entry(entry).await?;
            st.log.push(entry.clone());
        }

        let match_index = st.last_log_index();
        if req.leader_commit > st.commit_index {
            st.commit_index = req.leader_commit.min(match_index);
            self.apply_committed(&mut st).await?;
        }

        Ok(AppendResponse {
            term: st.current_term,
            success: true,
            match_index,
        })
    }
}

enum TickAction {
    Broadcast,
    Election,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_match() {
        let mut matches = HashMap::new();
        matches.insert("b".to_string(), 4);
        matches.insert("c".to_string(), 2);

        // 3 nodes, leader at 5: sorted [5,4,2], median position 1 -> 4
        assert_eq!(majority_match(5, &matches, 3), 4);

        // 5 nodes with only two followers reporting: [5,4,2] padded by
        // absent followers counts conservatively
        matches.insert("d".to_string(), 0);
        matches.insert("e".to_string(), 0);
        assert_eq!(majority_match(5, &matches, 5), 2);
    }

    #[test]
    fn test_single_node_majority() {
        let matches = HashMap::new();
        assert_eq!(majority_match(7, &matches, 1), 7);
    }

    #[test]
    fn test_candidate_up_to_date() {
        // Higher last term always wins
        assert!(candidate_up_to_date(3, 1, 2, 10));
        // Same term needs at least our index
        assert!(candidate_up_to_date(2, 10, 2, 10));
        assert!(!candidate_up_to_date(2, 9, 2, 10));
        // Lower term never wins
        assert!(!candidate_up_to_date(1, 100, 2, 1));
    }

    async fn test_node() -> Arc<RaftNode> {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let fsm = Arc::new(ClusterFsm::new(db.clone()));
        RaftNode::load(
            "n1".to_string(),
            "127.0.0.1:8182".to_string(),
            RaftConfig::default(),
            db,
            fsm,
            reqwest::Client::new(),
            "key".to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_vote_granting_and_term_bump() {
        let node = test_node().await;

        let resp = node
            .handle_vote(VoteRequest {
                term: 1,
                candidate_id: "n2".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(resp.granted);
        assert_eq!(resp.term, 1);

        // Same term, different candidate: already voted
        let resp = node
            .handle_vote(VoteRequest {
                term: 1,
                candidate_id: "n3".to_string(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .await
            .unwrap();
        assert!(!resp.granted);
    }

    #[tokio::test]
    async fn test_append_entries_consistency_check() {
        let node = test_node().await;

        let entry = |index, term| LogEntry {
            index,
            term,
            command: LogCommand::Noop,
        };

        // Initial append from a leader
        let resp = node
            .handle_append(AppendRequest {
                term: 1,
                leader_id: "n2".to_string(),
                leader_raft_addr: "10.0.0.2:8182".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1), entry(2, 1)],
                leader_commit: 0,
                snapshot: None,
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);

        // Mismatched prev entry is rejected
        let resp = node
            .handle_append(AppendRequest {
                term: 1,
                leader_id: "n2".to_string(),
                leader_raft_addr: "10.0.0.2:8182".to_string(),
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![entry(6, 1)],
                leader_commit: 0,
                snapshot: None,
            })
            .await
            .unwrap();
        assert!(!resp.success);

        // A newer-term leader overwrites a divergent suffix
        let resp = node
            .handle_append(AppendRequest {
                term: 2,
                leader_id: "n3".to_string(),
                leader_raft_addr: "10.0.0.3:8182".to_string(),
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 2), entry(3, 2)],
                leader_commit: 0,
                snapshot: None,
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 3);

        let leader = node.leader().await;
        assert_eq!(leader.unwrap().0, "n3");
    }

    #[tokio::test]
    async fn test_append_applies_committed_config_entries() {
        let node = test_node().await;

        let target = sylve_common::model::BackupTarget {
            id: 1,
            name: "offsite".to_string(),
            ssh_host: "backup.example.com".to_string(),
            ssh_port: 22,
            ssh_user: "sylve".to_string(),
            ssh_key: "KEY".to_string(),
            ssh_key_path: String::new(),
            backup_root: "bkp/data".to_string(),
            description: String::new(),
            enabled: true,
        };

        let resp = node
            .handle_append(AppendRequest {
                term: 1,
                leader_id: "n2".to_string(),
                leader_raft_addr: "10.0.0.2:8182".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry {
                    index: 1,
                    term: 1,
                    command: LogCommand::Config {
                        proposal: Proposal::BackupTargetCreate { target },
                    },
                }],
                leader_commit: 1,
                snapshot: None,
            })
            .await
            .unwrap();
        assert!(resp.success);

        // The committed entry reached the FSM
        let loaded = db::backup_targets::get(node.db.pool(), 1).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_install_resets_follower() {
        let node = test_node().await;

        let snapshot = FsmSnapshot {
            cluster_key: Some("secret".to_string()),
            nodes: vec![],
            targets: vec![],
            jobs: vec![],
            policies: vec![],
            identities: vec![],
        };

        let resp = node
            .handle_append(AppendRequest {
                term: 3,
                leader_id: "n2".to_string(),
                leader_raft_addr: "10.0.0.2:8182".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 40,
                snapshot: Some(SnapshotPayload {
                    through_index: 40,
                    through_term: 3,
                    data: snapshot,
                }),
            })
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 40);

        let key = db::cluster::get_cluster_key(node.db.pool()).await.unwrap();
        assert_eq!(key.as_deref(), Some("secret"));
    }
}

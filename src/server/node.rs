//! The lockstep node: shared state and the Raft core
//!
//! State is partitioned into independently locked pieces with a fixed
//! acquisition order: the raft state (which also owns the client-ack
//! map) first, then sessions / session-locks / watches; the binlog and
//! meta files are leaf locks. No lock is ever held across RPC I/O:
//! outbound calls snapshot what they need, drop the guard, and deposit
//! results back under the lock.

use crate::common::{parent_key, sanitize_server_id, timestamp_micros, Config, Error, Result};
use crate::proto;
use crate::server::session::SessionTable;
use crate::server::stats::Stats;
use crate::server::users::UserManager;
use crate::server::watch::WatchTable;
use crate::server::{apply, replication, rpc, session};
use crate::storage::store::{encode_tagged, ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX};
use crate::storage::{BinLogger, DataStore, LogEntry, LogOp, Meta};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Follower,
    Candidate,
    Leader,
}

impl NodeStatus {
    pub fn as_proto(self) -> i32 {
        match self {
            NodeStatus::Follower => proto::NodeStatus::Follower as i32,
            NodeStatus::Candidate => proto::NodeStatus::Candidate as i32,
            NodeStatus::Leader => proto::NodeStatus::Leader as i32,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Follower => write!(f, "follower"),
            NodeStatus::Candidate => write!(f, "candidate"),
            NodeStatus::Leader => write!(f, "leader"),
        }
    }
}

/// Completion token of an in-flight client mutation, keyed by log index.
/// The apply loop resolves it when the index commits; losing leadership
/// drains every pending token with a uniform rejection.
pub(crate) enum ClientAck {
    Put(oneshot::Sender<proto::PutResponse>),
    Del(oneshot::Sender<proto::DelResponse>),
    Lock(oneshot::Sender<proto::LockResponse>),
    Unlock(oneshot::Sender<proto::UnlockResponse>),
    Login(oneshot::Sender<proto::LoginResponse>),
    Logout(oneshot::Sender<proto::LogoutResponse>),
    Register(oneshot::Sender<proto::RegisterResponse>),
}

impl ClientAck {
    /// Resolve with success once the entry is applied. `log_status` and
    /// `new_uuid` only matter for the account operations.
    pub(crate) fn complete(self, log_status: proto::OpStatus, new_uuid: &str) {
        match self {
            ClientAck::Put(tx) => {
                let _ = tx.send(proto::PutResponse {
                    success: true,
                    ..Default::default()
                });
            }
            ClientAck::Del(tx) => {
                let _ = tx.send(proto::DelResponse {
                    success: true,
                    ..Default::default()
                });
            }
            ClientAck::Lock(tx) => {
                let _ = tx.send(proto::LockResponse {
                    success: true,
                    ..Default::default()
                });
            }
            ClientAck::Unlock(tx) => {
                let _ = tx.send(proto::UnlockResponse {
                    success: true,
                    ..Default::default()
                });
            }
            ClientAck::Login(tx) => {
                let _ = tx.send(proto::LoginResponse {
                    status: log_status as i32,
                    uuid: new_uuid.to_string(),
                    ..Default::default()
                });
            }
            ClientAck::Logout(tx) => {
                let _ = tx.send(proto::LogoutResponse {
                    status: log_status as i32,
                    ..Default::default()
                });
            }
            ClientAck::Register(tx) => {
                let _ = tx.send(proto::RegisterResponse {
                    status: log_status as i32,
                    ..Default::default()
                });
            }
        }
    }

    pub(crate) fn reject_not_leader(self) {
        match self {
            ClientAck::Put(tx) => {
                let _ = tx.send(proto::PutResponse::default());
            }
            ClientAck::Del(tx) => {
                let _ = tx.send(proto::DelResponse::default());
            }
            ClientAck::Lock(tx) => {
                let _ = tx.send(proto::LockResponse::default());
            }
            ClientAck::Unlock(tx) => {
                let _ = tx.send(proto::UnlockResponse::default());
            }
            ClientAck::Login(tx) => {
                let _ = tx.send(proto::LoginResponse {
                    status: proto::OpStatus::Error as i32,
                    ..Default::default()
                });
            }
            ClientAck::Logout(tx) => {
                let _ = tx.send(proto::LogoutResponse {
                    status: proto::OpStatus::Error as i32,
                    ..Default::default()
                });
            }
            ClientAck::Register(tx) => {
                let _ = tx.send(proto::RegisterResponse {
                    status: proto::OpStatus::Error as i32,
                    ..Default::default()
                });
            }
        }
    }
}

/// A watch delivery queued by the apply loop; processed in log order by
/// a single event worker
pub(crate) struct WatchFire {
    pub bound_key: String,
    pub value: Vec<u8>,
    pub deleted: bool,
}

pub(crate) struct RaftState {
    pub status: NodeStatus,
    pub current_term: i64,
    pub voted_for: HashMap<i64, String>,
    pub vote_grant: HashMap<i64, usize>,
    /// Empty when unknown
    pub current_leader: String,
    pub heartbeat_count: u64,
    pub in_safe_mode: bool,
    pub commit_index: i64,
    pub last_applied_index: i64,
    pub next_index: HashMap<String, i64>,
    pub match_index: HashMap<String, i64>,
    pub replicating: HashSet<String>,
    pub client_ack: HashMap<i64, ClientAck>,
    pub last_quorum_read_us: i64,
    pub last_safe_clean_index: i64,
    pub stop: bool,
}

pub struct Node {
    pub(crate) config: Config,
    pub(crate) self_id: String,
    pub(crate) peers: Vec<String>,
    pub(crate) single_node: bool,
    pub(crate) server_start_us: i64,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) binlog: BinLogger,
    pub(crate) data_store: Arc<DataStore>,
    pub(crate) users: UserManager,
    pub(crate) sessions: Mutex<SessionTable>,
    pub(crate) session_locks: Mutex<HashMap<String, BTreeSet<String>>>,
    pub(crate) watches: Mutex<WatchTable>,
    pub(crate) stats: Stats,
    pub(crate) raft: Mutex<RaftState>,
    pub(crate) commit_notify: Notify,
    pub(crate) replication_notify: Notify,
    /// Serializes AppendEntries processing from the leader
    pub(crate) follower_gate: tokio::sync::Mutex<()>,
    /// Dropped on shutdown so the event worker drains and exits
    event_tx: Mutex<Option<mpsc::UnboundedSender<WatchFire>>>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchFire>>>,
}

impl Node {
    /// Open storage and recover durable state; no background work yet
    pub fn open(config: Config) -> Result<Arc<Node>> {
        config.validate()?;
        let self_id = config.self_endpoint().to_string();
        let peers = config.peers();
        let single_node = config.single_node();
        for member in &config.members {
            if *member == self_id {
                tracing::info!(member = %member, "cluster member [self]");
            } else {
                tracing::info!(member = %member, "cluster member");
            }
        }

        let sub_dir = sanitize_server_id(&self_id);
        let node_dir = config.data_dir.join(&sub_dir);
        let meta = Meta::open(&node_dir)?;
        let binlog = BinLogger::open(
            config.binlog_dir.join(&sub_dir),
            config.binlog_compress,
            config.binlog_block_size_kb,
            config.binlog_write_buffer_mb,
        )?;
        let data_store = Arc::new(DataStore::open(
            node_dir.join("store"),
            config.data_compress,
            config.data_block_size_kb,
            config.data_write_buffer_mb,
        )?);

        let current_term = meta.read_current_term()?;
        let voted_for = meta.read_voted_for()?;
        let root = meta.read_root()?;
        let users = UserManager::load(data_store.clone(), root)?;
        let last_applied_index = read_applied_cursor(&data_store)?;
        tracing::info!(
            term = current_term,
            last_applied = last_applied_index,
            log_length = binlog.length(),
            "recovered durable state"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stats = Stats::new(config.performance_buffer_size, config.trace_ratio);
        Ok(Arc::new(Node {
            self_id,
            peers,
            single_node,
            server_start_us: timestamp_micros(),
            meta: Mutex::new(meta),
            binlog,
            data_store,
            users,
            sessions: Mutex::new(SessionTable::new()),
            session_locks: Mutex::new(HashMap::new()),
            watches: Mutex::new(WatchTable::new()),
            stats,
            raft: Mutex::new(RaftState {
                status: NodeStatus::Follower,
                current_term,
                voted_for,
                vote_grant: HashMap::new(),
                current_leader: String::new(),
                heartbeat_count: 0,
                in_safe_mode: true,
                commit_index: -1,
                last_applied_index,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                replicating: HashSet::new(),
                client_ack: HashMap::new(),
                last_quorum_read_us: 0,
                last_safe_clean_index: -1,
                stop: false,
            }),
            commit_notify: Notify::new(),
            replication_notify: Notify::new(),
            follower_gate: tokio::sync::Mutex::new(()),
            event_tx: Mutex::new(Some(event_tx)),
            event_rx: Mutex::new(Some(event_rx)),
            config,
        }))
    }

    /// Spawn the apply loop, timers and background duties. A single-node
    /// cluster self-promotes here and commits on append from then on.
    pub fn start(node: &Arc<Node>) {
        let event_rx = node
            .event_rx
            .lock()
            .unwrap()
            .take()
            .expect("node started twice");
        tokio::spawn(apply::apply_loop(node.clone()));
        tokio::spawn(event_loop(node.clone(), event_rx));
        tokio::spawn(session::reaper_loop(node.clone()));
        tokio::spawn(replication::gc_loop(node.clone()));
        if node.single_node {
            tracing::info!("single node mode, promoting self");
            let mut state = node.raft.lock().unwrap();
            state.current_term += 1;
            node.persist_term(state.current_term);
            Node::become_leader(node, &mut state);
        } else {
            tokio::spawn(election_timer_loop(node.clone()));
        }
    }

    /// Stop background work; in-flight client calls are abandoned and
    /// timed out by the transport layer
    pub fn shutdown(&self) {
        {
            let mut state = self.raft.lock().unwrap();
            state.stop = true;
        }
        self.commit_notify.notify_one();
        self.replication_notify.notify_waiters();
        self.event_tx.lock().unwrap().take();
    }

    // === Raft transitions ===

    pub(crate) fn persist_term(&self, term: i64) {
        if let Err(e) = self.meta.lock().unwrap().write_current_term(term) {
            apply::fatal("failed to persist current term", &e);
        }
    }

    fn persist_vote(&self, term: i64, candidate: &str) {
        if let Err(e) = self.meta.lock().unwrap().write_voted_for(term, candidate) {
            apply::fatal("failed to persist vote", &e);
        }
    }

    /// Adopt a newer term and fall back to follower, draining every
    /// pending client ack with a rejection
    pub(crate) fn trans_to_follower(&self, state: &mut RaftState, reason: &str, new_term: i64) {
        tracing::info!(
            reason,
            old_term = state.current_term,
            new_term,
            "term is outdated, trans to follower"
        );
        state.status = NodeStatus::Follower;
        state.current_term = new_term;
        state.current_leader.clear();
        self.persist_term(new_term);
        for (_, ack) in state.client_ack.drain() {
            ack.reject_not_leader();
        }
        self.replication_notify.notify_waiters();
    }

    pub(crate) fn become_leader(node: &Arc<Node>, state: &mut RaftState) {
        state.in_safe_mode = true;
        state.status = NodeStatus::Leader;
        state.current_leader = node.self_id.clone();
        tracing::info!(term = state.current_term, "won the election");

        let log_length = node.binlog.length();
        for peer in &node.peers {
            state.next_index.insert(peer.clone(), log_length);
            state.match_index.insert(peer.clone(), -1);
        }
        let nop = LogEntry::nop(state.current_term);
        if let Err(e) = node.binlog.append(&nop) {
            apply::fatal("failed to append nop entry", &e);
        }
        if node.single_node {
            node.update_commit_index(state, node.binlog.last_log_index());
        } else {
            for peer in &node.peers {
                if state.replicating.insert(peer.clone()) {
                    tokio::spawn(replication::replicate_loop(node.clone(), peer.clone()));
                }
            }
            tokio::spawn(replication::heartbeat_loop(node.clone()));
        }
        node.replication_notify.notify_waiters();
    }

    /// Advance the commit index to `index` if a majority of the cluster
    /// (the leader included) has replicated it. Callers guarantee that
    /// the entry at `index` carries the current term.
    pub(crate) fn update_commit_index(&self, state: &mut RaftState, index: i64) {
        if index <= state.commit_index {
            return;
        }
        let mut match_count = 1; // self
        for peer in &self.peers {
            if state.match_index.get(peer).copied().unwrap_or(-1) >= index {
                match_count += 1;
            }
        }
        if 2 * match_count > self.config.members.len() {
            state.commit_index = index;
            tracing::debug!(commit_index = index, "advanced commit index");
            self.commit_notify.notify_one();
        }
    }

    pub(crate) fn on_vote_reply(node: &Arc<Node>, reply: proto::VoteResponse) {
        let mut state = node.raft.lock().unwrap();
        if state.status != NodeStatus::Candidate {
            return;
        }
        if reply.vote_granted && reply.term == state.current_term {
            let term = state.current_term;
            let count = *state
                .vote_grant
                .entry(term)
                .and_modify(|c| *c += 1)
                .or_insert(2); // self + this grant
            if 2 * count > node.config.members.len() {
                Node::become_leader(node, &mut state);
            }
        } else if reply.term > state.current_term {
            node.trans_to_follower(&mut state, "vote reply", reply.term);
        }
    }

    // === Inbound RPCs ===

    /// Vote RPC. The grant is persisted before the reply leaves.
    pub fn handle_vote(&self, request: proto::VoteRequest) -> proto::VoteResponse {
        let mut state = self.raft.lock().unwrap();
        let refuse = |state: &RaftState| proto::VoteResponse {
            term: state.current_term,
            vote_granted: false,
        };

        if request.term < state.current_term {
            return refuse(&state);
        }

        let (last_log_index, last_log_term) = self.binlog.last_index_and_term();
        if request.last_log_term < last_log_term
            || (request.last_log_term == last_log_term && request.last_log_index < last_log_index)
        {
            // candidate's log is behind ours
            return refuse(&state);
        }

        if request.term > state.current_term {
            self.trans_to_follower(&mut state, "vote request", request.term);
        }

        let term = state.current_term;
        match state.voted_for.get(&term).cloned() {
            Some(voted) if voted != request.candidate_id => {
                tracing::warn!(
                    term,
                    voted_for = %voted,
                    candidate = %request.candidate_id,
                    "refusing vote, already voted this term"
                );
                refuse(&state)
            }
            Some(_) => proto::VoteResponse {
                term,
                vote_granted: true,
            },
            None => {
                state.voted_for.insert(term, request.candidate_id.clone());
                self.persist_vote(term, &request.candidate_id);
                tracing::info!(term, candidate = %request.candidate_id, "granted vote");
                proto::VoteResponse {
                    term,
                    vote_granted: true,
                }
            }
        }
    }

    /// AppendEntries RPC: heartbeat, read probe and log replication.
    /// Processing is serialized behind the follower gate so batches land
    /// in arrival order.
    pub async fn handle_append_entries(
        &self,
        request: proto::AppendEntriesRequest,
    ) -> proto::AppendEntriesResponse {
        let _gate = self.follower_gate.lock().await;
        let mut state = self.raft.lock().unwrap();

        let fail = |state: &RaftState, binlog: &BinLogger, is_busy: bool| {
            proto::AppendEntriesResponse {
                current_term: state.current_term,
                success: false,
                log_length: binlog.length(),
                is_busy,
            }
        };

        if request.term < state.current_term {
            return fail(&state, &self.binlog, false);
        }

        if state.status != NodeStatus::Follower {
            tracing::info!(status = %state.status, "stepping back to follower");
            state.status = NodeStatus::Follower;
        }
        if request.term > state.current_term {
            state.current_term = request.term;
            self.persist_term(request.term);
        }
        state.current_leader = request.leader_id.clone();
        state.heartbeat_count += 1;

        if !request.entries.is_empty() {
            if request.prev_log_index >= self.binlog.length() {
                return fail(&state, &self.binlog, false);
            }
            let prev_log_term = if request.prev_log_index >= 0 {
                match self.binlog.read(request.prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(e) => {
                        // pruned by GC; tell the leader where our log ends
                        tracing::warn!(index = request.prev_log_index, error = %e, "bad prev slot");
                        return fail(&state, &self.binlog, false);
                    }
                }
            } else {
                -1
            };
            if prev_log_term != request.prev_log_term {
                tracing::info!(
                    index = request.prev_log_index,
                    local_term = prev_log_term,
                    leader_term = request.prev_log_term,
                    "prev term mismatch, truncating"
                );
                if let Err(e) = self.binlog.truncate(request.prev_log_index - 1) {
                    apply::fatal("failed to truncate binlog", &e);
                }
                return fail(&state, &self.binlog, false);
            }
            if state.commit_index - state.last_applied_index > self.config.max_commit_pending {
                return fail(&state, &self.binlog, true);
            }
            if self.binlog.length() > request.prev_log_index + 1 {
                let old_length = self.binlog.length();
                if let Err(e) = self.binlog.truncate(request.prev_log_index) {
                    apply::fatal("failed to truncate binlog", &e);
                }
                tracing::info!(
                    from = old_length,
                    to = request.prev_log_index,
                    "log length alignment"
                );
            }
            let entries: Result<Vec<LogEntry>> = request
                .entries
                .iter()
                .map(crate::server::entry_from_proto)
                .collect();
            let entries = match entries {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting malformed entries");
                    return fail(&state, &self.binlog, false);
                }
            };
            if let Err(e) = self.binlog.append_batch(&entries) {
                apply::fatal("failed to append replicated batch", &e);
            }
        }

        let new_commit = self
            .binlog
            .last_log_index()
            .min(request.leader_commit_index);
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            self.commit_notify.notify_one();
        }
        proto::AppendEntriesResponse {
            current_term: state.current_term,
            success: true,
            log_length: self.binlog.length(),
            is_busy: false,
        }
    }

    // === Shared helpers ===

    /// A session is expired once it has no entry in the session table
    pub(crate) fn is_expired_session(&self, session_id: &str) -> bool {
        !self.sessions.lock().unwrap().contains(session_id)
    }

    /// True while the node is younger than one session lease; Locks and
    /// Scans stay rejected in this window even after safe mode clears
    pub(crate) fn in_startup_safe_window(&self) -> bool {
        timestamp_micros() - self.server_start_us < self.config.session_expire_timeout_us
    }

    /// Write the synthetic `<action>,<session>` marker to the parent key
    /// so directory-style watchers observe child changes
    pub(crate) fn touch_parent_key(&self, user: &str, key: &str, session: &[u8], action: &str) {
        if let Some(parent) = parent_key(key) {
            let mut marker = action.as_bytes().to_vec();
            marker.push(b',');
            marker.extend_from_slice(session);
            let tagged = encode_tagged(LogOp::Put, &marker);
            if let Err(e) = self.data_store.put(user, parent, &tagged) {
                tracing::warn!(parent = %parent, error = %e, "failed to touch parent key");
            }
        }
    }

    /// Queue an asynchronous watch delivery (processed in log order)
    pub(crate) fn enqueue_event(&self, bound_key: String, value: Vec<u8>, deleted: bool) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(WatchFire {
                bound_key,
                value,
                deleted,
            });
        }
    }
}

fn read_applied_cursor(store: &DataStore) -> Result<i64> {
    match store.get(ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX) {
        Ok(raw) => raw
            .as_slice()
            .try_into()
            .map(i64::from_ne_bytes)
            .map_err(|_| Error::Corrupted("bad last-applied cursor".into())),
        Err(Error::NotFound(_)) => Ok(-1),
        Err(e) => Err(e),
    }
}

/// Randomized election timer: when no heartbeat arrived within the
/// timeout, campaign for the next term
pub(crate) async fn election_timer_loop(node: Arc<Node>) {
    use rand::Rng;
    loop {
        let timeout_ms = rand::thread_rng()
            .gen_range(node.config.elect_timeout_min_ms..node.config.elect_timeout_max_ms);
        tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;

        let vote_request = {
            let mut state = node.raft.lock().unwrap();
            if state.stop {
                return;
            }
            match state.status {
                NodeStatus::Leader => continue,
                NodeStatus::Follower if state.heartbeat_count > 0 => {
                    state.heartbeat_count = 0;
                    continue;
                }
                _ => {}
            }
            state.current_term += 1;
            let term = state.current_term;
            node.persist_term(term);
            state.status = NodeStatus::Candidate;
            state.voted_for.clear();
            state.vote_grant.clear();
            state.voted_for.insert(term, node.self_id.clone());
            node.persist_vote(term, &node.self_id);
            state.vote_grant.insert(term, 1);

            let (last_log_index, last_log_term) = node.binlog.last_index_and_term();
            tracing::info!(term, last_log_index, last_log_term, "broadcasting vote request");
            proto::VoteRequest {
                term,
                candidate_id: node.self_id.clone(),
                last_log_index,
                last_log_term,
            }
        };

        for peer in node.peers.clone() {
            let node = node.clone();
            let request = vote_request.clone();
            tokio::spawn(async move {
                match rpc::vote(&peer, request).await {
                    Ok(reply) => Node::on_vote_reply(&node, reply),
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "vote request failed"),
                }
            });
        }
    }
}

/// Single worker draining watch deliveries in log order
pub(crate) async fn event_loop(node: Arc<Node>, mut rx: mpsc::UnboundedReceiver<WatchFire>) {
    while let Some(fire) = rx.recv().await {
        deliver_with_parent(&node, fire);
    }
}

fn deliver_with_parent(node: &Arc<Node>, fire: WatchFire) {
    let mut watches = node.watches.lock().unwrap();
    watches.fire_by_key(&fire.bound_key, &fire.bound_key, &fire.value, fire.deleted);
    if let Some(parent) = parent_key(&fire.bound_key) {
        let parent = parent.to_string();
        let fired = watches.fire_by_key(&parent, &fire.bound_key, &fire.value, fire.deleted);
        drop(watches);
        if !fired {
            // the directory watcher may be between re-registrations
            let node = node.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                node.watches.lock().unwrap().fire_by_key(
                    &parent,
                    &fire.bound_key,
                    &fire.value,
                    fire.deleted,
                );
            });
        }
    }
}

/// Node-local view of ShowStatus, shared by the RPC handler and the GC
/// prober's self shortcut
pub(crate) fn local_status(node: &Node) -> proto::ShowStatusResponse {
    let (last_log_index, last_log_term) = node.binlog.last_index_and_term();
    let state = node.raft.lock().unwrap();
    proto::ShowStatusResponse {
        status: state.status.as_proto(),
        term: state.current_term,
        last_log_index,
        last_log_term,
        commit_index: state.commit_index,
        last_applied: state.last_applied_index,
    }
}

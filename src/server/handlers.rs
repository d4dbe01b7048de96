//! Client request handlers
//!
//! Every mutating handler runs the same ladder: reject if not leader
//! (redirecting to the known leader), reject expired uuids, honor safe
//! mode and the startup safe window, enforce write backpressure, then
//! append a log entry and park the reply on a completion token that the
//! apply loop resolves once the entry commits.

use crate::common::{bind_key_and_user, timestamp_micros, Error};
use crate::proto;
use crate::server::node::{ClientAck, Node, NodeStatus, RaftState};
use crate::server::stats::StatOp;
use crate::server::{apply, rpc};
use crate::storage::store::{decode_tagged, TAG_LAST_APPLIED_INDEX, USER_RECORD_PREFIX};
use crate::storage::{LogEntry, LogOp};
use crate::server::users::UserManager;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};

/// Serialized-size cap of one scan response
const MAX_SCAN_BYTES: usize = 26 << 20;

/// `Some(redirect target)` when this node cannot take mutations
fn not_leader(state: &RaftState) -> Option<String> {
    match state.status {
        NodeStatus::Leader => None,
        NodeStatus::Follower => Some(state.current_leader.clone()),
        NodeStatus::Candidate => Some(String::new()),
    }
}

impl Node {
    // === KV operations ===

    pub async fn put(&self, request: proto::PutRequest) -> proto::PutResponse {
        self.stats.count(StatOp::Put);
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::PutResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::PutResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            if state.client_ack.len() > self.config.max_write_pending {
                tracing::warn!(pending = state.client_ack.len(), "too many pending writes");
                return proto::PutResponse::default();
            }
            let entry = LogEntry {
                op: LogOp::Put,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key.clone(),
                value: request.value.clone(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Put(tx));
            rx
        };
        rx.await.unwrap_or_default()
    }

    pub async fn delete(&self, request: proto::DelRequest) -> proto::DelResponse {
        self.stats.count(StatOp::Delete);
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::DelResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::DelResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return proto::DelResponse::default();
            }
            let entry = LogEntry {
                op: LogOp::Del,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key.clone(),
                value: Vec::new(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Del(tx));
            rx
        };
        rx.await.unwrap_or_default()
    }

    /// Serve a read. With more than one member and no recent read quorum
    /// the leader first confirms its authority with an empty
    /// AppendEntries round; a majority of timely, non-higher-term
    /// replies lets it read locally.
    pub async fn get(&self, request: proto::GetRequest) -> proto::GetResponse {
        self.stats.count(StatOp::Get);
        let fail = proto::GetResponse::default;
        let probe = {
            let state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::GetResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if state.in_safe_mode {
                tracing::info!("rejecting read, still in safe mode");
                return fail();
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::GetResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            let now = timestamp_micros();
            let stale =
                now - state.last_quorum_read_us > (self.config.elect_timeout_min_ms as i64) * 1000;
            if !self.single_node && stale {
                Some(proto::AppendEntriesRequest {
                    term: state.current_term,
                    leader_id: self.self_id.clone(),
                    prev_log_index: -1,
                    prev_log_term: -1,
                    entries: Vec::new(),
                    leader_commit_index: state.commit_index,
                })
            } else {
                None
            }
        };

        let Some(request_probe) = probe else {
            return self.read_local(&request);
        };

        let our_term = request_probe.term;
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<i64, ()>>();
        for peer in self.peers.clone() {
            let tx = tx.clone();
            let request_probe = request_probe.clone();
            tokio::spawn(async move {
                let outcome = match rpc::append_entries(&peer, request_probe).await {
                    Ok(reply) => Ok(reply.current_term),
                    Err(_) => Err(()),
                };
                let _ = tx.send(outcome);
            });
        }
        drop(tx);

        let members = self.config.members.len();
        let mut succ_count = 1usize; // the local read counts
        let mut err_count = 0usize;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Ok(reply_term) if reply_term > our_term => {
                    let mut state = self.raft.lock().unwrap();
                    if reply_term > state.current_term {
                        self.trans_to_follower(&mut state, "read quorum probe", reply_term);
                    }
                    return fail();
                }
                Ok(_) => succ_count += 1,
                Err(()) => err_count += 1,
            }
            if 2 * succ_count > members {
                let mut state = self.raft.lock().unwrap();
                if state.status != NodeStatus::Leader {
                    return fail();
                }
                state.last_quorum_read_us = timestamp_micros();
                drop(state);
                return self.read_local(&request);
            }
            if 2 * err_count > members {
                return fail();
            }
        }
        fail()
    }

    /// Local tagged read: an expired lock holder makes the key invisible
    fn read_local(&self, request: &proto::GetRequest) -> proto::GetResponse {
        let user = self.users.username_from_uuid(&request.uuid);
        let miss = proto::GetResponse {
            success: true,
            hit: false,
            ..Default::default()
        };
        let raw = match self.data_store.get(&user, &request.key) {
            Ok(raw) => raw,
            Err(Error::NotFound(_)) | Err(Error::UnknownUser(_)) => return miss,
            Err(e) => {
                tracing::error!(key = %request.key, error = %e, "read failed");
                return proto::GetResponse::default();
            }
        };
        match decode_tagged(&raw) {
            Ok((LogOp::Lock, session)) => {
                let session = String::from_utf8_lossy(session).into_owned();
                if self.is_expired_session(&session) {
                    miss
                } else {
                    proto::GetResponse {
                        success: true,
                        hit: true,
                        value: session.into_bytes(),
                        ..Default::default()
                    }
                }
            }
            Ok((_, value)) => proto::GetResponse {
                success: true,
                hit: true,
                value: value.to_vec(),
                ..Default::default()
            },
            Err(e) => {
                tracing::warn!(key = %request.key, error = %e, "undecodable stored value");
                miss
            }
        }
    }

    pub fn scan(&self, request: proto::ScanRequest) -> proto::ScanResponse {
        self.stats.count(StatOp::Scan);
        {
            let state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::ScanResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::ScanResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            if state.in_safe_mode {
                return proto::ScanResponse::default();
            }
        }
        if self.in_startup_safe_window() {
            tracing::info!("rejecting scan inside startup safe window");
            return proto::ScanResponse::default();
        }

        let user = self.users.username_from_uuid(&request.uuid);
        let size_limit = if request.size_limit > 0 {
            request.size_limit as usize
        } else {
            usize::MAX
        };
        let mut items = Vec::new();
        let mut has_more = false;
        let mut serialized = 0usize;
        let result = self
            .data_store
            .scan(&user, &request.start_key, &request.end_key, |key, raw| {
                if items.len() >= size_limit || serialized > MAX_SCAN_BYTES {
                    has_more = true;
                    return false;
                }
                if key == TAG_LAST_APPLIED_INDEX || key.starts_with(USER_RECORD_PREFIX) {
                    return true;
                }
                let (op, value) = match decode_tagged(raw) {
                    Ok(decoded) => decoded,
                    Err(_) => return true,
                };
                if op == LogOp::Lock {
                    let session = String::from_utf8_lossy(value);
                    if self.is_expired_session(&session) {
                        return true;
                    }
                }
                serialized += key.len() + value.len();
                items.push(proto::ScanItem {
                    key: key.to_string(),
                    value: value.to_vec(),
                });
                true
            });
        match result {
            Ok(()) => proto::ScanResponse {
                success: true,
                items,
                has_more,
                ..Default::default()
            },
            Err(Error::UnknownUser(_)) => proto::ScanResponse {
                success: true,
                uuid_expired: true,
                ..Default::default()
            },
            Err(e) => {
                tracing::error!(error = %e, "scan failed");
                proto::ScanResponse::default()
            }
        }
    }

    // === Locks ===

    /// The lock is writable if the key is free, held by a session that
    /// has expired, or held by the requester itself (re-entry). The
    /// requesting session must be live in every case.
    fn lock_is_available(&self, user: &str, key: &str, session_id: &str) -> bool {
        let raw = match self.data_store.get(user, key) {
            Ok(raw) => raw,
            Err(_) => return !self.is_expired_session(session_id),
        };
        match decode_tagged(&raw) {
            Ok((LogOp::Lock, holder)) => {
                let holder = String::from_utf8_lossy(holder).into_owned();
                if holder == session_id {
                    return true;
                }
                self.is_expired_session(&holder) && !self.is_expired_session(session_id)
            }
            _ => false,
        }
    }

    pub async fn lock(&self, request: proto::LockRequest) -> proto::LockResponse {
        self.stats.count(StatOp::Lock);
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::LockResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::LockResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            if state.in_safe_mode {
                tracing::info!("rejecting lock, still in safe mode");
                return proto::LockResponse::default();
            }
            if self.in_startup_safe_window() {
                tracing::info!("rejecting lock inside startup safe window");
                return proto::LockResponse::default();
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return proto::LockResponse::default();
            }

            let user = self.users.username_from_uuid(&request.uuid);
            if !self.lock_is_available(&user, &request.key, &request.session_id) {
                tracing::info!(key = %request.key, "lock is held by another session");
                return proto::LockResponse::default();
            }
            // pre-write the holder so a racing lock on the same key loses
            // before its entry ever applies
            let tagged = crate::storage::store::encode_tagged(
                LogOp::Lock,
                request.session_id.as_bytes(),
            );
            apply::with_namespace_retry(self, &user, || {
                self.data_store.put(&user, &request.key, &tagged)
            });
            let entry = LogEntry {
                op: LogOp::Lock,
                user,
                key: request.key.clone(),
                value: request.session_id.clone().into_bytes(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Lock(tx));
            rx
        };
        rx.await.unwrap_or_default()
    }

    pub async fn unlock(&self, request: proto::UnlockRequest) -> proto::UnlockResponse {
        self.stats.count(StatOp::Unlock);
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::UnlockResponse {
                    leader_id,
                    ..Default::default()
                };
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return proto::UnlockResponse {
                    uuid_expired: true,
                    ..Default::default()
                };
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return proto::UnlockResponse::default();
            }
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: self.users.username_from_uuid(&request.uuid),
                key: request.key.clone(),
                value: request.session_id.clone().into_bytes(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Unlock(tx));
            rx
        };
        rx.await.unwrap_or_default()
    }

    // === Watches ===

    pub async fn watch(&self, request: proto::WatchRequest) -> proto::WatchResponse {
        self.stats.count(StatOp::Watch);
        {
            let state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return proto::WatchResponse {
                    leader_id,
                    ..Default::default()
                };
            }
        }
        if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
            return proto::WatchResponse {
                uuid_expired: true,
                ..Default::default()
            };
        }

        let user = self.users.username_from_uuid(&request.uuid);
        let bound_key = bind_key_and_user(&user, &request.key);
        let (tx, rx) = oneshot::channel();
        self.watches
            .lock()
            .unwrap()
            .insert(&bound_key, &request.session_id, tx);

        // once the startup window has passed the registration doubles as
        // a read: fire straight away when the caller's snapshot is stale
        if !self.in_startup_safe_window() {
            let lookup = self.data_store.get(&user, &request.key);
            let key_exist = lookup.is_ok();
            let decoded = lookup
                .ok()
                .and_then(|raw| decode_tagged(&raw).ok().map(|(op, v)| (op, v.to_vec())));
            let (op, value) = decoded.unwrap_or((LogOp::Put, Vec::new()));
            let mut watches = self.watches.lock().unwrap();
            if value != request.old_value || key_exist != request.key_exist {
                watches.fire_by_session_and_key(&request.session_id, &bound_key, &value, !key_exist);
            } else if op == LogOp::Lock {
                let holder = String::from_utf8_lossy(&value).into_owned();
                if self.is_expired_session(&holder) {
                    watches.fire_by_session_and_key(&request.session_id, &bound_key, b"", true);
                }
            }
        }

        rx.await.unwrap_or_default()
    }

    // === Sessions ===

    pub fn keep_alive(&self, request: proto::KeepAliveRequest) -> proto::KeepAliveResponse {
        self.stats.count(StatOp::KeepAlive);
        let is_leader = {
            let state = self.raft.lock().unwrap();
            if !request.forward_from_leader {
                if let Some(leader_id) = not_leader(&state) {
                    return proto::KeepAliveResponse {
                        leader_id,
                        ..Default::default()
                    };
                }
            }
            state.status == NodeStatus::Leader
        };

        self.sessions.lock().unwrap().upsert(
            &request.session_id,
            &request.uuid,
            timestamp_micros(),
        );
        {
            let mut session_locks = self.session_locks.lock().unwrap();
            let held: BTreeSet<String> = request.locks.iter().cloned().collect();
            session_locks.insert(request.session_id.clone(), held);
        }

        // the leader mirrors keepalives to every follower so session
        // state survives a failover
        if is_leader && !request.forward_from_leader {
            let mut forward = request.clone();
            forward.forward_from_leader = true;
            for peer in self.peers.clone() {
                let forward = forward.clone();
                tokio::spawn(async move {
                    if let Err(e) = rpc::keep_alive(&peer, forward).await {
                        tracing::debug!(peer = %peer, error = %e, "keepalive forward failed");
                    }
                });
            }
        }
        proto::KeepAliveResponse {
            success: true,
            ..Default::default()
        }
    }

    // === Accounts ===

    pub async fn login(&self, request: proto::LoginRequest) -> proto::LoginResponse {
        let error = |status: proto::OpStatus, leader_id: String| proto::LoginResponse {
            status: status as i32,
            leader_id,
            ..Default::default()
        };
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return error(proto::OpStatus::Error, leader_id);
            }
            if !self.users.is_valid_user(&request.username) {
                return error(proto::OpStatus::UnknownUser, String::new());
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return error(proto::OpStatus::Error, String::new());
            }
            let entry = LogEntry {
                op: LogOp::Login,
                user: UserManager::calc_uuid(&request.username),
                key: request.username.clone(),
                value: request.passwd.clone().into_bytes(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Login(tx));
            rx
        };
        rx.await
            .unwrap_or_else(|_| error(proto::OpStatus::Error, String::new()))
    }

    pub async fn logout(&self, request: proto::LogoutRequest) -> proto::LogoutResponse {
        let error = |status: proto::OpStatus, leader_id: String| proto::LogoutResponse {
            status: status as i32,
            leader_id,
        };
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return error(proto::OpStatus::Error, leader_id);
            }
            if !request.uuid.is_empty() && !self.users.is_logged_in(&request.uuid) {
                return error(proto::OpStatus::UnknownUser, String::new());
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return error(proto::OpStatus::Error, String::new());
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: request.uuid.clone(),
                key: String::new(),
                value: Vec::new(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Logout(tx));
            rx
        };
        rx.await
            .unwrap_or_else(|_| error(proto::OpStatus::Error, String::new()))
    }

    pub async fn register(&self, request: proto::RegisterRequest) -> proto::RegisterResponse {
        let error = |status: proto::OpStatus, leader_id: String| proto::RegisterResponse {
            status: status as i32,
            leader_id,
        };
        let rx = {
            let mut state = self.raft.lock().unwrap();
            if let Some(leader_id) = not_leader(&state) {
                return error(proto::OpStatus::Error, leader_id);
            }
            if state.client_ack.len() > self.config.max_write_pending {
                return error(proto::OpStatus::Error, String::new());
            }
            let entry = LogEntry {
                op: LogOp::Register,
                user: String::new(),
                key: request.username.clone(),
                value: request.passwd.clone().into_bytes(),
                term: state.current_term,
            };
            let (tx, rx) = oneshot::channel();
            self.append_with_ack(&mut state, entry, ClientAck::Register(tx));
            rx
        };
        rx.await
            .unwrap_or_else(|_| error(proto::OpStatus::Error, String::new()))
    }

    // === Cluster management ===

    pub fn show_status(&self) -> proto::ShowStatusResponse {
        crate::server::node::local_status(self)
    }

    pub(crate) fn clean_binlog_local(&self, end_index: i64) -> proto::CleanBinlogResponse {
        {
            let state = self.raft.lock().unwrap();
            if state.last_applied_index < end_index {
                tracing::warn!(
                    end_index,
                    last_applied = state.last_applied_index,
                    "refusing unsafe binlog clean"
                );
                return proto::CleanBinlogResponse { success: false };
            }
        }
        tracing::info!(end_index, "pruning binlog prefix");
        if let Err(e) = self.binlog.remove_prefix(end_index - 1) {
            tracing::warn!(error = %e, "binlog prune failed");
            return proto::CleanBinlogResponse { success: false };
        }
        proto::CleanBinlogResponse { success: true }
    }

    pub fn clean_binlog(&self, request: proto::CleanBinlogRequest) -> proto::CleanBinlogResponse {
        self.clean_binlog_local(request.end_index)
    }

    pub fn rpc_stat(&self, request: proto::RpcStatRequest) -> proto::RpcStatResponse {
        let ops: Vec<i32> = if request.op.is_empty() {
            (1..=8).collect()
        } else {
            request.op.clone()
        };
        let stats = ops
            .into_iter()
            .map(|id| {
                let (current_stat, average_stat) = match StatOp::from_wire(id) {
                    Some(op) => self.stats.report(op),
                    None => (0, 0),
                };
                proto::StatInfo {
                    current_stat,
                    average_stat,
                }
            })
            .collect();
        let status = self.raft.lock().unwrap().status.as_proto();
        proto::RpcStatResponse { stats, status }
    }

    // === Internals ===

    /// Append an entry, register its completion token under the new log
    /// index and wake replication; a single-node cluster commits on the
    /// spot.
    fn append_with_ack(&self, state: &mut RaftState, entry: LogEntry, ack: ClientAck) {
        let index = match self.binlog.append(&entry) {
            Ok(index) => index,
            Err(e) => apply::fatal("failed to append client entry", &e),
        };
        state.client_ack.insert(index, ack);
        self.replication_notify.notify_waiters();
        if self.single_node {
            self.update_commit_index(state, self.binlog.last_log_index());
        }
    }
}

//! Client session table
//!
//! Sessions are heartbeat leases: a keepalive upserts the session with
//! the current timestamp, the reaper sweeps everything whose last report
//! is older than the lease. The table keeps one authoritative by-id map
//! plus an ordered by-time set so the sweep never walks live sessions.

use crate::common::timestamp_micros;
use crate::server::apply;
use crate::server::node::{Node, NodeStatus};
use crate::storage::{LogEntry, LogOp};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub uuid: String,
    pub last_report_us: i64,
}

#[derive(Default)]
pub struct SessionTable {
    by_id: HashMap<String, Session>,
    by_time: BTreeSet<(i64, String)>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// Insert or refresh a session lease
    pub fn upsert(&mut self, session_id: &str, uuid: &str, now_us: i64) {
        if let Some(old) = self.by_id.get(session_id) {
            self.by_time
                .remove(&(old.last_report_us, session_id.to_string()));
        }
        self.by_time.insert((now_us, session_id.to_string()));
        self.by_id.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                uuid: uuid.to_string(),
                last_report_us: now_us,
            },
        );
    }

    pub fn lookup(&self, session_id: &str) -> Option<&Session> {
        self.by_id.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.by_id.contains_key(session_id)
    }

    /// Remove and return every session reported before `deadline_us`
    pub fn expired_before(&mut self, deadline_us: i64) -> Vec<Session> {
        let mut expired = Vec::new();
        while let Some((report_us, session_id)) = self.by_time.first().cloned() {
            if report_us >= deadline_us {
                break;
            }
            self.by_time.remove(&(report_us, session_id.clone()));
            if let Some(session) = self.by_id.remove(&session_id) {
                expired.push(session);
            }
        }
        expired
    }

    pub fn erase(&mut self, session_id: &str) {
        if let Some(old) = self.by_id.remove(session_id) {
            self.by_time
                .remove(&(old.last_report_us, session_id.to_string()));
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Every 2 s: drop sessions whose lease ran out, cancel their watches
/// and, on the leader, turn their locks and logins into Unlock/Logout
/// log entries so the whole cluster agrees on the cleanup.
pub(crate) async fn reaper_loop(node: Arc<Node>) {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let (current_term, is_leader) = {
            let state = node.raft.lock().unwrap();
            if state.stop {
                return;
            }
            (state.current_term, state.status == NodeStatus::Leader)
        };

        let deadline = timestamp_micros() - node.config.session_expire_timeout_us;
        let expired = node.sessions.lock().unwrap().expired_before(deadline);
        if expired.is_empty() {
            continue;
        }
        for session in &expired {
            tracing::info!(session_id = %session.session_id, "session expired");
        }

        {
            let mut watches = node.watches.lock().unwrap();
            for session in &expired {
                watches.remove_by_session(&session.session_id);
            }
        }

        let mut unlock_keys = Vec::new();
        {
            let mut session_locks = node.session_locks.lock().unwrap();
            for session in &expired {
                if let Some(keys) = session_locks.remove(&session.session_id) {
                    for key in keys {
                        unlock_keys.push((key, session.clone()));
                    }
                }
            }
        }

        if !is_leader {
            continue;
        }
        for (key, session) in &unlock_keys {
            let entry = LogEntry {
                op: LogOp::Unlock,
                user: node.users.username_from_uuid(&session.uuid),
                key: key.clone(),
                value: session.session_id.clone().into_bytes(),
                term: current_term,
            };
            if let Err(e) = node.binlog.append(&entry) {
                apply::fatal("failed to append reaper unlock", &e);
            }
        }
        for session in &expired {
            if session.uuid.is_empty() {
                continue;
            }
            let entry = LogEntry {
                op: LogOp::Logout,
                user: session.uuid.clone(),
                key: String::new(),
                value: Vec::new(),
                term: current_term,
            };
            if let Err(e) = node.binlog.append(&entry) {
                apply::fatal("failed to append reaper logout", &e);
            }
        }
        node.replication_notify.notify_waiters();
        if node.single_node {
            let mut state = node.raft.lock().unwrap();
            node.update_commit_index(&mut state, node.binlog.last_log_index());
        }
    }
}

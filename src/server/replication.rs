//! Leader-side replication: per-peer fan-out, heartbeats, binlog GC

use crate::proto;
use crate::server::node::{local_status, Node, NodeStatus};
use crate::server::{entry_to_proto, rpc};
use std::sync::Arc;
use std::time::Duration;

fn stop_replicating(node: &Node, follower_id: &str) {
    node.raft
        .lock()
        .unwrap()
        .replicating
        .remove(follower_id);
}

/// Push the log to one follower until leadership or the process ends.
/// Batches shrink to a single entry after a failure, `next_index` walks
/// back guided by the follower's log-length hint, and busy followers
/// get breathing room.
pub(crate) async fn replicate_loop(node: Arc<Node>, follower_id: String) {
    tracing::info!(peer = %follower_id, "start replicating log");
    let mut latest_replicating_ok = true;
    loop {
        // wait until there is something to send
        loop {
            let notified = node.replication_notify.notified();
            {
                let state = node.raft.lock().unwrap();
                if state.stop || state.status != NodeStatus::Leader {
                    drop(state);
                    stop_replicating(&node, &follower_id);
                    return;
                }
                let next = state.next_index.get(&follower_id).copied().unwrap_or(0);
                if node.binlog.length() > next {
                    break;
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(2000), notified).await;
        }

        // snapshot the batch under the lock, send it without
        let built = {
            let state = node.raft.lock().unwrap();
            if state.stop || state.status != NodeStatus::Leader {
                drop(state);
                stop_replicating(&node, &follower_id);
                return;
            }
            let index = state.next_index.get(&follower_id).copied().unwrap_or(0);
            let prev_log_index = index - 1;
            let prev_log_term = if prev_log_index >= 0 {
                match node.binlog.read(prev_log_index) {
                    Ok(entry) => entry.term,
                    Err(e) => {
                        tracing::warn!(peer = %follower_id, index = prev_log_index, error = %e,
                            "bad prev slot, cannot replicate");
                        drop(state);
                        stop_replicating(&node, &follower_id);
                        return;
                    }
                }
            } else {
                -1
            };
            let mut batch_span =
                (node.binlog.length() - index).min(node.config.log_rep_batch_max as i64);
            if !latest_replicating_ok {
                batch_span = batch_span.min(1);
            }
            let mut entries = Vec::with_capacity(batch_span as usize);
            let mut max_term = -1;
            let mut bad_slot = false;
            for idx in index..index + batch_span {
                match node.binlog.read(idx) {
                    Ok(entry) => {
                        max_term = max_term.max(entry.term);
                        entries.push(entry_to_proto(&entry));
                    }
                    Err(e) => {
                        tracing::warn!(peer = %follower_id, index = idx, error = %e, "bad slot");
                        bad_slot = true;
                        break;
                    }
                }
            }
            if bad_slot {
                drop(state);
                stop_replicating(&node, &follower_id);
                return;
            }
            let request = proto::AppendEntriesRequest {
                term: state.current_term,
                leader_id: node.self_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit_index: state.commit_index,
            };
            (request, index, batch_span, max_term)
        };
        let (request, index, batch_span, max_term) = built;

        let reply = rpc::append_entries(&follower_id, request).await;

        match reply {
            Ok(response) => {
                let mut state = node.raft.lock().unwrap();
                if response.current_term > state.current_term {
                    node.trans_to_follower(&mut state, "replication reply", response.current_term);
                }
                if state.stop || state.status != NodeStatus::Leader {
                    drop(state);
                    stop_replicating(&node, &follower_id);
                    return;
                }
                if response.success {
                    state
                        .next_index
                        .insert(follower_id.clone(), index + batch_span);
                    state
                        .match_index
                        .insert(follower_id.clone(), index + batch_span - 1);
                    // only current-term entries may advance the commit index
                    if max_term == state.current_term {
                        node.update_commit_index(&mut state, index + batch_span - 1);
                    }
                    latest_replicating_ok = true;
                } else if response.is_busy {
                    drop(state);
                    tracing::warn!(peer = %follower_id, "follower busy, delaying replication");
                    tokio::time::sleep(node.config.replication_retry_timespan()).await;
                    latest_replicating_ok = true;
                } else {
                    // (index, term) mismatch: walk back
                    let next = state.next_index.get(&follower_id).copied().unwrap_or(0);
                    let adjusted = (next - 1).min(response.log_length).max(0);
                    state.next_index.insert(follower_id.clone(), adjusted);
                    tracing::info!(peer = %follower_id, next_index = adjusted, "adjusted next index");
                }
            }
            Err(e) => {
                tracing::warn!(peer = %follower_id, error = %e, "replicate rpc failed");
                tokio::time::sleep(node.config.replication_retry_timespan()).await;
                latest_replicating_ok = false;
            }
        }
    }
}

/// 50 ms heartbeat broadcast while leader
pub(crate) async fn heartbeat_loop(node: Arc<Node>) {
    loop {
        let request = {
            let state = node.raft.lock().unwrap();
            if state.stop || state.status != NodeStatus::Leader {
                return;
            }
            proto::AppendEntriesRequest {
                term: state.current_term,
                leader_id: node.self_id.clone(),
                prev_log_index: -1,
                prev_log_term: -1,
                entries: Vec::new(),
                leader_commit_index: state.commit_index,
            }
        };
        for peer in node.peers.clone() {
            let node = node.clone();
            let request = request.clone();
            tokio::spawn(async move {
                if let Ok(response) = rpc::append_entries(&peer, request).await {
                    let mut state = node.raft.lock().unwrap();
                    if state.status == NodeStatus::Leader
                        && response.current_term > state.current_term
                    {
                        node.trans_to_follower(&mut state, "heartbeat reply", response.current_term);
                    }
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Binlog GC: the leader probes every member for its apply cursor and,
/// when the cluster-wide floor moves, tells everyone (itself included)
/// to prune below it. A member refuses bounds above its own cursor.
pub(crate) async fn gc_loop(node: Arc<Node>) {
    let interval = Duration::from_secs(node.config.gc_interval_secs.max(1));
    loop {
        tokio::time::sleep(interval).await;
        {
            let state = node.raft.lock().unwrap();
            if state.stop {
                return;
            }
            if state.status != NodeStatus::Leader {
                continue;
            }
        }

        let mut min_applied = i64::MAX;
        let mut all_replied = true;
        for member in &node.config.members {
            let applied = if *member == node.self_id {
                Some(local_status(&node).last_applied)
            } else {
                match rpc::show_status(member).await {
                    Ok(status) => Some(status.last_applied),
                    Err(e) => {
                        tracing::info!(member = %member, error = %e, "gc probe failed");
                        None
                    }
                }
            };
            match applied {
                Some(applied) => min_applied = min_applied.min(applied),
                None => {
                    all_replied = false;
                    break;
                }
            }
        }
        if !all_replied {
            continue;
        }

        let safe_clean_index = min_applied - 1;
        let changed = {
            let mut state = node.raft.lock().unwrap();
            let changed = state.last_safe_clean_index != safe_clean_index;
            state.last_safe_clean_index = safe_clean_index;
            changed
        };
        if !changed || safe_clean_index < 0 {
            continue;
        }
        tracing::info!(safe_clean_index, "[gc] pruning binlog prefix cluster-wide");
        for member in &node.config.members {
            if *member == node.self_id {
                let response = node.clean_binlog_local(safe_clean_index);
                if !response.success {
                    tracing::warn!("[gc] local binlog clean refused");
                }
            } else if let Err(e) = rpc::clean_binlog(member, safe_clean_index).await {
                tracing::info!(member = %member, error = %e, "[gc] clean request failed");
            }
        }
    }
}

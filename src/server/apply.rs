//! The apply loop: committed entries -> state machine
//!
//! A single task consumes entries strictly in log order; everything the
//! service exposes (data, locks, accounts, watch deliveries) is a
//! deterministic function of this sequence. The durable apply cursor is
//! written after each entry so a restarted node resumes exactly where it
//! stopped.

use crate::common::{bind_key_and_user, Error};
use crate::proto::OpStatus;
use crate::server::node::{Node, NodeStatus};
use crate::storage::store::{encode_tagged, ANONYMOUS_USER, TAG_LAST_APPLIED_INDEX};
use crate::storage::{LogEntry, LogOp};
use std::sync::Arc;

/// Persistence failures leave no safe way forward; stop the process
pub(crate) fn fatal(msg: &str, e: &Error) -> ! {
    tracing::error!(error = %e, "{}", msg);
    std::process::abort();
}

pub(crate) async fn apply_loop(node: Arc<Node>) {
    loop {
        let (from, to) = loop {
            {
                let state = node.raft.lock().unwrap();
                if state.stop {
                    return;
                }
                if state.commit_index > state.last_applied_index {
                    break (state.last_applied_index, state.commit_index);
                }
            }
            node.commit_notify.notified().await;
        };
        tracing::debug!(from = from + 1, to, "applying committed entries");
        for index in (from + 1)..=to {
            apply_one(&node, index);
        }
    }
}

/// Run a data-store mutation; on `UnknownUser` open the namespace and
/// retry once. Any other failure is fatal.
pub(crate) fn with_namespace_retry(
    node: &Node,
    user: &str,
    mut op: impl FnMut() -> crate::Result<()>,
) {
    match op() {
        Ok(()) => {}
        Err(Error::UnknownUser(_)) => {
            if let Err(e) = node.data_store.open_namespace(user) {
                fatal("failed to open namespace during apply", &e);
            }
            if let Err(e) = op() {
                fatal("apply retry failed after opening namespace", &e);
            }
        }
        Err(e) => fatal("data store mutation failed during apply", &e),
    }
}

fn apply_one(node: &Arc<Node>, index: i64) {
    let entry = match node.binlog.read(index) {
        Ok(entry) => entry,
        Err(e) => fatal("committed slot is unreadable", &e),
    };

    let mut nop_of_current_term = false;
    let mut log_status = OpStatus::Error;
    let mut new_uuid = String::new();

    match entry.op {
        LogOp::Put | LogOp::Lock => {
            let tagged = encode_tagged(entry.op, &entry.value);
            with_namespace_retry(node, &entry.user, || {
                node.data_store.put(&entry.user, &entry.key, &tagged)
            });
            if entry.op == LogOp::Lock {
                node.touch_parent_key(&entry.user, &entry.key, &entry.value, "lock");
                let session = String::from_utf8_lossy(&entry.value).into_owned();
                node.session_locks
                    .lock()
                    .unwrap()
                    .entry(session)
                    .or_default()
                    .insert(entry.key.clone());
            }
            node.enqueue_event(
                bind_key_and_user(&entry.user, &entry.key),
                entry.value.clone(),
                false,
            );
        }
        LogOp::Del => {
            with_namespace_retry(node, &entry.user, || {
                node.data_store.delete(&entry.user, &entry.key)
            });
            node.enqueue_event(
                bind_key_and_user(&entry.user, &entry.key),
                entry.value.clone(),
                true,
            );
        }
        LogOp::Unlock => {
            apply_unlock(node, &entry);
        }
        LogOp::Nop => {
            let state = node.raft.lock().unwrap();
            nop_of_current_term = entry.term == state.current_term;
        }
        LogOp::Login => {
            log_status = node.users.login(
                &entry.key,
                &String::from_utf8_lossy(&entry.value),
                &entry.user,
            );
            if log_status == OpStatus::Ok {
                new_uuid = entry.user.clone();
                if let Err(e) = node.data_store.open_namespace(&entry.key) {
                    fatal("failed to open namespace on login", &e);
                }
            }
        }
        LogOp::Logout => {
            log_status = node.users.logout(&entry.user);
        }
        LogOp::Register => {
            log_status = node
                .users
                .register(&entry.key, &String::from_utf8_lossy(&entry.value));
        }
    }

    let mut state = node.raft.lock().unwrap();
    if state.status == NodeStatus::Leader && nop_of_current_term && state.in_safe_mode {
        state.in_safe_mode = false;
        tracing::info!(term = state.current_term, "own nop committed, leaving safe mode");
    }
    if state.status == NodeStatus::Leader {
        if let Some(ack) = state.client_ack.remove(&index) {
            ack.complete(log_status, &new_uuid);
        }
    }
    state.last_applied_index = index;
    // the durable cursor advances alone; side effects above are idempotent
    // on replay up to this index
    if let Err(e) = node.data_store.put(
        ANONYMOUS_USER,
        TAG_LAST_APPLIED_INDEX,
        &index.to_ne_bytes(),
    ) {
        fatal("failed to persist apply cursor", &e);
    }
}

/// Delete-if-held-by: the key must still be a Lock owned by the session
/// named in the entry, otherwise the unlock is a no-op
fn apply_unlock(node: &Arc<Node>, entry: &LogEntry) {
    use crate::storage::store::decode_tagged;
    let raw = match node.data_store.get(&entry.user, &entry.key) {
        Ok(raw) => raw,
        Err(Error::NotFound(_)) | Err(Error::UnknownUser(_)) => return,
        Err(e) => fatal("data store read failed during unlock", &e),
    };
    let held_by_session = match decode_tagged(&raw) {
        Ok((LogOp::Lock, session)) => session == entry.value.as_slice(),
        Ok(_) => false,
        Err(e) => {
            tracing::warn!(key = %entry.key, error = %e, "unlock hit undecodable value");
            false
        }
    };
    if !held_by_session {
        return;
    }
    with_namespace_retry(node, &entry.user, || {
        node.data_store.delete(&entry.user, &entry.key)
    });
    tracing::info!(key = %entry.key, "unlocked");
    node.touch_parent_key(&entry.user, &entry.key, &entry.value, "unlock");
    node.enqueue_event(
        bind_key_and_user(&entry.user, &entry.key),
        entry.value.clone(),
        true,
    );
}

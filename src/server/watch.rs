//! One-shot watch table
//!
//! Watches are keyed by the namespace-bound key (`user::key`) and by the
//! owning session. Each entry holds the response channel of a parked
//! Watch RPC and fires at most once: on delivery, cancellation, or
//! session expiry the entry is removed together with its reply channel.

use crate::common::key_from_event;
use crate::proto::WatchResponse;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::oneshot;

pub struct WatchTable {
    /// (watch_key, session_id) -> reply channel
    by_key: BTreeMap<(String, String), oneshot::Sender<WatchResponse>>,
    /// session_id -> watch keys registered by that session
    by_session: HashMap<String, HashSet<String>>,
}

fn fired(watch_key: &str, key: &str, value: &[u8], deleted: bool) -> WatchResponse {
    WatchResponse {
        success: true,
        leader_id: String::new(),
        watch_key: key_from_event(watch_key).to_string(),
        key: key_from_event(key).to_string(),
        value: value.to_vec(),
        deleted,
        canceled: false,
        uuid_expired: false,
    }
}

fn canceled() -> WatchResponse {
    WatchResponse {
        success: true,
        canceled: true,
        ..Default::default()
    }
}

impl WatchTable {
    pub fn new() -> WatchTable {
        WatchTable {
            by_key: BTreeMap::new(),
            by_session: HashMap::new(),
        }
    }

    /// Register a waiter. An existing watch for the same
    /// `(session, watch_key)` pair is canceled first.
    pub fn insert(
        &mut self,
        watch_key: &str,
        session_id: &str,
        sender: oneshot::Sender<WatchResponse>,
    ) {
        let slot = (watch_key.to_string(), session_id.to_string());
        if let Some(old) = self.by_key.remove(&slot) {
            let _ = old.send(canceled());
        }
        self.by_key.insert(slot, sender);
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(watch_key.to_string());
    }

    /// Deliver to every waiter on `watch_key`; returns whether any fired
    pub fn fire_by_key(&mut self, watch_key: &str, key: &str, value: &[u8], deleted: bool) -> bool {
        let sessions: Vec<String> = self
            .by_key
            .range((watch_key.to_string(), String::new())..)
            .take_while(|((k, _), _)| k == watch_key)
            .map(|((_, session_id), _)| session_id.clone())
            .collect();
        for session_id in &sessions {
            if let Some(sender) = self
                .by_key
                .remove(&(watch_key.to_string(), session_id.clone()))
            {
                self.unindex(session_id, watch_key);
                let _ = sender.send(fired(watch_key, key, value, deleted));
            }
        }
        !sessions.is_empty()
    }

    /// Deliver to one specific `(session, key)` waiter, if registered
    pub fn fire_by_session_and_key(
        &mut self,
        session_id: &str,
        watch_key: &str,
        value: &[u8],
        deleted: bool,
    ) {
        if let Some(sender) = self
            .by_key
            .remove(&(watch_key.to_string(), session_id.to_string()))
        {
            self.unindex(session_id, watch_key);
            let _ = sender.send(fired(watch_key, watch_key, value, deleted));
        }
    }

    /// Cancel every watch of an expired session
    pub fn remove_by_session(&mut self, session_id: &str) {
        if let Some(keys) = self.by_session.remove(session_id) {
            for watch_key in keys {
                if let Some(sender) = self
                    .by_key
                    .remove(&(watch_key, session_id.to_string()))
                {
                    let _ = sender.send(canceled());
                }
            }
        }
    }

    fn unindex(&mut self, session_id: &str, watch_key: &str) {
        if let Some(keys) = self.by_session.get_mut(session_id) {
            keys.remove(watch_key);
            if keys.is_empty() {
                self.by_session.remove(session_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl Default for WatchTable {
    fn default() -> Self {
        Self::new()
    }
}

//! Utility functions for lockstep

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in microseconds
pub fn timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Parent of a directory-style key: everything up to the last `/`.
/// `None` when the key has no separator.
pub fn parent_key(key: &str) -> Option<&str> {
    key.rfind('/').map(|idx| &key[..idx])
}

/// Bind a key to its owning namespace for watch routing
pub fn bind_key_and_user(user: &str, key: &str) -> String {
    format!("{}::{}", user, key)
}

/// Strip the namespace binding off a watch-event key
pub fn key_from_event(event_key: &str) -> &str {
    match event_key.find("::") {
        Some(idx) => &event_key[idx + 2..],
        None => event_key,
    }
}

/// Make an endpoint usable as a directory name (`host:port` → `host_port`)
pub fn sanitize_server_id(endpoint: &str) -> String {
    endpoint.replace(':', "_")
}

/// Split a comma-separated member list, dropping empty items
pub fn parse_members(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

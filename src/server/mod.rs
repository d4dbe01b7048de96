//! The node implementation: Raft core, apply loop, request handlers
//!
//! Responsibilities:
//! - Leader election and log replication across the fixed membership
//! - Applying committed entries to the data store in log order
//! - Client sessions (keepalive, expiry, lock leases)
//! - One-shot watches with parent-key fan-out
//! - The gRPC surface translating wire requests into all of the above

pub mod apply;
pub mod grpc;
pub mod handlers;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod session;
pub mod stats;
pub mod users;
pub mod watch;

use crate::common::{Error, Result};
use crate::proto;
use crate::storage::{LogEntry, LogOp};

pub use grpc::serve;
pub use node::Node;

pub(crate) fn entry_to_proto(entry: &LogEntry) -> proto::Entry {
    proto::Entry {
        op: entry.op as i32,
        user: entry.user.clone(),
        key: entry.key.clone(),
        value: entry.value.clone(),
        term: entry.term,
    }
}

pub(crate) fn entry_from_proto(entry: &proto::Entry) -> Result<LogEntry> {
    let op = u8::try_from(entry.op)
        .ok()
        .and_then(LogOp::from_u8)
        .ok_or_else(|| Error::Corrupted(format!("bad op in wire entry: {}", entry.op)))?;
    Ok(LogEntry {
        op,
        user: entry.user.clone(),
        key: entry.key.clone(),
        value: entry.value.clone(),
        term: entry.term,
    })
}

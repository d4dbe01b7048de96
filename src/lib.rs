//! # lockstep
//!
//! A small, strongly consistent coordination service:
//! - Replicated key-value store over a fixed-membership Raft cluster
//! - Advisory locks leased to client sessions
//! - One-shot watches with directory-style parent notification
//! - Authenticated per-user namespaces
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │               Cluster (gRPC)               │
//! │   - Leader: linearizes writes via binlog   │
//! │   - Followers: replicate + hot standby     │
//! └──────┬──────────────┬──────────────┬───────┘
//!        │              │              │
//!  ┌─────▼────┐   ┌─────▼────┐   ┌─────▼────┐
//!  │ node 1   │   │ node 2   │   │ node 3   │
//!  │ binlog + │   │ binlog + │   │ binlog + │
//!  │ data dbs │   │ data dbs │   │ data dbs │
//!  └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! Clients may contact any node; non-leaders answer with the current
//! leader id so the client can redirect. Every mutation flows through
//! the replicated binlog and is applied in log order on each member.

pub mod common;
pub mod server;
pub mod storage;

pub use common::{Config, Error, Result};
pub use server::node::Node;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("lockstep");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Protocol-level tests driving Vote and AppendEntries directly,
//! without transport: log matching, truncation walk-back, stale-vote
//! rejection and follower backpressure

use lockstep::proto;
use lockstep::{Config, Node};
use std::sync::Arc;
use tempfile::TempDir;

const LEADER_A: &str = "127.0.0.1:43001";

/// A follower from a three-member cluster; never started, so no timers
/// interfere with the hand-driven protocol exchange
fn follower(data: &TempDir, binlog: &TempDir, max_commit_pending: i64) -> Arc<Node> {
    let config = Config {
        members: vec![
            LEADER_A.to_string(),
            "127.0.0.1:43002".to_string(),
            "127.0.0.1:43003".to_string(),
        ],
        server_id: 2,
        data_dir: data.path().to_path_buf(),
        binlog_dir: binlog.path().to_path_buf(),
        max_commit_pending,
        ..Config::default()
    };
    Node::open(config).unwrap()
}

fn put_entry(key: &str, term: i64) -> proto::Entry {
    proto::Entry {
        op: proto::LogOp::Put as i32,
        user: String::new(),
        key: key.to_string(),
        value: b"v".to_vec(),
        term,
    }
}

fn append(
    term: i64,
    prev_log_index: i64,
    prev_log_term: i64,
    entries: Vec<proto::Entry>,
    leader_commit_index: i64,
) -> proto::AppendEntriesRequest {
    proto::AppendEntriesRequest {
        term,
        leader_id: LEADER_A.to_string(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit_index,
    }
}

#[tokio::test]
async fn stale_candidate_log_is_refused() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = follower(&data, &binlog, 10_000);

    // seed the follower with one term-2 entry
    let seeded = node
        .handle_append_entries(append(2, -1, -1, vec![put_entry("/a", 2)], -1))
        .await;
    assert!(seeded.success);

    // candidate whose last log term is behind: refused, term untouched
    let stale = node.handle_vote(proto::VoteRequest {
        term: 3,
        candidate_id: "127.0.0.1:43003".to_string(),
        last_log_index: 5,
        last_log_term: 1,
    });
    assert!(!stale.vote_granted);
    assert_eq!(stale.term, 2);

    // up-to-date candidate: granted, newer term adopted
    let fresh = node.handle_vote(proto::VoteRequest {
        term: 3,
        candidate_id: "127.0.0.1:43003".to_string(),
        last_log_index: 0,
        last_log_term: 2,
    });
    assert!(fresh.vote_granted);
    assert_eq!(fresh.term, 3);

    // one vote per term
    let rival = node.handle_vote(proto::VoteRequest {
        term: 3,
        candidate_id: LEADER_A.to_string(),
        last_log_index: 7,
        last_log_term: 2,
    });
    assert!(!rival.vote_granted);

    // the same candidate asking again keeps its grant
    let repeat = node.handle_vote(proto::VoteRequest {
        term: 3,
        candidate_id: "127.0.0.1:43003".to_string(),
        last_log_index: 0,
        last_log_term: 2,
    });
    assert!(repeat.vote_granted);
}

#[tokio::test]
async fn divergent_log_truncates_and_converges() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = follower(&data, &binlog, 10_000);

    // three term-1 entries from the old leader
    let seeded = node
        .handle_append_entries(append(
            1,
            -1,
            -1,
            vec![put_entry("/k0", 1), put_entry("/k1", 1), put_entry("/k2", 1)],
            -1,
        ))
        .await;
    assert!(seeded.success);
    assert_eq!(seeded.log_length, 3);

    // new leader far ahead: prev beyond our log, refused with a hint
    let beyond = node
        .handle_append_entries(append(3, 5, 3, vec![put_entry("/k6", 3)], -1))
        .await;
    assert!(!beyond.success);
    assert_eq!(beyond.log_length, 3);

    // walk back to index 2: term conflict, we truncate strictly before it
    let conflict = node
        .handle_append_entries(append(3, 2, 2, vec![put_entry("/k3", 3)], -1))
        .await;
    assert!(!conflict.success);
    assert_eq!(conflict.log_length, 2);

    // prev (1, term 1) matches: divergent tail replaced
    let converged = node
        .handle_append_entries(append(
            3,
            1,
            1,
            vec![put_entry("/k2b", 3), put_entry("/k3b", 3)],
            -1,
        ))
        .await;
    assert!(converged.success);
    assert_eq!(converged.log_length, 4);

    // heartbeat commits the common prefix
    let committed = node.handle_append_entries(append(3, -1, -1, vec![], 3)).await;
    assert!(committed.success);
    let status = node.show_status();
    assert_eq!(status.commit_index, 3);
    assert_eq!(status.last_log_index, 3);
    assert_eq!(status.term, 3);
}

#[tokio::test]
async fn stale_leader_term_is_refused() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = follower(&data, &binlog, 10_000);

    let adopt = node.handle_append_entries(append(5, -1, -1, vec![], -1)).await;
    assert!(adopt.success);
    assert_eq!(adopt.current_term, 5);

    let stale = node
        .handle_append_entries(append(4, -1, -1, vec![put_entry("/x", 4)], -1))
        .await;
    assert!(!stale.success);
    assert_eq!(stale.current_term, 5);
    assert!(!stale.is_busy);
}

#[tokio::test]
async fn overloaded_follower_reports_busy() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    // apply loop is not running and max_commit_pending is zero, so any
    // committed-but-unapplied entry makes the next batch bounce
    let node = follower(&data, &binlog, 0);

    let first = node
        .handle_append_entries(append(1, -1, -1, vec![put_entry("/a", 1)], -1))
        .await;
    assert!(first.success);

    let second = node
        .handle_append_entries(append(1, 0, 1, vec![put_entry("/b", 1)], 0))
        .await;
    assert!(second.success);

    let throttled = node
        .handle_append_entries(append(1, 1, 1, vec![put_entry("/c", 1)], 1))
        .await;
    assert!(!throttled.success);
    assert!(throttled.is_busy);
}

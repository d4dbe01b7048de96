//! Lock leases, session expiry and watch delivery on a single node

use lockstep::proto;
use lockstep::{Config, Node};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(data: &TempDir, binlog: &TempDir, port: u16) -> Config {
    Config {
        members: vec![format!("127.0.0.1:{}", port)],
        server_id: 1,
        data_dir: data.path().to_path_buf(),
        binlog_dir: binlog.path().to_path_buf(),
        // short lease so the startup safe window and expiry are testable
        session_expire_timeout_us: 500_000,
        gc_interval_secs: 60,
        ..Config::default()
    }
}

async fn ready_node(config: Config) -> Arc<Node> {
    let node = Node::open(config).unwrap();
    Node::start(&node);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = node.show_status();
        if status.status == proto::NodeStatus::Leader as i32 && status.last_applied >= 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no self promotion");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // locks and scans stay rejected until one full lease has passed
    tokio::time::sleep(Duration::from_millis(600)).await;
    node
}

fn keep_alive(node: &Node, session_id: &str, locks: &[&str]) -> proto::KeepAliveResponse {
    node.keep_alive(proto::KeepAliveRequest {
        uuid: String::new(),
        session_id: session_id.to_string(),
        locks: locks.iter().map(|l| l.to_string()).collect(),
        forward_from_leader: false,
    })
}

async fn lock(node: &Node, key: &str, session_id: &str) -> proto::LockResponse {
    node.lock(proto::LockRequest {
        uuid: String::new(),
        key: key.to_string(),
        session_id: session_id.to_string(),
    })
    .await
}

#[tokio::test]
async fn lock_reentry_and_contention() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = ready_node(config(&data, &binlog, 17101)).await;

    assert!(keep_alive(&node, "s1", &[]).success);
    assert!(keep_alive(&node, "s2", &[]).success);

    assert!(lock(&node, "/locks/job", "s1").await.success);
    // re-entry by the owner is allowed
    assert!(lock(&node, "/locks/job", "s1").await.success);
    // another live session is refused
    assert!(!lock(&node, "/locks/job", "s2").await.success);

    // a dead session cannot take locks at all
    assert!(!lock(&node, "/locks/other", "ghost").await.success);

    node.shutdown();
}

#[tokio::test]
async fn unlock_requires_owning_session() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = ready_node(config(&data, &binlog, 17102)).await;

    assert!(keep_alive(&node, "s1", &[]).success);
    assert!(lock(&node, "/locks/a", "s1").await.success);

    // unlock naming the wrong session commits but changes nothing
    let foreign = node
        .unlock(proto::UnlockRequest {
            uuid: String::new(),
            key: "/locks/a".to_string(),
            session_id: "s2".to_string(),
        })
        .await;
    assert!(foreign.success);
    assert!(keep_alive(&node, "s1", &["/locks/a"]).success);
    let still_held = node
        .get(proto::GetRequest {
            uuid: String::new(),
            key: "/locks/a".to_string(),
        })
        .await;
    assert!(still_held.hit);

    let owner = node
        .unlock(proto::UnlockRequest {
            uuid: String::new(),
            key: "/locks/a".to_string(),
            session_id: "s1".to_string(),
        })
        .await;
    assert!(owner.success);
    let released = node
        .get(proto::GetRequest {
            uuid: String::new(),
            key: "/locks/a".to_string(),
        })
        .await;
    assert!(!released.hit);

    node.shutdown();
}

#[tokio::test]
async fn watch_fires_immediately_on_stale_snapshot() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = ready_node(config(&data, &binlog, 17103)).await;

    assert!(
        node.put(proto::PutRequest {
            uuid: String::new(),
            key: "/state".to_string(),
            value: b"v2".to_vec(),
        })
        .await
        .success
    );
    keep_alive(&node, "w1", &[]);

    // the caller believes the key does not exist: corrected on the spot
    let fired = tokio::time::timeout(
        Duration::from_secs(2),
        node.watch(proto::WatchRequest {
            uuid: String::new(),
            key: "/state".to_string(),
            session_id: "w1".to_string(),
            old_value: Vec::new(),
            key_exist: false,
        }),
    )
    .await
    .expect("watch should fire immediately");
    assert!(fired.success);
    assert_eq!(fired.value, b"v2");
    assert!(!fired.deleted);

    node.shutdown();
}

#[tokio::test]
async fn expired_session_releases_locks_and_fires_watches() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = ready_node(config(&data, &binlog, 17104)).await;

    assert!(keep_alive(&node, "s1", &[]).success);
    assert!(lock(&node, "/locks/lease", "s1").await.success);

    // an observer session kept alive by a background heartbeat
    {
        let node = node.clone();
        tokio::spawn(async move {
            loop {
                keep_alive(&node, "observer", &[]);
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
        });
    }

    let watch = {
        let node = node.clone();
        tokio::spawn(async move {
            node.watch(proto::WatchRequest {
                uuid: String::new(),
                key: "/locks/lease".to_string(),
                session_id: "observer".to_string(),
                old_value: b"s1".to_vec(),
                key_exist: true,
            })
            .await
        })
    };

    // s1 stops reporting; the reaper appends the unlock once the lease
    // runs out and the watcher sees the deletion
    let fired = tokio::time::timeout(Duration::from_secs(6), watch)
        .await
        .expect("watch should fire after lease expiry")
        .unwrap();
    assert!(fired.success);
    assert!(fired.deleted);

    let released = node
        .get(proto::GetRequest {
            uuid: String::new(),
            key: "/locks/lease".to_string(),
        })
        .await;
    assert!(released.success);
    assert!(!released.hit);

    node.shutdown();
}

#[tokio::test]
async fn scan_skips_expired_lock_holders() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = ready_node(config(&data, &binlog, 17105)).await;

    assert!(keep_alive(&node, "s1", &[]).success);
    assert!(
        node.put(proto::PutRequest {
            uuid: String::new(),
            key: "/data/plain".to_string(),
            value: b"x".to_vec(),
        })
        .await
        .success
    );
    assert!(lock(&node, "/data/lease", "s1").await.success);

    let scan = node.scan(proto::ScanRequest {
        uuid: String::new(),
        start_key: "/data/".to_string(),
        end_key: "/data/z".to_string(),
        size_limit: 100,
    });
    assert!(scan.success);
    let keys: Vec<&str> = scan.items.iter().map(|i| i.key.as_str()).collect();
    assert!(keys.contains(&"/data/lease"));
    assert!(keys.contains(&"/data/plain"));

    // once s1's lease lapses the lock key disappears from scans
    tokio::time::sleep(Duration::from_millis(700)).await;
    let scan = node.scan(proto::ScanRequest {
        uuid: String::new(),
        start_key: "/data/".to_string(),
        end_key: "/data/z".to_string(),
        size_limit: 100,
    });
    assert!(scan.success);
    let keys: Vec<&str> = scan.items.iter().map(|i| i.key.as_str()).collect();
    assert!(!keys.contains(&"/data/lease"));
    assert!(keys.contains(&"/data/plain"));

    node.shutdown();
}

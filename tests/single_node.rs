//! Single-node end-to-end tests: self-promotion, write round-trips,
//! accounts, restart recovery and binlog GC bounds

use lockstep::proto;
use lockstep::{Config, Node};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn single_node_config(data: &TempDir, binlog: &TempDir, port: u16) -> Config {
    Config {
        members: vec![format!("127.0.0.1:{}", port)],
        server_id: 1,
        data_dir: data.path().to_path_buf(),
        binlog_dir: binlog.path().to_path_buf(),
        session_expire_timeout_us: 500_000,
        gc_interval_secs: 1,
        ..Config::default()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn started_node(config: Config) -> Arc<Node> {
    let node = Node::open(config).unwrap();
    Node::start(&node);
    // leader once its own nop commits and applies
    wait_until("self promotion", Duration::from_secs(3), || {
        let status = node.show_status();
        status.status == proto::NodeStatus::Leader as i32 && status.last_applied >= 0
    })
    .await;
    node
}

fn put_request(key: &str, value: &str) -> proto::PutRequest {
    proto::PutRequest {
        uuid: String::new(),
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }
}

fn get_request(key: &str) -> proto::GetRequest {
    proto::GetRequest {
        uuid: String::new(),
        key: key.to_string(),
    }
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = started_node(single_node_config(&data, &binlog, 17001)).await;

    let put = node.put(put_request("/app/config", "v1")).await;
    assert!(put.success);

    let get = node.get(get_request("/app/config")).await;
    assert!(get.success);
    assert!(get.hit);
    assert_eq!(get.value, b"v1");

    let missing = node.get(get_request("/app/other")).await;
    assert!(missing.success);
    assert!(!missing.hit);

    let del = node
        .delete(proto::DelRequest {
            uuid: String::new(),
            key: "/app/config".to_string(),
        })
        .await;
    assert!(del.success);
    let gone = node.get(get_request("/app/config")).await;
    assert!(gone.success);
    assert!(!gone.hit);

    node.shutdown();
}

#[tokio::test]
async fn unstarted_node_redirects_clients() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = Node::open(single_node_config(&data, &binlog, 17002)).unwrap();

    // still a follower with no known leader
    let put = node.put(put_request("/k", "v")).await;
    assert!(!put.success);
    assert!(put.leader_id.is_empty());

    let get = node.get(get_request("/k")).await;
    assert!(!get.success);
}

#[tokio::test]
async fn register_login_namespaces() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = started_node(single_node_config(&data, &binlog, 17003)).await;

    let registered = node
        .register(proto::RegisterRequest {
            username: "alice".to_string(),
            passwd: "pw".to_string(),
        })
        .await;
    assert_eq!(registered.status, proto::OpStatus::Ok as i32);

    let wrong = node
        .login(proto::LoginRequest {
            username: "alice".to_string(),
            passwd: "nope".to_string(),
        })
        .await;
    assert_eq!(wrong.status, proto::OpStatus::PasswordError as i32);

    let unknown = node
        .login(proto::LoginRequest {
            username: "bob".to_string(),
            passwd: "pw".to_string(),
        })
        .await;
    assert_eq!(unknown.status, proto::OpStatus::UnknownUser as i32);

    let login = node
        .login(proto::LoginRequest {
            username: "alice".to_string(),
            passwd: "pw".to_string(),
        })
        .await;
    assert_eq!(login.status, proto::OpStatus::Ok as i32);
    let uuid = login.uuid;
    assert!(!uuid.is_empty());

    // writes land in alice's namespace, invisible to anonymous readers
    let put = node
        .put(proto::PutRequest {
            uuid: uuid.clone(),
            key: "/private".to_string(),
            value: b"mine".to_vec(),
        })
        .await;
    assert!(put.success);
    let mine = node
        .get(proto::GetRequest {
            uuid: uuid.clone(),
            key: "/private".to_string(),
        })
        .await;
    assert!(mine.hit);
    assert_eq!(mine.value, b"mine");
    let anonymous = node.get(get_request("/private")).await;
    assert!(!anonymous.hit);

    let logout = node.logout(proto::LogoutRequest { uuid: uuid.clone() }).await;
    assert_eq!(logout.status, proto::OpStatus::Ok as i32);
    let expired = node
        .get(proto::GetRequest {
            uuid,
            key: "/private".to_string(),
        })
        .await;
    assert!(expired.uuid_expired);

    node.shutdown();
}

#[tokio::test]
async fn restart_recovers_applied_state() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let config = single_node_config(&data, &binlog, 17004);

    let applied = {
        let node = started_node(config.clone()).await;
        assert!(node.put(put_request("/durable", "survives")).await.success);
        let applied = node.show_status().last_applied;
        node.shutdown();
        drop(node);
        applied
    };
    // background tasks release storage within one reaper period
    tokio::time::sleep(Duration::from_millis(2600)).await;

    let node = started_node(config).await;
    wait_until("replay and fresh nop", Duration::from_secs(3), || {
        node.show_status().last_applied > applied
    })
    .await;

    let get = node.get(get_request("/durable")).await;
    assert!(get.hit);
    assert_eq!(get.value, b"survives");
    node.shutdown();
}

#[tokio::test]
async fn binlog_gc_respects_applied_bound() {
    let (data, binlog) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node = started_node(single_node_config(&data, &binlog, 17005)).await;

    for i in 0..4 {
        assert!(node.put(put_request(&format!("/k{}", i), "v")).await.success);
    }
    let status = node.show_status();
    assert!(status.last_applied >= 4);

    let refused = node.clean_binlog(proto::CleanBinlogRequest { end_index: 1000 });
    assert!(!refused.success);

    let accepted = node.clean_binlog(proto::CleanBinlogRequest {
        end_index: status.last_applied,
    });
    assert!(accepted.success);

    // the log tail and live data stay intact
    let after = node.show_status();
    assert_eq!(after.last_log_index, status.last_log_index);
    let get = node.get(get_request("/k3")).await;
    assert!(get.hit);

    node.shutdown();
}

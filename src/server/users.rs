//! User accounts and login state
//!
//! The user manager is a pure function of applied log entries: every
//! replica applies the same Register/Login/Logout sequence and ends up
//! with the same account table. Account records are persisted in the
//! anonymous namespace under the `#USER#` prefix; the login table is
//! in-memory only and rebuilt through keepalives after a restart.
//!
//! UUIDs are derived deterministically from the username (v5 UUID), so a
//! Login entry minted on the leader names the same namespace on every
//! replica. The password digest is deterministic as well; a salted hash
//! would make replicas diverge bit-for-bit.

use crate::proto::OpStatus;
use crate::storage::store::{ANONYMOUS_USER, USER_RECORD_PREFIX};
use crate::storage::DataStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

struct Inner {
    /// username -> password digest
    users: HashMap<String, String>,
    /// uuid -> username
    logged_in: HashMap<String, String>,
}

pub struct UserManager {
    store: Arc<DataStore>,
    inner: RwLock<Inner>,
}

impl UserManager {
    /// Rebuild the account table from the data store; seed the root user
    /// from the credential record when present.
    pub fn load(store: Arc<DataStore>, root: Option<(String, String)>) -> crate::Result<UserManager> {
        let mut users = HashMap::new();
        store.scan(ANONYMOUS_USER, USER_RECORD_PREFIX, "", |key, value| {
            if let Some(username) = key.strip_prefix(USER_RECORD_PREFIX) {
                users.insert(
                    username.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
                true
            } else {
                false
            }
        })?;
        if let Some((username, passwd)) = root {
            tracing::info!(username = %username, "loaded root credential");
            users.insert(username.clone(), Self::digest(&username, &passwd));
        }
        tracing::info!(count = users.len(), "loaded user accounts");
        Ok(UserManager {
            store,
            inner: RwLock::new(Inner {
                users,
                logged_in: HashMap::new(),
            }),
        })
    }

    /// Deterministic UUID for a username, identical on every replica
    pub fn calc_uuid(username: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, username.as_bytes()).to_string()
    }

    fn digest(username: &str, passwd: &str) -> String {
        blake3::hash(format!("{}:{}", username, passwd).as_bytes()).to_string()
    }

    pub fn register(&self, username: &str, passwd: &str) -> OpStatus {
        if username.is_empty() {
            return OpStatus::Error;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.users.contains_key(username) {
            return OpStatus::UserExists;
        }
        let digest = Self::digest(username, passwd);
        let record_key = format!("{}{}", USER_RECORD_PREFIX, username);
        if let Err(e) = self
            .store
            .put(ANONYMOUS_USER, &record_key, digest.as_bytes())
        {
            tracing::error!(username = %username, error = %e, "failed to persist user record");
            return OpStatus::Error;
        }
        inner.users.insert(username.to_string(), digest);
        OpStatus::Ok
    }

    pub fn login(&self, username: &str, passwd: &str, uuid: &str) -> OpStatus {
        let mut inner = self.inner.write().unwrap();
        match inner.users.get(username) {
            None => OpStatus::UnknownUser,
            Some(stored) if *stored != Self::digest(username, passwd) => OpStatus::PasswordError,
            Some(_) => {
                inner
                    .logged_in
                    .insert(uuid.to_string(), username.to_string());
                OpStatus::Ok
            }
        }
    }

    pub fn logout(&self, uuid: &str) -> OpStatus {
        match self.inner.write().unwrap().logged_in.remove(uuid) {
            Some(_) => OpStatus::Ok,
            None => OpStatus::UnknownUser,
        }
    }

    pub fn is_logged_in(&self, uuid: &str) -> bool {
        self.inner.read().unwrap().logged_in.contains_key(uuid)
    }

    pub fn is_valid_user(&self, username: &str) -> bool {
        self.inner.read().unwrap().users.contains_key(username)
    }

    /// Namespace owning a uuid's data; the anonymous namespace for an
    /// empty or unknown uuid
    pub fn username_from_uuid(&self, uuid: &str) -> String {
        self.inner
            .read()
            .unwrap()
            .logged_in
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }
}

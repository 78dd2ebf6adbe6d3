use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Per-key serialization shared by the consumer and the command layer.
///
/// Work for one (user, server) pair runs one at a time. Server-wide
/// recomputation (subscription changes) takes the server lock exclusively,
/// while per-user work holds it shared, so no user update interleaves with a
/// recomputation of the same server.
#[derive(Default)]
pub struct KeyedLocks {
    servers: DashMap<String, Arc<RwLock<()>>>,
    members: DashMap<(String, String), Arc<Mutex<()>>>,
}

/// Guard for per-user work. Dropping it releases both locks.
pub struct MemberGuard {
    _member: OwnedMutexGuard<()>,
    _server: OwnedRwLockReadGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn server_lock(&self, server_id: &str) -> Arc<RwLock<()>> {
        self.servers
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Lock one (user, server) pair
    pub async fn lock_member(&self, user_id: &str, server_id: &str) -> MemberGuard {
        let server = self.server_lock(server_id).read_owned().await;
        let member = self
            .members
            .entry((user_id.to_string(), server_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        MemberGuard {
            _member: member.lock_owned().await,
            _server: server,
        }
    }

    /// Lock a whole server, excluding all per-user work on it
    pub async fn lock_server(&self, server_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.server_lock(server_id).write_owned().await
    }

    /// Drop lock entries nobody is holding or waiting on
    pub fn prune(&self) {
        self.members.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.servers.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.servers.len() + self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

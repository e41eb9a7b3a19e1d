//! Ephemeral per-inode process state.
//!
//! Reads, writes and syncs are the three processes that can conflict on an
//! inode; their states, and the sync-owner tuple, live in a key-value store
//! with a TTL so a crashed owner's locks expire on their own. Updates go
//! through a compare-and-set so concurrent owners cannot both win.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::StateError;

/// State of one process on one inode.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum ProcessState {
    Error = 0,
    Pending = 1,
    Running = 2,
    Complete = 3,
    Idle = 4,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl TryFrom<i64> for ProcessState {
    type Error = StateError;

    fn try_from(v: i64) -> Result<Self, StateError> {
        match v {
            0 => Ok(ProcessState::Error),
            1 => Ok(ProcessState::Pending),
            2 => Ok(ProcessState::Running),
            3 => Ok(ProcessState::Complete),
            4 => Ok(ProcessState::Idle),
            other => Err(StateError::UnknownState(other)),
        }
    }
}

/// The three conflicting operations tracked per inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Process {
    Read,
    Write,
    Sync,
}

impl Process {
    pub fn as_str(&self) -> &'static str {
        match self {
            Process::Read => "read",
            Process::Write => "write",
            Process::Sync => "sync",
        }
    }
}

/// Key-value store with per-entry TTL and compare-and-set.
#[async_trait::async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;
    /// Set unconditionally, refreshing the TTL.
    async fn set(&self, key: &str, value: &str) -> Result<(), StateError>;
    /// Set only if the current value equals `expected`, refreshing the TTL.
    /// Returns whether the swap happened.
    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StateError>;
}

/// In-process store, for tests and single-host deployments.
pub struct MemoryStore {
    ttl: Duration,
    map: std::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            map: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn live_value(
        map: &mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<String> {
        match map.get(key) {
            Some((value, deadline)) if Instant::now() < *deadline => Some(value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait::async_trait]
impl EphemeralStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Self::live_value(&mut map, key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_owned(), (value.to_owned(), Instant::now() + self.ttl));
        Ok(())
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StateError> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if Self::live_value(&mut map, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        map.insert(key.to_owned(), (value.to_owned(), Instant::now() + self.ttl));
        Ok(true)
    }
}

/// The compare-and-set runs server-side so two clients cannot interleave
/// between the read and the write.
const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    local result = redis.call('SET', KEYS[1], ARGV[2])
    if result then
        redis.call('PEXPIRE', KEYS[1], ARGV[3])
        return 1
    end
    return 0
else
    return 0
end
"#;

/// Redis-backed store for multi-process and multi-host deployments.
pub struct RedisStore {
    client: redis::Client,
    ttl: Duration,
    script: redis::Script,
}

impl RedisStore {
    pub fn new(url: &str, ttl: Duration) -> Result<Self, StateError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            ttl,
            script: redis::Script::new(CAS_SCRIPT),
        })
    }
}

#[async_trait::async_trait]
impl EphemeralStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        let mut conn = self.client.get_async_connection().await?;
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StateError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StateError> {
        let mut conn = self.client.get_async_connection().await?;
        let result: i64 = self
            .script
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }
}

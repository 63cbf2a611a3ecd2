// Fencing-token locks keyed by (document, lock name).
//
// TTL-gated with lazy expiry: an entry past its deadline counts as absent
// and is overwritten by the next acquire. Cooldowns are a separate table
// with no holder identity at all — an acquire succeeds only while no
// unexpired entry exists at the key.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Named lock slots on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    /// Guards save orchestration for one document.
    Save,
    /// Guards session authorization for one document.
    Auth,
}

impl LockName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Auth => "auth",
        }
    }
}

/// Result of releasing a fencing lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The caller held the lock; it has been removed.
    Unlocked,
    /// An unexpired entry with a different token exists; release denied.
    Locked,
    /// No live entry; nothing to release.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LockEntry {
    fencing_token: String,
    expire_at: DateTime<Utc>,
}

impl LockEntry {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_at
    }
}

/// In-memory lock and cooldown state for one store instance.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<(String, LockName), LockEntry>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

impl LockTable {
    /// Acquire or refresh a lock.
    ///
    /// Succeeds when no live entry exists or the live entry already holds
    /// the supplied token (idempotent re-entry extends the TTL). Fails when
    /// an unexpired entry holds a different token.
    pub fn try_lock(
        &mut self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        ttl_sec: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (doc_id.to_string(), name);
        if let Some(entry) = self.locks.get(&key) {
            if entry.is_live_at(now) && entry.fencing_token != fencing_token {
                return false;
            }
        }
        self.locks.insert(
            key,
            LockEntry {
                fencing_token: fencing_token.to_string(),
                expire_at: now + Duration::seconds(i64::from(ttl_sec)),
            },
        );
        true
    }

    /// Release a lock if the caller still holds it.
    pub fn try_unlock(
        &mut self,
        doc_id: &str,
        name: LockName,
        fencing_token: &str,
        now: DateTime<Utc>,
    ) -> UnlockOutcome {
        let key = (doc_id.to_string(), name);
        match self.locks.get(&key) {
            Some(entry) if entry.is_live_at(now) => {
                if entry.fencing_token == fencing_token {
                    self.locks.remove(&key);
                    UnlockOutcome::Unlocked
                } else {
                    UnlockOutcome::Locked
                }
            }
            Some(_) => {
                // Expired entry: drop it, nothing was held.
                self.locks.remove(&key);
                UnlockOutcome::Empty
            }
            None => UnlockOutcome::Empty,
        }
    }

    /// Acquire a cooldown gate: succeeds only while no unexpired entry
    /// exists at `key`, regardless of caller. Used to rate-limit repeating
    /// work (e.g. a notification) to once per TTL window.
    pub fn try_acquire_cooldown(&mut self, key: &str, ttl_sec: u32, now: DateTime<Utc>) -> bool {
        if let Some(expire_at) = self.cooldowns.get(key) {
            if now < *expire_at {
                return false;
            }
        }
        self.cooldowns.insert(key.to_string(), now + Duration::seconds(i64::from(ttl_sec)));
        true
    }

    /// Drop all lock state for a document.
    pub fn clean_document(&mut self, doc_id: &str) {
        self.locks.retain(|(doc, _), _| doc != doc_id);
    }
}

//! Conversation memory boundary.
//!
//! The orchestration core touches memory in exactly two ways: a
//! best-effort `save_turn` for every committed user turn and finalized
//! assistant reply, and a `recent_context` lookup that rides along on
//! reasoning requests. Both are bounded and failures never reach the
//! client. A per-session [`MemoryPrefetch`] slot lets the event loop
//! start the lookup on the first partial so commit time pays nothing.

pub mod sqlite;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Speaker role for a persisted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Persistent conversation memory.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist one turn. Text arrives already policy-redacted.
    async fn save_turn(&self, session_id: &str, user_id: &str, role: TurnRole, text: &str)
        -> Result<()>;

    /// Most recent turns for a user, formatted as "role: text" lines,
    /// oldest first.
    async fn recent_context(&self, user_id: &str, limit: usize) -> Result<Vec<String>>;
}

/// A finished memory prefetch.
#[derive(Debug, Clone)]
pub struct PrefetchedContext {
    pub lines: Vec<String>,
    pub fetched_at: Instant,
}

/// Per-session fire-and-forget memory lookup slot.
///
/// The first non-empty partial starts a lookup; the commit handler takes
/// whatever has arrived by then. Stale results are discarded on read.
pub struct MemoryPrefetch {
    store: Arc<dyn MemoryStore>,
    user_id: String,
    limit: usize,
    fresh_for: Duration,
    slot: Arc<Mutex<Option<PrefetchedContext>>>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryPrefetch {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        user_id: String,
        limit: usize,
        fresh_for: Duration,
    ) -> Self {
        Self {
            store,
            user_id,
            limit,
            fresh_for,
            slot: Arc::new(Mutex::new(None)),
            in_flight: Mutex::new(None),
        }
    }

    /// Start a lookup unless one is running or a fresh result is present.
    pub fn start(&self) {
        {
            let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            if slot
                .as_ref()
                .is_some_and(|c| c.fetched_at.elapsed() < self.fresh_for)
            {
                return;
            }
        }
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let store = Arc::clone(&self.store);
        let user_id = self.user_id.clone();
        let limit = self.limit;
        let slot = Arc::clone(&self.slot);
        *in_flight = Some(tokio::spawn(async move {
            match store.recent_context(&user_id, limit).await {
                Ok(lines) => {
                    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = Some(PrefetchedContext {
                        lines,
                        fetched_at: Instant::now(),
                    });
                }
                Err(e) => debug!(error = %e, "memory prefetch failed"),
            }
        }));
    }

    /// Take the prefetched context if it is still fresh.
    pub fn take_fresh(&self) -> Option<Vec<String>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(context) if context.fetched_at.elapsed() < self.fresh_for => Some(context.lines),
            _ => None,
        }
    }

    /// Peek without consuming; used for speculative requests.
    pub fn peek_fresh(&self) -> Option<Vec<String>> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.fresh_for)
            .map(|c| c.lines.clone())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::CompanionError;
    use std::collections::HashMap;

    /// In-memory store for prefetch tests.
    #[derive(Default)]
    struct MapStore {
        turns: Mutex<HashMap<String, Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MemoryStore for MapStore {
        async fn save_turn(
            &self,
            _session_id: &str,
            user_id: &str,
            role: TurnRole,
            text: &str,
        ) -> Result<()> {
            if self.fail {
                return Err(CompanionError::Memory("down".to_owned()));
            }
            let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            turns
                .entry(user_id.to_owned())
                .or_default()
                .push(format!("{}: {text}", role.as_str()));
            Ok(())
        }

        async fn recent_context(&self, user_id: &str, limit: usize) -> Result<Vec<String>> {
            if self.fail {
                return Err(CompanionError::Memory("down".to_owned()));
            }
            let turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
            let lines = turns.get(user_id).cloned().unwrap_or_default();
            let skip = lines.len().saturating_sub(limit);
            Ok(lines.into_iter().skip(skip).collect())
        }
    }

    #[tokio::test]
    async fn prefetch_fills_slot() {
        let store = Arc::new(MapStore::default());
        store
            .save_turn("s1", "u1", TurnRole::User, "hello")
            .await
            .unwrap();

        let prefetch = MemoryPrefetch::new(
            Arc::clone(&store) as Arc<dyn MemoryStore>,
            "u1".to_owned(),
            4,
            Duration::from_secs(5),
        );
        prefetch.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(prefetch.peek_fresh(), Some(vec!["user: hello".to_owned()]));
        assert_eq!(prefetch.take_fresh(), Some(vec!["user: hello".to_owned()]));
        // Consumed: the slot is empty until another start().
        assert!(prefetch.take_fresh().is_none());
    }

    #[tokio::test]
    async fn failed_prefetch_leaves_slot_empty() {
        let store = Arc::new(MapStore {
            fail: true,
            ..MapStore::default()
        });
        let prefetch = MemoryPrefetch::new(
            store as Arc<dyn MemoryStore>,
            "u1".to_owned(),
            4,
            Duration::from_secs(5),
        );
        prefetch.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(prefetch.take_fresh().is_none());
    }
}

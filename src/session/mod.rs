//! Session identity and lifecycle.

pub mod event_loop;
pub mod wakeword;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Interrupted,
    Ended,
}

/// One client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub voice_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Immutable view handed to turn drivers and speculators.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub user_id: String,
    pub persona_id: String,
    pub voice_id: String,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            persona_id: self.persona_id.clone(),
            voice_id: self.voice_id.clone(),
        }
    }
}

/// Registry of live sessions with an inactivity janitor.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<HashMap<String, Session>>>,
    inactivity_timeout: Duration,
    retention: Duration,
}

impl SessionManager {
    pub fn new(inactivity_timeout: Duration, retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            inactivity_timeout,
            retention,
        }
    }

    /// Create a session and return its id.
    pub fn create(&self, user_id: &str, persona_id: &str, voice_id: &str) -> SessionSnapshot {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            persona_id: persona_id.to_owned(),
            voice_id: voice_id.to_owned(),
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Active,
        };
        let snapshot = session.snapshot();
        info!(session_id = session.id.as_str(), user_id, "session created");
        let mut sessions = self.lock();
        sessions.insert(session.id.clone(), session);
        snapshot
    }

    /// Record activity; returns false for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_activity_at = Utc::now();
                if session.status == SessionStatus::Interrupted {
                    session.status = SessionStatus::Active;
                }
                true
            }
            None => false,
        }
    }

    /// Mark the session interrupted (user barge-in via control).
    pub fn interrupt(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = SessionStatus::Interrupted;
            session.last_activity_at = Utc::now();
        }
    }

    /// Explicitly end a session.
    pub fn end(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = SessionStatus::Ended;
            session.last_activity_at = Utc::now();
            info!(session_id, "session ended");
        }
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.lock().get(session_id).map(|s| s.status)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.lock().get(session_id).map(Session::snapshot)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// One janitor pass: end idle sessions, drop ended ones past
    /// retention. Returns (ended, removed).
    pub fn sweep(&self) -> (usize, usize) {
        let now = Utc::now();
        let inactivity = chrono::Duration::from_std(self.inactivity_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));

        let mut sessions = self.lock();
        let mut ended = 0usize;
        for session in sessions.values_mut() {
            if session.status != SessionStatus::Ended
                && now - session.last_activity_at > inactivity
            {
                session.status = SessionStatus::Ended;
                ended += 1;
                debug!(session_id = session.id.as_str(), "janitor ended idle session");
            }
        }
        let before = sessions.len();
        sessions.retain(|_, s| {
            s.status != SessionStatus::Ended || now - s.last_activity_at <= retention
        });
        (ended, before - sessions.len())
    }

    /// Spawn the periodic janitor task.
    pub fn spawn_janitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let (ended, removed) = manager.sweep();
                        if ended > 0 || removed > 0 {
                            info!(ended, removed, "session janitor sweep");
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// Viseme render sessions: created by POST /render/start, claimed once by
// GET /stream/{id}

use std::sync::Arc;
use std::time::{Duration, Instant};

use avatar_core::{AvatarResource, VisemeTimeline};
use dashmap::DashMap;
use tracing::debug;

use crate::error::ApiError;

/// Everything needed to open the stream, prepared when the session starts.
#[derive(Debug, Clone)]
pub struct RenderSession {
    pub avatar: Arc<AvatarResource>,
    pub timeline: Arc<VisemeTimeline>,
    pub fps: u32,
}

struct Pending {
    session: RenderSession,
    created: Instant,
}

pub struct SessionStore {
    pending: DashMap<String, Pending>,
    ttl: Duration,
    max_sessions: usize,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("pending", &self.pending.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SessionStore {
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Store a session and return its id. Expired sessions are dropped first.
    pub fn insert(&self, session: RenderSession) -> Result<String, ApiError> {
        self.purge_expired();
        if self.pending.len() >= self.max_sessions {
            return Err(ApiError::Unavailable(format!(
                "{} render sessions already pending",
                self.pending.len()
            )));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.pending.insert(
            id.clone(),
            Pending {
                session,
                created: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Claim a session. Each id streams at most once.
    pub fn take(&self, id: &str) -> Option<RenderSession> {
        let (_, pending) = self.pending.remove(id)?;
        if pending.created.elapsed() > self.ttl {
            debug!(id, "render session expired before it was claimed");
            return None;
        }
        Some(pending.session)
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.pending.retain(|_, p| p.created.elapsed() <= ttl);
    }
}

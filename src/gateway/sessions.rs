//! Registry of live SSE and WebSocket sessions, for introspection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Which long-lived transport a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Sse,
    WebSocket,
}

impl SessionKind {
    fn prefix(self) -> &'static str {
        match self {
            SessionKind::Sse => "sse",
            SessionKind::WebSocket => "ws",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub connected_at: DateTime<Utc>,
}

/// Per-transport numbers reported by `/transport/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransportStats {
    pub count: usize,
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub sse: TransportStats,
    pub websocket: TransportStats,
}

/// Live sessions keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<String, SessionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionInfo>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new session. It stays listed until the guard is dropped.
    pub fn register(self: &Arc<Self>, kind: SessionKind) -> SessionGuard {
        let id = format!("{}_{}", kind.prefix(), Uuid::new_v4().simple());
        let info = SessionInfo {
            id: id.clone(),
            kind,
            connected_at: Utc::now(),
        };
        self.lock().insert(id.clone(), info);
        tracing::info!(client_id = %id, kind = ?kind, "client connected");

        SessionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            tracing::info!(client_id = %id, "client disconnected");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.lock().get(id).cloned()
    }

    /// Counts and ids per transport, ids ordered by connect time.
    pub fn stats(&self) -> ConnectionStats {
        let mut sessions: Vec<SessionInfo> = self.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));

        let mut stats = ConnectionStats::default();
        for session in sessions {
            let bucket = match session.kind {
                SessionKind::Sse => &mut stats.sse,
                SessionKind::WebSocket => &mut stats.websocket,
            };
            bucket.count += 1;
            bucket.clients.push(session.id);
        }
        stats
    }
}

/// Removes its session from the registry when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    id: String,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

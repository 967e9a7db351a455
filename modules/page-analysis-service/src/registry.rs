//! Session registry: id -> (state, event queue, cancellation token).
//!
//! State and queue are created together and removed together, either by an
//! explicit delete or by the inactivity eviction timer.

use crate::queue::EventQueue;
use crate::session::{BatchInput, SessionState};
use chrono::Utc;
use dashmap::DashMap;
use page_analysis_types::{JobKind, SessionStatusResponse};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct SessionEntry {
    pub state: Arc<RwLock<SessionState>>,
    pub queue: Arc<EventQueue>,
    pub cancel: CancellationToken,
}

impl SessionEntry {
    pub fn snapshot(&self) -> SessionStatusResponse {
        self.state.read().snapshot()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create(&self, kind: JobKind, inputs: BatchInput) -> (String, Arc<SessionEntry>) {
        let id = uuid::Uuid::new_v4().to_string();
        let total = inputs.items.len();
        let entry = Arc::new(SessionEntry {
            state: Arc::new(RwLock::new(SessionState::new(id.clone(), kind, inputs))),
            queue: Arc::new(EventQueue::new(id.clone())),
            cancel: CancellationToken::new(),
        });
        self.sessions.insert(id.clone(), entry.clone());
        log::info!(
            "[REGISTRY] Created {} session {} ({} items)",
            kind,
            id,
            total
        );
        (id, entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Remove a session and cancel its runner. Returns false if unknown.
    pub fn delete(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                log::info!("[REGISTRY] Deleted session {}", id);
                true
            }
            None => false,
        }
    }

    /// Refresh last activity. Returns false if unknown.
    pub fn touch(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.state.write().touch();
                true
            }
            None => false,
        }
    }

    /// Newest first
    pub fn list(&self) -> Vec<SessionStatusResponse> {
        let mut snapshots: Vec<SessionStatusResponse> =
            self.sessions.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict the session once it has been idle for `after`. Activity seen
    /// when the timer fires re-arms it for the rest of the window. A session
    /// deleted in the meantime is left alone.
    pub fn schedule_eviction(self: &Arc<Self>, id: &str, after: Duration) {
        let registry = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut wait = after;
            loop {
                tokio::time::sleep(wait).await;

                let entry = match registry.get(&id) {
                    Some(entry) => entry,
                    None => return,
                };

                let last_activity = entry.state.read().last_activity_at;
                let idle = (Utc::now() - last_activity).to_std().unwrap_or_default();
                if idle < after {
                    wait = after - idle;
                    log::debug!(
                        "[REGISTRY] Session {} active {:?} ago, re-arming eviction",
                        id,
                        idle
                    );
                    continue;
                }

                if registry
                    .sessions
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &entry))
                    .is_some()
                {
                    entry.cancel.cancel();
                    log::info!("[REGISTRY] Evicted idle session {}", id);
                }
                return;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WorkItem;
    use page_analysis_types::SessionStatus;

    fn inputs() -> BatchInput {
        BatchInput {
            items: vec![WorkItem::text_only("a")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_get_delete() {
        let registry = SessionRegistry::new();
        let (id, entry) = registry.create(JobKind::PageAnalysis, inputs());

        assert_eq!(registry.len(), 1);
        let fetched = registry.get(&id).unwrap();
        assert!(Arc::ptr_eq(&fetched, &entry));
        assert_eq!(fetched.snapshot().status, SessionStatus::Created);

        assert!(registry.delete(&id));
        assert!(entry.cancel.is_cancelled());
        assert!(registry.get(&id).is_none());
        assert!(!registry.delete(&id));
        assert!(!registry.touch(&id));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.create(JobKind::PageAnalysis, inputs());
        let (b, _) = registry.create(JobKind::TestScenarios, inputs());
        assert_ne!(a, b);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn eviction_removes_idle_session() {
        let registry = SessionRegistry::new();
        let (id, _) = registry.create(JobKind::PageAnalysis, inputs());
        registry.schedule_eviction(&id, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn eviction_rearms_after_activity() {
        let registry = SessionRegistry::new();
        let (id, _) = registry.create(JobKind::PageAnalysis, inputs());
        registry.schedule_eviction(&id, Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.touch(&id));
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Timer fired at ~200ms but the touch at ~120ms keeps it alive
        assert!(registry.get(&id).is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn eviction_after_delete_is_a_no_op() {
        let registry = SessionRegistry::new();
        let (id, _) = registry.create(JobKind::PageAnalysis, inputs());
        registry.schedule_eviction(&id, Duration::from_millis(30));
        assert!(registry.delete(&id));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.is_empty());
    }
}

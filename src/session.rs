//! In-memory session registry.
//!
//! Sessions are keyed by caller-supplied identifiers; an absent identifier
//! gets a fresh UUID. Each session's state sits behind its own lock so
//! concurrent turns on different sessions never contend, while two turns
//! on the same session serialize.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::agent::SessionState;

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the session for `id`, creating it (and minting an id when
    /// none was supplied). Returns the id together with the state handle.
    pub async fn get_or_create(&self, id: Option<&str>) -> (String, Arc<Mutex<SessionState>>) {
        let id = match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(existing) => existing.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        {
            let sessions = self.sessions.read().await;
            if let Some(state) = sessions.get(&id) {
                return (id, state.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        let state = sessions
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::info!(session = %id, "created session");
                Arc::new(Mutex::new(SessionState::new(id.clone())))
            })
            .clone();
        (id, state)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_id_mints_a_uuid() {
        let manager = SessionManager::new();
        let (id, _state) = manager.get_or_create(None).await;
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn same_id_returns_same_session() {
        let manager = SessionManager::new();
        let (id, first) = manager.get_or_create(Some("abc")).await;
        {
            let mut state = first.lock().await;
            state.generated_sql = Some("SELECT 1".to_string());
        }
        let (id_again, second) = manager.get_or_create(Some("abc")).await;
        assert_eq!(id, id_again);
        assert_eq!(
            second.lock().await.generated_sql.as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let manager = SessionManager::new();
        let (_, a) = manager.get_or_create(Some("a")).await;
        a.lock().await.awaiting_confirmation = true;
        let (_, b) = manager.get_or_create(Some("b")).await;
        assert!(!b.lock().await.awaiting_confirmation);
    }

    #[tokio::test]
    async fn blank_id_is_treated_as_absent() {
        let manager = SessionManager::new();
        let (id, _) = manager.get_or_create(Some("   ")).await;
        assert!(Uuid::parse_str(&id).is_ok());
    }
}

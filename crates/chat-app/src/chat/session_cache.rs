use std::sync::Arc;

use parley_storage::{SessionGateway, SessionName};

use super::query::{CoalescedQuery, QueryResult};

/// Process-wide cached list of session names, newest first.
pub struct SessionCache {
    store: Arc<dyn SessionGateway>,
    query: CoalescedQuery<Vec<SessionName>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionGateway>) -> Self {
        Self {
            store,
            query: CoalescedQuery::labeled("session-list"),
        }
    }

    /// Serves the cached list while it is fresh; otherwise joins or starts one store read.
    pub async fn list(&self) -> QueryResult<Vec<SessionName>> {
        let store = Arc::clone(&self.store);
        self.query
            .get_or_fetch(move || async move { store.list_sessions().await })
            .await
    }

    /// Last known list without touching the store.
    pub fn peek(&self) -> Option<Vec<SessionName>> {
        self.query.peek()
    }

    pub async fn contains(&self, name: &SessionName) -> QueryResult<bool> {
        Ok(self.list().await?.contains(name))
    }

    pub fn invalidate(&self) {
        self.query.invalidate();
    }

    pub(crate) fn mark_created(&self, name: &SessionName) {
        tracing::debug!(session = %name, "marking session created in cached list");
        self.query.update(|names| {
            if !names.contains(name) {
                names.insert(0, name.clone());
            }
        });
    }

    pub(crate) fn mark_deleted(&self, name: &SessionName) {
        tracing::debug!(session = %name, "marking session deleted in cached list");
        self.query.update(|names| names.retain(|existing| existing != name));
    }
}

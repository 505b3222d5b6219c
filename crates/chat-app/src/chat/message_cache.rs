use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_storage::{MessageRecord, SessionGateway, SessionName};

use super::query::{CoalescedQuery, QueryResult};

type MessageQuery = CoalescedQuery<Vec<MessageRecord>>;

/// Per-session cached transcripts, fetched lazily on first read.
pub struct MessageCache {
    store: Arc<dyn SessionGateway>,
    entries: Mutex<HashMap<SessionName, Arc<MessageQuery>>>,
}

impl MessageCache {
    pub fn new(store: Arc<dyn SessionGateway>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionName, Arc<MessageQuery>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, name: &SessionName) -> Arc<MessageQuery> {
        Arc::clone(
            self.entries()
                .entry(name.clone())
                .or_insert_with(|| Arc::new(MessageQuery::labeled("messages"))),
        )
    }

    /// Messages in append order. A session the store does not know reads as empty.
    pub async fn get(&self, name: &SessionName) -> QueryResult<Vec<MessageRecord>> {
        let query = self.entry(name);
        let store = Arc::clone(&self.store);
        let session = name.clone();
        query
            .get_or_fetch(move || async move {
                match store.list_messages(&session).await {
                    Err(error) if error.is_not_found() => {
                        tracing::debug!(session = %session, "transcript requested for unknown session");
                        Ok(Vec::new())
                    }
                    other => other,
                }
            })
            .await
    }

    pub fn peek(&self, name: &SessionName) -> Option<Vec<MessageRecord>> {
        self.entries().get(name).and_then(|query| query.peek())
    }

    pub fn invalidate(&self, name: &SessionName) {
        if let Some(query) = self.entries().get(name) {
            query.invalidate();
        }
    }

    pub fn invalidate_all(&self) {
        for query in self.entries().values() {
            query.invalidate();
        }
    }

    /// Forgets the session entirely; the next read starts from an empty slot.
    pub fn evict(&self, name: &SessionName) {
        if let Some(query) = self.entries().remove(name) {
            query.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::NewMessage;

    use super::*;
    use crate::testing::RecordingStore;

    #[tokio::test]
    async fn transcripts_are_cached_per_session() {
        let store = RecordingStore::new();
        let alpha = store
            .seed("alpha", &[NewMessage::user("hi"), NewMessage::assistant("hello")])
            .await;
        let beta = store.seed("beta", &[NewMessage::user("yo")]).await;
        let cache = MessageCache::new(store.clone());

        assert_eq!(cache.get(&alpha).await.expect("alpha").len(), 2);
        assert_eq!(cache.get(&alpha).await.expect("alpha").len(), 2);
        assert_eq!(cache.get(&beta).await.expect("beta").len(), 1);
        assert_eq!(store.list_message_calls(), 2);

        cache.invalidate(&alpha);
        cache.get(&alpha).await.expect("alpha");
        cache.get(&beta).await.expect("beta");
        assert_eq!(store.list_message_calls(), 3);
    }

    #[tokio::test]
    async fn unknown_session_reads_as_empty() {
        let store = RecordingStore::new();
        let cache = MessageCache::new(store.clone());
        let ghost = SessionName::parse("ghost").expect("name");

        assert!(cache.get(&ghost).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn invalidate_all_and_evict_force_refetch() {
        let store = RecordingStore::new();
        let alpha = store.seed("alpha", &[NewMessage::user("hi")]).await;
        let beta = store.seed("beta", &[]).await;
        let cache = MessageCache::new(store.clone());
        cache.get(&alpha).await.expect("alpha");
        cache.get(&beta).await.expect("beta");

        cache.invalidate_all();
        cache.get(&alpha).await.expect("alpha");
        cache.get(&beta).await.expect("beta");
        assert_eq!(store.list_message_calls(), 4);

        cache.evict(&alpha);
        assert!(cache.peek(&alpha).is_none());
        assert!(cache.peek(&beta).is_some());
    }

    #[tokio::test]
    async fn concurrent_readers_of_one_session_share_a_read() {
        let store = RecordingStore::new();
        let alpha = store.seed("alpha", &[NewMessage::user("hi")]).await;
        let gate = store.hold_reads();
        let cache = Arc::new(MessageCache::new(store.clone()));

        let readers = (0..3)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let alpha = alpha.clone();
                tokio::spawn(async move { cache.get(&alpha).await })
            })
            .collect::<Vec<_>>();

        while store.list_message_calls() == 0 {
            tokio::task::yield_now().await;
        }
        gate.add_permits(1);

        for reader in readers {
            assert_eq!(reader.await.expect("join").expect("get").len(), 1);
        }
        assert_eq!(store.list_message_calls(), 1);
    }
}

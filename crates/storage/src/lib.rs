use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, SessionName};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{MessageRecord, MessageRole, NewMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request/response boundary to the authoritative session store.
///
/// Implementations own persistence and ordering: `list_messages` returns messages in
/// append order, and timestamps never decrease within a session.
pub trait SessionGateway: Send + Sync {
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionName>>>;

    /// Fails with [`StorageError::SessionExists`] when the name is taken.
    fn create_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>>;

    /// Removes the session together with all of its messages.
    fn delete_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>>;

    fn list_messages<'a>(
        &'a self,
        name: &'a SessionName,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;

    fn append_message<'a>(
        &'a self,
        name: &'a SessionName,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Drops every message older than `max_age` and returns how many were removed.
    fn clear_expired_messages(&self, max_age: Duration) -> BoxFuture<'_, StorageResult<u64>>;
}

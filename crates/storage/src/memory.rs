use std::time::Duration;

use snafu::OptionExt;
use tokio::sync::Mutex;

use super::error::{NotFoundSnafu, SessionExistsSnafu, StorageResult};
use super::ids::{MessageId, SessionName};
use super::types::{MessageRecord, NewMessage, unix_timestamp_nanos};
use super::{BoxFuture, SessionGateway};

/// In-process store with the same observable semantics as [`super::SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    // Creation order, oldest first.
    sessions: Vec<MemorySession>,
}

#[derive(Debug)]
struct MemorySession {
    name: SessionName,
    messages: Vec<MessageRecord>,
}

impl MemoryState {
    fn position(&self, name: &SessionName) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| &session.name == name)
    }

    fn session(&self, name: &SessionName, stage: &'static str) -> StorageResult<&MemorySession> {
        let index = self.position(name).context(NotFoundSnafu {
            stage,
            entity: "session",
            id: name.to_string(),
        })?;
        Ok(&self.sessions[index])
    }

    fn session_mut(
        &mut self,
        name: &SessionName,
        stage: &'static str,
    ) -> StorageResult<&mut MemorySession> {
        let index = self.position(name).context(NotFoundSnafu {
            stage,
            entity: "session",
            id: name.to_string(),
        })?;
        Ok(&mut self.sessions[index])
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionGateway for MemoryStore {
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionName>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .sessions
                .iter()
                .rev()
                .map(|session| session.name.clone())
                .collect())
        })
    }

    fn create_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.position(name).is_some() {
                return SessionExistsSnafu {
                    stage: "memory-session-create",
                    name: name.to_string(),
                }
                .fail();
            }

            state.sessions.push(MemorySession {
                name: name.clone(),
                messages: Vec::new(),
            });
            Ok(())
        })
    }

    fn delete_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let index = state.position(name).context(NotFoundSnafu {
                stage: "memory-session-delete",
                entity: "session",
                id: name.to_string(),
            })?;
            state.sessions.remove(index);
            Ok(())
        })
    }

    fn list_messages<'a>(
        &'a self,
        name: &'a SessionName,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let session = state.session(name, "memory-message-list")?;
            Ok(session.messages.clone())
        })
    }

    fn append_message<'a>(
        &'a self,
        name: &'a SessionName,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let session = state.session_mut(name, "memory-message-append")?;

            // Wall clocks can step backwards; clamp so per-session order stays monotonic.
            let previous = session
                .messages
                .last()
                .map_or(0, |message| message.timestamp_unix_nanos);
            let record = MessageRecord {
                id: MessageId::new_v7(),
                session: name.clone(),
                role: input.role,
                content: input.content,
                timestamp_unix_nanos: unix_timestamp_nanos().max(previous),
            };
            session.messages.push(record.clone());
            Ok(record)
        })
    }

    fn clear_expired_messages(&self, max_age: Duration) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let max_age_nanos = u64::try_from(max_age.as_nanos()).unwrap_or(u64::MAX);
            let cutoff = unix_timestamp_nanos().saturating_sub(max_age_nanos);

            let mut state = self.state.lock().await;
            let mut removed = 0_u64;
            for session in &mut state.sessions {
                let before = session.messages.len();
                session
                    .messages
                    .retain(|message| message.timestamp_unix_nanos >= cutoff);
                removed += (before - session.messages.len()) as u64;
            }
            Ok(removed)
        })
    }
}

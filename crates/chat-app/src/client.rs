use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parley_llm::{ChatTurn, CompletionGateway};
use parley_storage::{MessageRecord, SessionGateway, SessionName};
use snafu::{ResultExt, ensure};

use crate::chat::{
    ActiveSessionSelector, MessageCache, SendOptions, SendOrchestrator, SendPhase, SessionCache,
};
use crate::error::{
    ChatError, ChatResult, DuplicateSessionSnafu, InvalidSessionNameSnafu, StoreSnafu,
    UnknownSessionSnafu,
};

/// Base name for a chat started without an explicit name, e.g. `Chat Oct 15, 09:05 PM`.
pub fn default_session_name(now: NaiveDateTime) -> String {
    format!("Chat {}", now.format("%b %-d, %I:%M %p"))
}

/// The entry points a front end uses. Each user action maps to one call here.
pub struct ChatClient {
    store: Arc<dyn SessionGateway>,
    sessions: Arc<SessionCache>,
    messages: Arc<MessageCache>,
    active: ActiveSessionSelector,
    orchestrator: SendOrchestrator,
}

impl ChatClient {
    pub fn new(
        store: Arc<dyn SessionGateway>,
        completion: Arc<dyn CompletionGateway>,
        options: SendOptions,
    ) -> Self {
        let sessions = Arc::new(SessionCache::new(Arc::clone(&store)));
        let messages = Arc::new(MessageCache::new(Arc::clone(&store)));
        let orchestrator = SendOrchestrator::new(
            Arc::clone(&store),
            completion,
            Arc::clone(&sessions),
            Arc::clone(&messages),
            options,
        );
        Self {
            store,
            sessions,
            messages,
            active: ActiveSessionSelector::new(),
            orchestrator,
        }
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageCache {
        &self.messages
    }

    pub async fn list_sessions(&self) -> ChatResult<Vec<SessionName>> {
        self.sessions.list().await.context(StoreSnafu {
            stage: "list-sessions",
        })
    }

    /// Creates exactly `raw`. A taken name is reported, never renamed.
    pub async fn create_session(&self, raw: &str) -> ChatResult<SessionName> {
        let name = SessionName::parse(raw).context(InvalidSessionNameSnafu {
            stage: "create-session-validate",
        })?;

        match self.store.create_session(&name).await {
            Ok(()) => {}
            Err(error) if error.is_duplicate_session() => {
                return DuplicateSessionSnafu {
                    stage: "create-session",
                    name,
                }
                .fail();
            }
            Err(error) => return Err(ChatError::store("create-session", error)),
        }

        self.sessions.mark_created(&name);
        self.sessions.invalidate();
        tracing::info!(session = %name, "session created");
        Ok(name)
    }

    /// Creates `base`, or `base (N)` with a random N if `base` is taken, and makes it active.
    pub async fn create_session_unique(&self, base: &str) -> ChatResult<SessionName> {
        let name = match self.create_session(base).await {
            Err(ChatError::DuplicateSession { .. }) => {
                let suffix = rand::random_range(0..1000_u16);
                tracing::debug!(base, suffix, "session name taken, retrying with suffix");
                self.create_session(&format!("{base} ({suffix})")).await?
            }
            other => other?,
        };
        self.active.set(Some(name.clone()));
        Ok(name)
    }

    /// Starts a chat named after the current local time.
    pub async fn start_chat(&self) -> ChatResult<SessionName> {
        let base = default_session_name(chrono::Local::now().naive_local());
        self.create_session_unique(&base).await
    }

    /// Deletes the session and everything cached for it. Sends still running on it fail
    /// with a store error instead of writing into a later session of the same name.
    pub async fn delete_session(&self, name: &SessionName) -> ChatResult<()> {
        if let Err(error) = self.store.delete_session(name).await {
            // Already gone upstream; still drop our view of it.
            if error.is_not_found() {
                self.forget_session(name);
            }
            return Err(ChatError::store("delete-session", error));
        }

        self.forget_session(name);
        tracing::info!(session = %name, "session deleted");
        Ok(())
    }

    fn forget_session(&self, name: &SessionName) {
        self.sessions.mark_deleted(name);
        self.sessions.invalidate();
        self.messages.evict(name);
        self.orchestrator.retire(name);
        if self.active.clear_if(name) {
            tracing::info!(session = %name, "active session deleted, selection cleared");
        }
    }

    pub async fn get_messages(&self, name: &SessionName) -> ChatResult<Vec<MessageRecord>> {
        self.messages.get(name).await.context(StoreSnafu {
            stage: "get-messages",
        })
    }

    /// Sends `text` on `session`, using that session's cached transcript as history.
    pub async fn send(&self, session: &SessionName, text: &str) -> ChatResult<String> {
        self.orchestrator.send_from_cache(session, text).await
    }

    /// Sends with history the caller already holds.
    pub async fn send_with_history(
        &self,
        session: &SessionName,
        text: &str,
        history: Vec<ChatTurn>,
    ) -> ChatResult<String> {
        self.orchestrator.send(session, text, history).await
    }

    pub fn send_phase(&self, session: &SessionName) -> SendPhase {
        self.orchestrator.phase(session)
    }

    pub fn active_session(&self) -> Option<SessionName> {
        self.active.get()
    }

    pub fn set_active_session(&self, name: Option<SessionName>) {
        self.active.set(name);
    }

    /// Makes an existing session active.
    pub async fn open_session(&self, raw: &str) -> ChatResult<SessionName> {
        let name = SessionName::parse(raw).context(InvalidSessionNameSnafu {
            stage: "open-session-validate",
        })?;
        let known = self.sessions.contains(&name).await.context(StoreSnafu {
            stage: "open-session",
        })?;
        ensure!(
            known,
            UnknownSessionSnafu {
                stage: "open-session",
                name,
            }
        );
        self.active.set(Some(name.clone()));
        Ok(name)
    }

    /// Forgets everything cached and the active selection, as after an identity change.
    pub fn reset_context(&self) {
        self.sessions.invalidate();
        self.messages.invalidate_all();
        self.active.set(None);
        tracing::info!("chat context reset");
    }

    /// Asks the store to drop messages older than `max_age`, then invalidates transcripts.
    pub async fn expire_messages(&self, max_age: Duration) -> ChatResult<u64> {
        let removed = self
            .store
            .clear_expired_messages(max_age)
            .await
            .map_err(|source| ChatError::store("expire-messages", source))?;
        self.messages.invalidate_all();
        tracing::info!(removed, max_age_secs = max_age.as_secs(), "expired old messages");
        Ok(removed)
    }
}

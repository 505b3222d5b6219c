use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use parley_llm::{ChatTurn, CompletionError, CompletionGateway, CompletionRequest, DEFAULT_MODEL};
use parley_storage::{MessageRecord, MessageRole, NewMessage, SessionGateway, SessionName};
use snafu::{ResultExt, ensure};
use tokio::sync::OwnedMutexGuard;

use super::message_cache::MessageCache;
use super::session_cache::SessionCache;
use crate::error::{
    ChatError, ChatResult, CompletionSnafu, EmptyMessageSnafu, SessionDeletedSnafu, StoreSnafu,
    UnknownSessionSnafu,
};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are INC.ai, a helpful and intelligent AI assistant. Be concise, clear, and helpful.";
pub const FALLBACK_RESPONSE: &str = "Sorry, I could not generate a response.";
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a session's send currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    PersistingUser,
    AwaitingCompletion,
    PersistingAssistant,
}

impl SendPhase {
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::PersistingUser)
                | (Self::PersistingUser, Self::AwaitingCompletion)
                | (Self::AwaitingCompletion, Self::PersistingAssistant)
                | (_, Self::Idle)
        )
    }
}

/// Knobs for the outbound completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub model_id: String,
    pub system_prompt: String,
    pub timeout: Duration,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: DEFAULT_COMPLETION_TIMEOUT,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Turns a cached transcript into completion history.
pub fn conversation_history(messages: &[MessageRecord]) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|message| match message.role {
            MessageRole::User => ChatTurn::user(message.content.clone()),
            MessageRole::Assistant => ChatTurn::assistant(message.content.clone()),
        })
        .collect()
}

enum History {
    Provided(Vec<ChatTurn>),
    Cached,
}

#[derive(Default)]
struct SessionSlot {
    turn: Arc<tokio::sync::Mutex<()>>,
    phase: Mutex<SendPhase>,
    // Set once the session is deleted; sends holding this slot must not persist anything.
    retired: AtomicBool,
}

impl SessionSlot {
    fn phase(&self) -> SendPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, session: &SessionName, next: SendPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *phase;
        if !current.can_transition_to(next) {
            tracing::warn!(session = %session, from = ?current, to = ?next, "unexpected send phase transition");
        }
        *phase = next;
    }
}

type SlotMap = Mutex<HashMap<SessionName, Arc<SessionSlot>>>;

/// Exclusive right to run one send on a session. Dropping it resets the phase before
/// the next queued send can start, then forgets the slot if nobody else wants it.
struct SlotLease<'a> {
    slots: &'a SlotMap,
    session: SessionName,
    slot: Arc<SessionSlot>,
    turn: Option<OwnedMutexGuard<()>>,
}

impl SlotLease<'_> {
    fn advance(&self, next: SendPhase) {
        self.slot.advance(&self.session, next);
    }

    fn ensure_live(&self, stage: &'static str) -> ChatResult<()> {
        ensure!(
            !self.slot.retired.load(Ordering::Acquire),
            SessionDeletedSnafu {
                stage,
                name: self.session.clone(),
            }
        );
        Ok(())
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.slot.advance(&self.session, SendPhase::Idle);
        drop(self.turn.take());

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map and one here means no send is queued behind us. A
        // retired slot is no longer in the map, and a recreated session owns the entry.
        let ours = slots
            .get(&self.session)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot));
        if ours && Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.session);
        }
    }
}

/// Runs the persist-user, complete, persist-assistant protocol for each send.
pub struct SendOrchestrator {
    store: Arc<dyn SessionGateway>,
    completion: Arc<dyn CompletionGateway>,
    sessions: Arc<SessionCache>,
    messages: Arc<MessageCache>,
    options: SendOptions,
    slots: SlotMap,
}

impl SendOrchestrator {
    pub fn new(
        store: Arc<dyn SessionGateway>,
        completion: Arc<dyn CompletionGateway>,
        sessions: Arc<SessionCache>,
        messages: Arc<MessageCache>,
        options: SendOptions,
    ) -> Self {
        Self {
            store,
            completion,
            sessions,
            messages,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn phase(&self, session: &SessionName) -> SendPhase {
        self.slots()
            .get(session)
            .map_or(SendPhase::Idle, |slot| slot.phase())
    }

    /// Fences every send already running or queued on `session` so none of them persists
    /// into a later session that reuses the name.
    pub(crate) fn retire(&self, session: &SessionName) {
        let Some(slot) = self.slots().remove(session) else {
            return;
        };
        slot.retired.store(true, Ordering::Release);
        tracing::debug!(
            session = %session,
            phase = ?slot.phase(),
            "retired sends of deleted session"
        );
    }

    /// Sends with caller-supplied history (the transcript before this turn).
    pub async fn send(
        &self,
        session: &SessionName,
        user_text: &str,
        history: Vec<ChatTurn>,
    ) -> ChatResult<String> {
        self.send_with(session, user_text, History::Provided(history))
            .await
    }

    /// Sends with history read from the message cache once this send reaches the
    /// front of the session's queue.
    pub async fn send_from_cache(
        &self,
        session: &SessionName,
        user_text: &str,
    ) -> ChatResult<String> {
        self.send_with(session, user_text, History::Cached).await
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionName, Arc<SessionSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lease(&self, session: &SessionName) -> SlotLease<'_> {
        let slot = Arc::clone(self.slots().entry(session.clone()).or_default());
        let turn = Arc::clone(&slot.turn).lock_owned().await;
        SlotLease {
            slots: &self.slots,
            session: session.clone(),
            slot,
            turn: Some(turn),
        }
    }

    async fn send_with(
        &self,
        session: &SessionName,
        user_text: &str,
        history: History,
    ) -> ChatResult<String> {
        ensure!(
            !user_text.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "send-precondition",
            }
        );
        let known = self.sessions.contains(session).await.context(StoreSnafu {
            stage: "send-check-session",
        })?;
        ensure!(
            known,
            UnknownSessionSnafu {
                stage: "send-precondition",
                name: session.clone(),
            }
        );

        let lease = self.lease(session).await;
        let history = match history {
            History::Provided(history) => history,
            History::Cached => {
                let messages = self.messages.get(session).await.context(StoreSnafu {
                    stage: "send-load-history",
                })?;
                conversation_history(&messages)
            }
        };

        let result = self.run(&lease, user_text, history).await;
        if let Err(error) = &result {
            tracing::warn!(session = %session, stage = error.stage(), error = %error, "send failed");
        }
        result
    }

    async fn run(
        &self,
        lease: &SlotLease<'_>,
        user_text: &str,
        history: Vec<ChatTurn>,
    ) -> ChatResult<String> {
        let session = &lease.session;

        lease.advance(SendPhase::PersistingUser);
        lease.ensure_live("send-persist-user")?;
        self.store
            .append_message(session, NewMessage::user(user_text))
            .await
            .map_err(|source| ChatError::store("send-persist-user", source))?;
        self.messages.invalidate(session);

        lease.advance(SendPhase::AwaitingCompletion);
        let request = self.completion_request(history, user_text);
        let timeout = self.options.timeout;
        let completion =
            match tokio::time::timeout(timeout, self.completion.complete(request)).await {
                Ok(result) => result.context(CompletionSnafu {
                    stage: "send-await-completion",
                })?,
                Err(_) => {
                    return Err(ChatError::Completion {
                        stage: "send-await-completion",
                        source: CompletionError::Timeout {
                            stage: "completion-deadline",
                            after: timeout,
                        },
                    });
                }
            };
        let reply = completion
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_RESPONSE.to_string());

        lease.advance(SendPhase::PersistingAssistant);
        lease.ensure_live("send-persist-assistant")?;
        self.store
            .append_message(session, NewMessage::assistant(reply.clone()))
            .await
            .map_err(|source| ChatError::store("send-persist-assistant", source))?;
        self.messages.invalidate(session);

        tracing::info!(
            session = %session,
            provider_id = self.completion.id(),
            reply_chars = reply.chars().count(),
            "send finished"
        );
        Ok(reply)
    }

    fn completion_request(&self, history: Vec<ChatTurn>, user_text: &str) -> CompletionRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatTurn::system(self.options.system_prompt.clone()));
        messages.extend(history);
        messages.push(ChatTurn::user(user_text));

        let mut request = CompletionRequest::new(self.options.model_id.clone(), messages);
        if let Some(temperature) = self.options.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.options.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

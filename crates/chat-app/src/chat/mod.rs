mod active_session;
mod message_cache;
mod orchestrator;
mod query;
mod session_cache;

pub use active_session::ActiveSessionSelector;
pub use message_cache::MessageCache;
pub use orchestrator::{
    DEFAULT_COMPLETION_TIMEOUT, DEFAULT_SYSTEM_PROMPT, FALLBACK_RESPONSE, SendOptions,
    SendOrchestrator, SendPhase, conversation_history,
};
pub use query::{CoalescedQuery, QueryResult};
pub use session_cache::SessionCache;

//! Scripted gateways for exercising the sync core without a database or network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_llm::{BoxFuture, CompletionGateway, CompletionRequest, CompletionResult};
use parley_storage::{
    MemoryStore, MessageRecord, MessageRole, NewMessage, SessionGateway, SessionName,
    StorageError, StorageResult,
};
use tokio::sync::Semaphore;

fn injected(stage: &'static str) -> StorageError {
    StorageError::InvariantViolation {
        stage,
        details: "injected failure".to_string(),
    }
}

/// Wraps a [`MemoryStore`] with call counters, fault switches and an optional read gate.
#[derive(Default)]
pub(crate) struct RecordingStore {
    inner: MemoryStore,
    list_session_calls: AtomicUsize,
    list_message_calls: AtomicUsize,
    append_calls: AtomicUsize,
    fail_list_sessions: Mutex<bool>,
    fail_append_role: Mutex<Option<MessageRole>>,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn seed(&self, name: &str, messages: &[NewMessage]) -> SessionName {
        let name = SessionName::parse(name).expect("seed name");
        self.inner.create_session(&name).await.expect("seed session");
        for message in messages {
            self.inner
                .append_message(&name, message.clone())
                .await
                .expect("seed message");
        }
        name
    }

    pub(crate) fn list_session_calls(&self) -> usize {
        self.list_session_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn list_message_calls(&self) -> usize {
        self.list_message_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_list_sessions(&self, fail: bool) {
        *self.fail_list_sessions.lock().expect("fault lock") = fail;
    }

    pub(crate) fn fail_appends_for(&self, role: Option<MessageRole>) {
        *self.fail_append_role.lock().expect("fault lock") = role;
    }

    /// Blocks every list read until the returned semaphore receives a permit.
    pub(crate) fn hold_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.read_gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    async fn pass_read_gate(&self) {
        let gate = self.read_gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate open");
        }
    }
}

impl SessionGateway for RecordingStore {
    fn list_sessions(&self) -> BoxFuture<'_, StorageResult<Vec<SessionName>>> {
        Box::pin(async move {
            self.list_session_calls.fetch_add(1, Ordering::SeqCst);
            self.pass_read_gate().await;
            if *self.fail_list_sessions.lock().expect("fault lock") {
                return Err(injected("recording-list-sessions"));
            }
            self.inner.list_sessions().await
        })
    }

    fn create_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        self.inner.create_session(name)
    }

    fn delete_session<'a>(&'a self, name: &'a SessionName) -> BoxFuture<'a, StorageResult<()>> {
        self.inner.delete_session(name)
    }

    fn list_messages<'a>(
        &'a self,
        name: &'a SessionName,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.list_message_calls.fetch_add(1, Ordering::SeqCst);
            self.pass_read_gate().await;
            self.inner.list_messages(name).await
        })
    }

    fn append_message<'a>(
        &'a self,
        name: &'a SessionName,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.append_calls.fetch_add(1, Ordering::SeqCst);
            let fail_role = *self.fail_append_role.lock().expect("fault lock");
            if fail_role == Some(input.role) {
                return Err(injected("recording-append"));
            }
            self.inner.append_message(name, input).await
        })
    }

    fn clear_expired_messages(&self, max_age: Duration) -> BoxFuture<'_, StorageResult<u64>> {
        self.inner.clear_expired_messages(max_age)
    }
}

/// Completion double that replays queued answers and records every request it sees.
#[derive(Default)]
pub(crate) struct ScriptedCompletion {
    replies: Mutex<VecDeque<CompletionResult<Option<String>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedCompletion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_reply(&self, reply: CompletionResult<Option<String>>) {
        self.replies.lock().expect("reply lock").push_back(reply);
    }

    pub(crate) fn push_text(&self, text: &str) {
        self.push_reply(Ok(Some(text.to_string())));
    }

    pub(crate) fn delay_by(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    /// Every call waits for a permit on the returned semaphore before answering.
    pub(crate) fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("request lock").clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().expect("request lock").len()
    }

    pub(crate) async fn wait_for_calls(&self, count: usize) {
        while self.calls() < count {
            tokio::task::yield_now().await;
        }
    }
}

impl CompletionGateway for ScriptedCompletion {
    fn id(&self) -> &str {
        "scripted"
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, CompletionResult<Option<String>>> {
        Box::pin(async move {
            self.requests.lock().expect("request lock").push(request);

            let gate = self.gate.lock().expect("gate lock").clone();
            if let Some(gate) = gate {
                // Each permit releases exactly one call.
                gate.acquire().await.expect("gate open").forget();
            }
            let delay = *self.delay.lock().expect("delay lock");
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.replies
                .lock()
                .expect("reply lock")
                .pop_front()
                .unwrap_or_else(|| Ok(Some("ok".to_string())))
        })
    }
}

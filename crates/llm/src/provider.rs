use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use snafu::Snafu;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://text.pollinations.ai/openai";
pub const DEFAULT_MODEL: &str = "openai";

/// Role tags accepted by the completion service.
///
/// `System` only ever appears in outbound requests; transcripts never persist it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: CompletionRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: CompletionRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(CompletionRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(CompletionRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(CompletionRole::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// One non-streaming completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<ChatTurn>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type CompletionResult<T> = Result<T, CompletionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompletionError {
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("completion request has no user or assistant messages"))]
    EmptyMessageSet { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("completion did not finish within {after:?}"))]
    Timeout { stage: &'static str, after: Duration },
}

impl CompletionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub trait CompletionGateway: Send + Sync {
    fn id(&self) -> &str;

    /// Returns the first candidate's text, or `None` when the service answered
    /// without usable content.
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, CompletionResult<Option<String>>>;
}

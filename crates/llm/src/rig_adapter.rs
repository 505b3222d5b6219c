use rig::completion::message::AssistantContent;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use super::provider::{
    BoxFuture, ChatTurn, CompletionGateway, CompletionRequest, CompletionResult, CompletionRole,
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, ProviderConfig,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// OpenAI-compatible completion client built on rig.
pub struct RigCompletionGateway {
    config: ProviderConfig,
    client: openai::Client,
}

impl RigCompletionGateway {
    pub fn new(config: ProviderConfig) -> CompletionResult<Self> {
        let client = Self::build_client(&config)?;
        Ok(Self { config, client })
    }

    fn build_client(config: &ProviderConfig) -> CompletionResult<openai::Client> {
        // Keyless endpoints still need a value in the authorization header slot.
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &ChatTurn) -> Option<RigMessage> {
        match turn.role {
            CompletionRole::System => None,
            CompletionRole::User => Some(RigMessage::user(turn.content.clone())),
            CompletionRole::Assistant => Some(RigMessage::assistant(turn.content.clone())),
        }
    }

    fn merged_preamble(request: &CompletionRequest) -> Option<String> {
        // Rig exposes a single preamble field, so every system turn is folded into it.
        let parts = request
            .messages
            .iter()
            .filter(|turn| matches!(turn.role, CompletionRole::System))
            .filter(|turn| !turn.content.trim().is_empty())
            .map(|turn| turn.content.clone())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Joins every text part of the first choice; `None` when it carries no text at all.
    fn choice_text<'c>(choice: impl Iterator<Item = &'c AssistantContent>) -> Option<String> {
        let parts = choice
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }

    async fn request_completion(
        &self,
        request: CompletionRequest,
    ) -> CompletionResult<Option<String>> {
        // The service speaks the chat-completions dialect (`{endpoint}/chat/completions`),
        // not the responses API rig's OpenAI client defaults to.
        let model = self
            .client
            .completion_model(request.model_id.clone())
            .completions_api();

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot request completion because no user/assistant messages remain"
            );
            return EmptyMessageSetSnafu {
                stage: "request-completion-pop-prompt",
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(&request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "send-completion",
        })?;

        let text = Self::choice_text(response.choice.iter());

        tracing::debug!(
            provider_id = %self.config.provider_id,
            model_id = %request.model_id,
            has_text = text.is_some(),
            "completion finished"
        );
        Ok(text)
    }
}

impl CompletionGateway for RigCompletionGateway {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> BoxFuture<'a, CompletionResult<Option<String>>> {
        Box::pin(async move {
            ensure!(
                !request.messages.is_empty(),
                EmptyMessageSetSnafu {
                    stage: "complete-validate",
                }
            );
            self.request_completion(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::provider::CompletionError;

    const CHAT_COMPLETION: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1700000000,"model":"openai","choices":[{"index":0,"message":{"role":"assistant","content":"pong","refusal":null},"logprobs":null,"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":1,"total_tokens":13}}"#;

    struct CapturedRequest {
        head: String,
        body: Vec<u8>,
    }

    async fn read_request(socket: &mut TcpStream) -> CapturedRequest {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];
        let header_end = loop {
            let read = socket.read(&mut chunk).await.expect("read request");
            assert!(read > 0, "connection closed before headers finished");
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                break position + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .map(|(_, value)| value.trim().parse::<usize>().expect("content length"))
            .unwrap_or(0);

        let mut body = buffer[header_end..].to_vec();
        while body.len() < content_length {
            let read = socket.read(&mut chunk).await.expect("read body");
            assert!(read > 0, "connection closed before body finished");
            body.extend_from_slice(&chunk[..read]);
        }
        CapturedRequest { head, body }
    }

    /// Serves one canned HTTP response on localhost and hands back what the client sent.
    async fn serve_once(
        status: &'static str,
        payload: &'static str,
    ) -> (String, tokio::task::JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = format!("http://{}/openai", listener.local_addr().expect("addr"));
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                payload.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
            socket.shutdown().await.expect("shutdown");
            request
        });
        (endpoint, server)
    }

    /// Message content may be a plain string or a list of typed text parts.
    fn content_text(content: &serde_json::Value) -> String {
        match content {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect(),
            other => panic!("unexpected content shape: {other}"),
        }
    }

    fn conversation() -> CompletionRequest {
        CompletionRequest::new(
            "openai",
            vec![
                ChatTurn::system("be brief"),
                ChatTurn::user("first"),
                ChatTurn::assistant("second"),
                ChatTurn::user("third"),
            ],
        )
    }

    #[tokio::test]
    async fn completion_is_posted_as_chat_messages_under_the_endpoint() {
        let (endpoint, server) = serve_once("200 OK", CHAT_COMPLETION).await;
        let gateway =
            RigCompletionGateway::new(ProviderConfig::new("openai", "test-key", endpoint))
                .expect("gateway");

        let reply = gateway.complete(conversation()).await.expect("complete");
        assert_eq!(reply.as_deref(), Some("pong"));

        let request = server.await.expect("server");
        assert!(
            request.head.starts_with("POST /openai/chat/completions "),
            "unexpected request line: {}",
            request.head
        );

        let body: serde_json::Value = serde_json::from_slice(&request.body).expect("json body");
        assert_eq!(body["model"], "openai");
        assert!(body.get("input").is_none());
        let messages = body["messages"].as_array().expect("messages array");
        let turns = messages
            .iter()
            .map(|message| {
                (
                    message["role"].as_str().expect("role").to_string(),
                    content_text(&message["content"]),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            turns,
            vec![
                ("system".to_string(), "be brief".to_string()),
                ("user".to_string(), "first".to_string()),
                ("assistant".to_string(), "second".to_string()),
                ("user".to_string(), "third".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn error_status_surfaces_as_a_failed_completion() {
        let (endpoint, server) =
            serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let gateway = RigCompletionGateway::new(ProviderConfig::new("openai", "", endpoint))
            .expect("gateway");

        let error = gateway
            .complete(conversation())
            .await
            .expect_err("server error");
        assert!(matches!(error, CompletionError::CompletionsFailed { .. }));
        assert!(!error.is_timeout());
        server.await.expect("server");
    }

    #[test]
    fn choice_text_joins_every_text_part() {
        let parts = [
            AssistantContent::text("Hello, "),
            AssistantContent::text("world"),
        ];
        assert_eq!(
            RigCompletionGateway::choice_text(parts.iter()).as_deref(),
            Some("Hello, world")
        );
        assert!(RigCompletionGateway::choice_text(std::iter::empty()).is_none());
    }

    #[test]
    fn system_turns_fold_into_preamble() {
        let request = CompletionRequest::new(
            "openai",
            vec![
                ChatTurn::system("be brief"),
                ChatTurn::user("hi"),
                ChatTurn::system("   "),
                ChatTurn::system("be kind"),
            ],
        );

        assert_eq!(
            RigCompletionGateway::merged_preamble(&request).as_deref(),
            Some("be brief\n\nbe kind")
        );
    }

    #[test]
    fn preamble_is_absent_without_system_turns() {
        let request = CompletionRequest::new("openai", vec![ChatTurn::user("hi")]);
        assert!(RigCompletionGateway::merged_preamble(&request).is_none());
    }

    #[test]
    fn system_turns_are_not_sent_as_chat_messages() {
        assert!(RigCompletionGateway::to_rig_message(&ChatTurn::system("rules")).is_none());
        assert!(RigCompletionGateway::to_rig_message(&ChatTurn::user("hi")).is_some());
        assert!(RigCompletionGateway::to_rig_message(&ChatTurn::assistant("hey")).is_some());
    }
}

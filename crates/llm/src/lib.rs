use std::sync::Arc;

mod provider;
mod rig_adapter;

pub use provider::{
    BoxFuture, ChatTurn, CompletionError, CompletionGateway, CompletionRequest, CompletionResult,
    CompletionRole, DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_PROVIDER_ID, ProviderConfig,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigCompletionGateway};

pub fn create_gateway(mut config: ProviderConfig) -> CompletionResult<Arc<dyn CompletionGateway>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" | "pollinations" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigCompletionGateway::new(config)?))
        }
        _ => Err(CompletionError::UnsupportedProvider {
            stage: "create-gateway",
            provider_id: config.provider_id,
        }),
    }
}

//! services/api/src/adapters/generator_llm.rs
//!
//! This module contains the adapter for the content-generating LLM.
//! It implements the `Generator` port from the `core` crate against any
//! OpenAI-compatible chat completions endpoint.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    },
    Client,
};
use async_trait::async_trait;
use course_engine_core::{
    ports::{Generator, PortError, PortResult},
    prompt::Prompt,
};
use tracing::debug;

/// Upper bound on a single completion; full lesson blocks are the longest unit.
const MAX_COMPLETION_TOKENS: u32 = 4_096;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `Generator` using an OpenAI-compatible LLM.
///
/// Does not derive `Debug`: the client holds the API key.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    /// Builds the client from an API key and an optional non-default base URL.
    pub fn from_key(api_key: &str, base_url: Option<&str>, model: String) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = base_url {
            config = config.with_api_base(base);
        }
        Self::new(Client::with_config(config), model)
    }

    fn build_request(&self, prompt: &Prompt) -> CreateChatCompletionRequest {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(prompt.system.clone()),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.user.clone()),
                name: None,
            }),
        ];
        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_completion_tokens: Some(MAX_COMPLETION_TOKENS),
            ..Default::default()
        }
    }
}

/// Transport and rate-limit failures are worth retrying; everything else is not.
fn map_openai_error(err: OpenAIError) -> PortError {
    match &err {
        OpenAIError::Reqwest(_) => PortError::Unavailable(err.to_string()),
        OpenAIError::ApiError(api_err) => {
            let code = api_err.code.as_deref().unwrap_or("");
            let kind = api_err.r#type.as_deref().unwrap_or("");
            if code == "rate_limit_exceeded" || kind == "rate_limit_error" || code == "server_error"
            {
                PortError::Unavailable(err.to_string())
            } else {
                PortError::Unexpected(err.to_string())
            }
        }
        _ => PortError::Unexpected(err.to_string()),
    }
}

//=========================================================================================
// `Generator` Trait Implementation
//=========================================================================================

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, prompt: &Prompt) -> PortResult<String> {
        let request = self.build_request(prompt);
        debug!(model = %self.model, prompt_chars = prompt.user.len(), "Requesting completion");

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                PortError::Unexpected("Generator response contained no text content.".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_both_prompt_halves() {
        let generator = OpenAiGenerator::from_key("test-key", None, "gpt-4o-mini".into());
        let prompt = Prompt {
            system: "You design personalized courses.".into(),
            user: "Teach me Rust".into(),
        };
        let request = generator.build_request(&prompt);
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
        assert!(matches!(
            &request.messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            &request.messages[1],
            ChatCompletionRequestMessage::User(_)
        ));
        assert_eq!(request.max_completion_tokens, Some(MAX_COMPLETION_TOKENS));
    }
}

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the ordered message list sent to the completion API.
/// Stored turns only ever carry `User` or `Assistant`; `System` appears
/// when the prompt is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String>;
}

/// Which request shape a model id accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelApi {
    Chat,
    LegacyCompletion,
}

/// The two request shapes the completion API exposes. A seam between the
/// negotiation logic and the actual HTTP requests.
#[async_trait]
trait ModelEndpoint: Send + Sync {
    async fn chat(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String>;

    async fn legacy(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String>;
}

pub struct OpenAiClient {
    endpoint: Box<dyn ModelEndpoint>,
    /// Negotiated request shape per model id. Probed lazily on first use,
    /// never re-probed within a process lifetime.
    capabilities: Mutex<HashMap<String, ModelApi>>,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Self {
        Self::with_endpoint(Box::new(OpenAiEndpoint {
            api_base: config.completion_api_base.clone(),
            timeout: Duration::from_secs(config.completion_timeout_secs),
        }))
    }

    fn with_endpoint(endpoint: Box<dyn ModelEndpoint>) -> Self {
        Self {
            endpoint,
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    fn known_api(&self, model: &str) -> Option<ModelApi> {
        self.capabilities.lock().unwrap().get(model).copied()
    }

    fn remember_api(&self, model: &str, api: ModelApi) {
        self.capabilities
            .lock()
            .unwrap()
            .insert(model.to_string(), api);
    }
}

struct OpenAiEndpoint {
    api_base: String,
    timeout: Duration,
}

impl OpenAiEndpoint {
    fn client(&self, api_key: &str) -> Client<OpenAIConfig> {
        let config = OpenAIConfig::new()
            .with_api_base(&self.api_base)
            .with_api_key(api_key);
        Client::with_config(config)
    }
}

#[async_trait]
impl ModelEndpoint for OpenAiEndpoint {
    async fn chat(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String> {
        let client = self.client(api_key);
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(to_chat_messages(messages)?)
            .build()?;

        let response = tokio::time::timeout(self.timeout, client.chat().create(request))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "completion request timed out after {}s",
                    self.timeout.as_secs()
                )
            })??;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("model returned an empty response"))
    }

    async fn legacy(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String> {
        let client = self.client(api_key);
        let request = CreateCompletionRequestArgs::default()
            .model(model)
            .prompt(legacy_prompt(messages))
            .build()?;

        let response = tokio::time::timeout(self.timeout, client.completions().create(request))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "completion request timed out after {}s",
                    self.timeout.as_secs()
                )
            })??;

        response
            .choices
            .first()
            .map(|choice| choice.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| anyhow::anyhow!("model returned an empty response"))
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &self,
        api_key: &str,
        model: &str,
        messages: &[PromptMessage],
    ) -> anyhow::Result<String> {
        match self.known_api(model) {
            Some(ModelApi::Chat) => self.endpoint.chat(api_key, model, messages).await,
            Some(ModelApi::LegacyCompletion) => {
                self.endpoint.legacy(api_key, model, messages).await
            }
            None => match self.endpoint.chat(api_key, model, messages).await {
                Ok(reply) => {
                    self.remember_api(model, ModelApi::Chat);
                    Ok(reply)
                }
                Err(err) => {
                    // Only an API-level rejection hints at the wrong request
                    // shape; transport errors and timeouts propagate as-is.
                    let rejected = err
                        .downcast_ref::<OpenAIError>()
                        .map(|e| matches!(e, OpenAIError::ApiError(_)))
                        .unwrap_or(false);
                    if !rejected {
                        return Err(err);
                    }

                    debug!("Model {} rejected chat shape, probing legacy completions", model);
                    match self.endpoint.legacy(api_key, model, messages).await {
                        Ok(reply) => {
                            info!("Model {} negotiated to legacy completions", model);
                            self.remember_api(model, ModelApi::LegacyCompletion);
                            Ok(reply)
                        }
                        Err(_) => Err(err),
                    }
                }
            },
        }
    }
}

fn to_chat_messages(
    messages: &[PromptMessage],
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let converted = match message.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(message.content.clone())
                .build()?
                .into(),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(message.content.clone())
                .build()?
                .into(),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(message.content.clone())
                .build()?
                .into(),
        };
        out.push(converted);
    }
    Ok(out)
}

/// Flattens the message list into a single prompt for models that only
/// accept the legacy completions shape.
fn legacy_prompt(messages: &[PromptMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        match message.role {
            Role::System => {
                prompt.push_str(&message.content);
                prompt.push_str("\n\n");
            }
            Role::User => {
                prompt.push_str("user: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            Role::Assistant => {
                prompt.push_str("assistant: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
        }
    }
    prompt.push_str("assistant:");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::error::ApiError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Scripted {
        Reply(&'static str),
        ApiRejection,
        TransportFailure,
    }

    impl Scripted {
        fn run(self) -> anyhow::Result<String> {
            match self {
                Scripted::Reply(text) => Ok(text.to_string()),
                Scripted::ApiRejection => Err(OpenAIError::ApiError(ApiError {
                    message: "this model does not accept chat requests".to_string(),
                    r#type: Some("invalid_request_error".to_string()),
                    param: None,
                    code: None,
                })
                .into()),
                Scripted::TransportFailure => Err(anyhow::anyhow!("connection refused")),
            }
        }
    }

    struct FakeEndpoint {
        chat: Scripted,
        legacy: Scripted,
        chat_calls: AtomicUsize,
        legacy_calls: AtomicUsize,
    }

    impl FakeEndpoint {
        fn new(chat: Scripted, legacy: Scripted) -> Self {
            Self {
                chat,
                legacy,
                chat_calls: AtomicUsize::new(0),
                legacy_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelEndpoint for &'static FakeEndpoint {
        async fn chat(
            &self,
            _api_key: &str,
            _model: &str,
            _messages: &[PromptMessage],
        ) -> anyhow::Result<String> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            self.chat.run()
        }

        async fn legacy(
            &self,
            _api_key: &str,
            _model: &str,
            _messages: &[PromptMessage],
        ) -> anyhow::Result<String> {
            self.legacy_calls.fetch_add(1, Ordering::SeqCst);
            self.legacy.run()
        }
    }

    fn negotiating_client(endpoint: &'static FakeEndpoint) -> OpenAiClient {
        OpenAiClient::with_endpoint(Box::new(endpoint))
    }

    fn question() -> Vec<PromptMessage> {
        vec![PromptMessage::new(Role::User, "alice: hi")]
    }

    #[tokio::test]
    async fn test_api_rejection_falls_back_to_legacy_and_sticks() {
        let endpoint: &'static FakeEndpoint = Box::leak(Box::new(FakeEndpoint::new(
            Scripted::ApiRejection,
            Scripted::Reply("legacy reply"),
        )));
        let client = negotiating_client(endpoint);

        let reply = client.complete("sk", "text-davinci-003", &question()).await;
        assert_eq!(reply.unwrap(), "legacy reply");
        assert_eq!(endpoint.chat_calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.legacy_calls.load(Ordering::SeqCst), 1);

        // The negotiated shape is remembered: no chat attempt this time
        let reply = client.complete("sk", "text-davinci-003", &question()).await;
        assert_eq!(reply.unwrap(), "legacy reply");
        assert_eq!(endpoint.chat_calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.legacy_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_errors_propagate_without_probing() {
        let endpoint: &'static FakeEndpoint = Box::leak(Box::new(FakeEndpoint::new(
            Scripted::TransportFailure,
            Scripted::Reply("should never be reached"),
        )));
        let client = negotiating_client(endpoint);

        let err = client
            .complete("sk", "gpt-3.5-turbo", &question())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(endpoint.legacy_calls.load(Ordering::SeqCst), 0);

        // The failure was not cached as a capability either
        assert!(client.known_api("gpt-3.5-turbo").is_none());
    }

    #[tokio::test]
    async fn test_chat_capable_model_makes_one_request_per_call() {
        let endpoint: &'static FakeEndpoint = Box::leak(Box::new(FakeEndpoint::new(
            Scripted::Reply("chat reply"),
            Scripted::Reply("should never be reached"),
        )));
        let client = negotiating_client(endpoint);

        for _ in 0..3 {
            let reply = client.complete("sk", "gpt-3.5-turbo", &question()).await;
            assert_eq!(reply.unwrap(), "chat reply");
        }
        assert_eq!(endpoint.chat_calls.load(Ordering::SeqCst), 3);
        assert_eq!(endpoint.legacy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reports_the_chat_error() {
        let endpoint: &'static FakeEndpoint = Box::leak(Box::new(FakeEndpoint::new(
            Scripted::ApiRejection,
            Scripted::TransportFailure,
        )));
        let client = negotiating_client(endpoint);

        let err = client
            .complete("sk", "broken-model", &question())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<OpenAIError>().is_some());
        // Neither shape worked, so nothing is cached
        assert!(client.known_api("broken-model").is_none());
    }

    #[test]
    fn test_legacy_prompt_layout() {
        let messages = vec![
            PromptMessage::new(Role::System, "Be helpful."),
            PromptMessage::new(Role::User, "alice: hi"),
            PromptMessage::new(Role::Assistant, "hello"),
        ];
        let prompt = legacy_prompt(&messages);
        assert_eq!(
            prompt,
            "Be helpful.\n\nuser: alice: hi\nassistant: hello\nassistant:"
        );
    }

    #[test]
    fn test_role_serde_tags() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn test_chat_message_conversion() {
        let messages = vec![
            PromptMessage::new(Role::System, "sys"),
            PromptMessage::new(Role::User, "u"),
            PromptMessage::new(Role::Assistant, "a"),
        ];
        let converted = to_chat_messages(&messages).unwrap();
        assert_eq!(converted.len(), 3);
        assert!(matches!(
            converted[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(
            converted[2],
            ChatCompletionRequestMessage::Assistant(_)
        ));
    }
}

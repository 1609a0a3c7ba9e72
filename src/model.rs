//! the model boundary.
//!
//! a turn hands the model the system instruction, the temperature, the full
//! history and the tool table. the model answers with either a text stream or
//! a single tool call.
//!
//! - `LlmChatModel`: any `llm` provider. tries structured streaming first and
//!   falls back to one-shot `chat_with_tools`.
//! - `ScriptedModel`: replays queued answers. used offline and in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bevy::log::{debug, info, warn};
use futures_lite::stream::{self, Boxed, Stream, StreamExt};
use serde_json::Value;

use crate::{
    ChatMessage, ChatProvider, ConversationError, FunctionBuilder, LLMBackend, LLMBuilder, LLMError,
    LLMProvider, Role, ServerMessage, StockbotConfig, StreamChoice, StreamDelta, StreamResponse, ToolSpec,
};

/// incremental assistant text, in arrival order.
pub type TextStream = Boxed<Result<String, ConversationError>>;

/// one turn's worth of input.
///
/// `messages` always goes out as-is. `system`, `temperature` and `tools` are
/// read per request only by models that look at them, like `ScriptedModel`.
/// an `llm` provider has them baked in at construction; `LlmChatModel` warns
/// when a request disagrees with what it was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system: String,
    pub temperature: f32,
    pub messages: Vec<ServerMessage>,
    pub tools: Vec<ToolSpec>,
}

/// a structured call as the model produced it, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    /// raw json arguments
    pub arguments: String,
}

pub enum ModelResponse {
    Text(TextStream),
    ToolCall(ToolInvocation),
}

impl std::fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelResponse::Text(_) => f.write_str("Text(..)"),
            ModelResponse::ToolCall(call) => f.debug_tuple("ToolCall").field(call).finish(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, ConversationError>;
}

// ---------------------- llm-backed model ----------------------

/// what a provider was built with.
#[derive(Debug, Clone, PartialEq)]
struct ProviderSettings {
    system: String,
    temperature: f32,
    tools: Vec<&'static str>,
}

impl ProviderSettings {
    /// first request field the provider would ignore, if any.
    fn mismatch(&self, request: &ModelRequest) -> Option<&'static str> {
        if self.system != request.system {
            Some("system prompt")
        } else if self.temperature != request.temperature {
            Some("temperature")
        } else if !self.tools.iter().copied().eq(request.tools.iter().map(|t| t.name.as_str())) {
            Some("tools")
        } else {
            None
        }
    }
}

pub struct LlmChatModel {
    provider: Arc<dyn LLMProvider>,
    stream: bool,
    settings: Option<ProviderSettings>,
}

impl LlmChatModel {
    /// wraps a ready-made provider. system prompt, temperature and tools must
    /// already be configured on it.
    pub fn new(provider: Arc<dyn LLMProvider>, stream: bool) -> Self {
        Self { provider, stream, settings: None }
    }

    /// builds an openai-compatible provider with the system prompt and every
    /// tool in `tools` registered as a function.
    pub fn from_config(
        config: &StockbotConfig,
        system: &str,
        tools: &[ToolSpec],
    ) -> Result<Self, ConversationError> {
        info!(
            target: "bevy_stockbot",
            "build_provider: base_url='{}', model='{}', key_present={}, tools={}",
            config.base_url, config.model, config.has_api_key(), tools.len()
        );
        let mut b = LLMBuilder::new()
            .backend(LLMBackend::OpenAI)
            .base_url(config.provider_base_url())
            .model(config.model.clone())
            .system(system)
            .temperature(config.temperature);
        for spec in tools {
            b = b.function(
                FunctionBuilder::new(spec.name.as_str())
                    .description(spec.description)
                    .json_schema(spec.parameters.clone()),
            );
        }
        if config.has_api_key() {
            b = b.api_key(config.api_key.clone());
        }
        let provider: Arc<dyn LLMProvider> = b
            .build()
            .map_err(|err| ConversationError::Provider(err.to_string()))?
            .into();
        Ok(Self {
            settings: Some(ProviderSettings {
                system: system.to_string(),
                temperature: config.temperature,
                tools: tools.iter().map(|t| t.name.as_str()).collect(),
            }),
            ..Self::new(provider, config.stream)
        })
    }
}

fn to_chat_message(message: &ServerMessage) -> ChatMessage {
    match message.role {
        // bracketed system records read as ui events from the user's side.
        Role::User | Role::System => ChatMessage::user().content(message.content.clone()).build(),
        Role::Assistant => ChatMessage::assistant().content(message.content.clone()).build(),
    }
}

#[async_trait]
impl ChatModel for LlmChatModel {
    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, ConversationError> {
        let messages: Vec<ChatMessage> = request.messages.iter().map(to_chat_message).collect();
        debug!(
            target: "bevy_stockbot",
            "llm request: msgs={} tools={} temperature={} stream={}",
            messages.len(), request.tools.len(), request.temperature, self.stream
        );
        if let Some(field) = self.settings.as_ref().and_then(|s| s.mismatch(&request)) {
            warn!(
                target: "bevy_stockbot",
                "request {field} differs from the provider's; the provider's is used"
            );
        }

        if self.stream {
            match self.provider.chat_stream_struct(&messages).await {
                Ok(s) => return read_structured_stream(s).await,
                Err(err) => {
                    warn!(
                        target: "bevy_stockbot",
                        "structured streaming failed: {err}. falling back to one-shot chat_with_tools()"
                    );
                }
            }
        }

        let resp = self
            .provider
            .chat_with_tools(&messages, self.provider.tools())
            .await?;
        if let Some(call) = resp.tool_calls().and_then(|calls| calls.into_iter().next()) {
            return Ok(ModelResponse::ToolCall(ToolInvocation {
                name: call.function.name,
                arguments: call.function.arguments,
            }));
        }
        let text = resp.text().unwrap_or_default();
        Ok(ModelResponse::Text(stream::once(Ok(text)).boxed()))
    }
}

/// tool call assembled from streamed deltas.
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// reads until the stream commits to text or finishes a tool call.
///
/// text wins as soon as a content delta arrives with no call in progress; the
/// rest of the stream is handed on untouched. tool-call deltas are merged by
/// id, continuation chunks (empty id) extend the last call.
async fn read_structured_stream<S>(mut s: S) -> Result<ModelResponse, ConversationError>
where
    S: Stream<Item = Result<StreamResponse, LLMError>> + Send + Unpin + 'static,
{
    let mut calls: Vec<PartialCall> = Vec::new();
    while let Some(item) = s.next().await {
        let StreamResponse { choices, .. } = item?;
        let mut text = String::new();
        for StreamChoice { delta: StreamDelta { content, tool_calls } } in choices {
            if let Some(content) = content {
                text.push_str(&content);
            }
            for call in tool_calls.unwrap_or_default() {
                let continues = call.id.is_empty() || calls.last().is_some_and(|c| c.id == call.id);
                if !continues || calls.is_empty() {
                    calls.push(PartialCall { id: call.id.clone(), ..Default::default() });
                }
                if let Some(last) = calls.last_mut() {
                    if last.name.is_empty() {
                        last.name = call.function.name.clone();
                    }
                    last.arguments.push_str(&call.function.arguments);
                }
            }
        }
        if !text.is_empty() && calls.is_empty() {
            let rest = s.filter_map(|item| match item {
                Ok(StreamResponse { choices, .. }) => {
                    let text: String = choices.into_iter().filter_map(|c| c.delta.content).collect();
                    (!text.is_empty()).then_some(Ok(text))
                }
                Err(err) => Some(Err(ConversationError::Stream(err.to_string()))),
            });
            return Ok(ModelResponse::Text(stream::once(Ok(text)).chain(rest).boxed()));
        }
    }

    match calls.into_iter().find(|c| !c.name.is_empty()) {
        Some(PartialCall { name, arguments, .. }) => {
            Ok(ModelResponse::ToolCall(ToolInvocation { name, arguments }))
        }
        None => Ok(ModelResponse::Text(stream::empty().boxed())),
    }
}

// ---------------------- scripted model ----------------------

/// one queued answer for `ScriptedModel`.
#[derive(Debug, Clone)]
pub enum Script {
    /// text delivered in these chunks
    Text(Vec<String>),
    /// text chunks that arrive whenever the test sends them; ends when every
    /// sender is dropped
    Live(flume::Receiver<String>),
    /// a structured call with these arguments
    Tool { name: String, arguments: Value },
    /// the request itself fails
    Fail(String),
    /// some chunks, then a stream error
    Broken { chunks: Vec<String>, error: String },
}

impl Script {
    pub fn text<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Script::Text(chunks.into_iter().map(Into::into).collect())
    }

    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        Script::Tool { name: name.into(), arguments }
    }
}

/// replays queued answers in order and keeps every request it saw.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new<I: IntoIterator<Item = Script>>(scripts: I) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            requests: Mutex::default(),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(script);
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, ConversationError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let next = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            None => Err(ConversationError::Model("no scripted response left".into())),
            Some(Script::Fail(reason)) => Err(ConversationError::Model(reason)),
            Some(Script::Text(chunks)) => Ok(ModelResponse::Text(stream::iter(chunks.into_iter().map(Ok)).boxed())),
            Some(Script::Live(rx)) => Ok(ModelResponse::Text(rx.into_stream().map(Ok).boxed())),
            Some(Script::Tool { name, arguments }) => Ok(ModelResponse::ToolCall(ToolInvocation {
                name,
                arguments: arguments.to_string(),
            })),
            Some(Script::Broken { chunks, error }) => {
                let chunks = stream::iter(chunks.into_iter().map(Ok));
                let failure = stream::once(Err(ConversationError::Stream(error)));
                Ok(ModelResponse::Text(chunks.chain(failure).boxed()))
            }
        }
    }
}

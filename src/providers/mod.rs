pub mod anthropic;
pub mod codec;
pub mod error;
pub mod gemini;
pub mod grok;
pub mod openai;
pub mod qwen;
pub mod registry;
pub mod stability;
pub mod streaming;
pub mod transport;

use crate::models::{ChatRequest, ProviderDescriptor};
use async_trait::async_trait;
use codec::WireCodec;
use error::ProviderError;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transport::Transport;

/// Cleaned text deltas in arrival order; ends after the first `Err`
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Uniform streaming contract shared by every assistant.
///
/// Vendor-specific one-shot operations (math, speech, summaries) live on
/// the concrete provider types, not here.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Start a streamed chat completion.
    ///
    /// Fails up front on encoding errors, transport errors and non-2xx
    /// status. Once the stream is returned, failures arrive as its last item.
    /// An empty `request.model_version` selects the descriptor's default model.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TextStream, ProviderError>;
}

/// Fill in the default model when the caller left it empty
pub(crate) fn with_default_model(descriptor: &ProviderDescriptor, mut request: ChatRequest) -> ChatRequest {
    if request.model_version.is_empty() {
        request.model_version = descriptor.default_model().to_string();
    }
    request
}

/// Encode, POST and decode: the streaming pipeline every adapter runs
pub(crate) async fn open_text_stream(
    transport: &Transport,
    path: &str,
    codec: Arc<dyn WireCodec>,
    system_prompt: Option<&str>,
    request: &ChatRequest,
    cancel: CancellationToken,
) -> Result<TextStream, ProviderError> {
    let body = codec.encode_request(system_prompt, request)?;
    tracing::debug!(
        "Chat request: model={}, history={}, images={}",
        request.model_version,
        request.history.len(),
        request.images.len()
    );

    let lines = transport.stream_lines(path, &body, &cancel).await?;
    Ok(streaming::decode_text_stream(
        lines,
        codec,
        cancel,
        transport.idle_timeout(),
    ))
}

// Re-export provider implementations
pub use anthropic::ClaudeProvider;
pub use gemini::GeminiProvider;
pub use grok::GrokProvider;
pub use openai::OpenAiProvider;
pub use qwen::QwenProvider;
pub use registry::ProviderRegistry;
pub use stability::StabilityClient;

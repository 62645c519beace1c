use super::codec::{WireCodec, STOP_SEQUENCES};
use super::error::ProviderError;
use super::openai::{decode_delta_line, OpenAiContentPart, OpenAiMessage, OpenAiRequest};
use super::transport::Transport;
use super::{open_text_stream, with_default_model, ChatProvider, TextStream};
use crate::models::{ChatRequest, ModelOption, ProviderDescriptor, ProviderId, StreamEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const CHAT_PATH: &str = "/api/grok/chat";

const GROK_PROMPT: &str = "You are Grok, a chatbot inspired by the Hitchhikers Guide to the Galaxy.";

/// xAI accepts the OpenAI schema with two differences: prior answers are
/// replayed under the `system` role, and image parts (high detail) come
/// before the prompt text.
#[derive(Debug, Clone, Default)]
pub struct GrokCodec;

impl GrokCodec {
    const ROLE: &'static str = "system";
}

impl WireCodec for GrokCodec {
    fn encode_request(
        &self,
        system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);

        if let Some(prompt) = system_prompt {
            messages.push(OpenAiMessage::text(Self::ROLE, prompt));
        }

        for turn in &request.history {
            messages.push(OpenAiMessage::text("user", &turn.send_text));
            messages.push(OpenAiMessage::text(Self::ROLE, turn.response_or_empty()));
        }

        let mut parts: Vec<OpenAiContentPart> = request
            .images
            .iter()
            .map(|image| OpenAiContentPart::image(image, Some("high")))
            .collect();
        parts.push(OpenAiContentPart::Text {
            text: &request.message,
        });
        messages.push(OpenAiMessage::parts("user", parts));

        let body = OpenAiRequest {
            model: &request.model_version,
            messages,
            stream: Some(true),
            stop: Some(STOP_SEQUENCES),
        };
        Ok(serde_json::to_value(body)?)
    }

    fn decode_chunk(&self, line: &str) -> Option<StreamEvent> {
        decode_delta_line(line)
    }
}

pub struct GrokProvider {
    descriptor: ProviderDescriptor,
    codec: Arc<GrokCodec>,
    transport: Transport,
}

impl GrokProvider {
    pub fn new(transport: Transport) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::Grok,
                title: "Grok",
                description: "Developed by xAI, Grok is an AI chatbot designed to provide real-time and insightful responses with a touch of humor.",
                icon: "grok",
                models: vec![ModelOption { name: "Grok 2", id: "grok-2-vision-1212" }],
                system_prompt: Some(GROK_PROMPT),
            },
            codec: Arc::new(GrokCodec),
            transport,
        }
    }
}

#[async_trait]
impl ChatProvider for GrokProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TextStream, ProviderError> {
        let request = with_default_model(&self.descriptor, request);
        open_text_stream(
            &self.transport,
            CHAT_PATH,
            self.codec.clone(),
            self.descriptor.system_prompt,
            &request,
            cancel,
        )
        .await
    }
}

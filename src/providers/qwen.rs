use super::codec::WireCodec;
use super::error::ProviderError;
use super::openai::{decode_delta_line, OpenAiContentPart, OpenAiMessage, OpenAiRequest};
use super::transport::Transport;
use super::{open_text_stream, with_default_model, ChatProvider, TextStream};
use crate::models::{ChatRequest, ModelOption, ProviderDescriptor, ProviderId, StreamEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const CHAT_PATH: &str = "/api/qwen/chat";

/// DashScope compatible mode: no system turn, no stop sequences, and every
/// turn carries a content part array even for plain text.
#[derive(Debug, Clone, Default)]
pub struct QwenCodec;

impl WireCodec for QwenCodec {
    fn encode_request(
        &self,
        _system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);

        for turn in &request.history {
            messages.push(OpenAiMessage::parts(
                "user",
                vec![OpenAiContentPart::Text {
                    text: &turn.send_text,
                }],
            ));
            messages.push(OpenAiMessage::parts(
                "assistant",
                vec![OpenAiContentPart::Text {
                    text: turn.response_or_empty(),
                }],
            ));
        }

        // each image is pushed to the front, so attachment order is reversed
        let mut parts: Vec<OpenAiContentPart> = request
            .images
            .iter()
            .rev()
            .map(|image| OpenAiContentPart::image(image, None))
            .collect();
        parts.push(OpenAiContentPart::Text {
            text: &request.message,
        });
        messages.push(OpenAiMessage::parts("user", parts));

        let body = OpenAiRequest {
            model: &request.model_version,
            messages,
            stream: Some(true),
            stop: None,
        };
        Ok(serde_json::to_value(body)?)
    }

    fn decode_chunk(&self, line: &str) -> Option<StreamEvent> {
        decode_delta_line(line)
    }
}

pub struct QwenProvider {
    descriptor: ProviderDescriptor,
    codec: Arc<QwenCodec>,
    transport: Transport,
}

impl QwenProvider {
    pub fn new(transport: Transport) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::Qwen,
                title: "Qwen",
                description: "Alibaba's AI assistant, Qwen, utilizes large language models for enterprise and consumer applications.",
                icon: "qwen",
                models: vec![
                    ModelOption { name: "Qwen-VL Max", id: "qwen-vl-max" },
                    ModelOption { name: "Qwen-VL Plus", id: "qwen-vl-plus" },
                ],
                system_prompt: None,
            },
            codec: Arc::new(QwenCodec),
            transport,
        }
    }
}

#[async_trait]
impl ChatProvider for QwenProvider {
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

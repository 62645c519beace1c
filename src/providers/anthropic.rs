use super::codec::{sse_payload, WireCodec, IMAGE_MEDIA_TYPE};
use super::error::ProviderError;
use super::transport::Transport;
use super::{open_text_stream, with_default_model, ChatProvider, TextStream};
use crate::models::{ChatRequest, ModelOption, ProviderDescriptor, ProviderId, StreamEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const CHAT_PATH: &str = "/api/claude/chat";

const MAX_TOKENS: u32 = 2048;

/// Stand-in for a prior turn that never got an answer; Claude rejects empty text
const NO_RESPONSE: &str = "No response was generated.";

/// Anthropic Messages request format
#[derive(Debug, Serialize)]
struct ClaudeRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<ClaudeMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage<'a> {
    role: &'static str,
    content: ClaudeContent<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ClaudeContent<'a> {
    Text(&'a str),
    Blocks(Vec<ClaudeBlock<'a>>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ClaudeBlock<'a> {
    #[serde(rename = "text")]
    Text { text: Cow<'a, str> },
    #[serde(rename = "image")]
    Image { source: ClaudeImageSource<'a> },
}

#[derive(Debug, Serialize)]
struct ClaudeImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: &'a str,
}

/// Streamed event; only `content_block_delta` and `message_stop` matter here
#[derive(Debug, Deserialize)]
struct ClaudeStreamEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    delta: Option<ClaudeDelta>,
}

#[derive(Debug, Deserialize)]
struct ClaudeDelta {
    #[serde(default)]
    text: Option<String>,
}

/// Codec for the Anthropic Messages schema.
///
/// Each attached image is announced by an `Image: N` text block. Pairs are
/// inserted at the front in attachment order, so the last image ends up
/// first and the prompt text stays last.
#[derive(Debug, Clone, Default)]
pub struct ClaudeCodec;

impl WireCodec for ClaudeCodec {
    fn encode_request(
        &self,
        system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);

        for turn in &request.history {
            let answer = match turn.response_text.as_deref() {
                Some(text) if !text.is_empty() => text,
                _ => NO_RESPONSE,
            };
            messages.push(ClaudeMessage {
                role: "user",
                content: ClaudeContent::Text(&turn.send_text),
            });
            messages.push(ClaudeMessage {
                role: "assistant",
                content: ClaudeContent::Text(answer),
            });
        }

        let mut content = vec![ClaudeBlock::Text {
            text: Cow::Borrowed(request.message.as_str()),
        }];
        for (index, image) in request.images.iter().enumerate() {
            content.insert(
                0,
                ClaudeBlock::Text {
                    text: Cow::Owned(format!("Image: {}", index + 1)),
                },
            );
            content.insert(
                1,
                ClaudeBlock::Image {
                    source: ClaudeImageSource {
                        kind: "base64",
                        media_type: IMAGE_MEDIA_TYPE,
                        data: image,
                    },
                },
            );
        }
        messages.push(ClaudeMessage {
            role: "user",
            content: ClaudeContent::Blocks(content),
        });

        let body = ClaudeRequest {
            model: &request.model_version,
            max_tokens: MAX_TOKENS,
            stream: true,
            messages,
            system: system_prompt,
        };
        Ok(serde_json::to_value(body)?)
    }

    fn decode_chunk(&self, line: &str) -> Option<StreamEvent> {
        let payload = sse_payload(line)?;

        match serde_json::from_str::<ClaudeStreamEvent>(payload) {
            Ok(event) if event.kind.as_deref() == Some("message_stop") => {
                Some(StreamEvent::EndOfStream)
            }
            Ok(event) => event.delta?.text.map(StreamEvent::TextDelta),
            Err(e) => {
                tracing::warn!("Skipping malformed Claude stream line: {}", e);
                None
            }
        }
    }
}

pub struct ClaudeProvider {
    descriptor: ProviderDescriptor,
    codec: Arc<ClaudeCodec>,
    transport: Transport,
}

impl ClaudeProvider {
    pub fn new(transport: Transport) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::Claude,
                title: "Claude",
                description: "Claude, created by Anthropic, is an AI assistant designed for safety, reliability, and helpful, insightful conversations.",
                icon: "claude",
                models: vec![
                    ModelOption { name: "Claude 3.7 Sonnet", id: "claude-3-7-sonnet-20250219" },
                    ModelOption { name: "Claude 3.5 Haiku", id: "claude-3-5-haiku-20241022" },
                    ModelOption { name: "Claude 3 Opus", id: "claude-3-opus-20240229" },
                    ModelOption { name: "Claude 3.5 Sonnet", id: "claude-3-5-sonnet-20240620" },
                    ModelOption { name: "Claude 3 Haiku", id: "claude-3-haiku-20240307" },
                ],
                system_prompt: None,
            },
            codec: Arc::new(ClaudeCodec),
            transport,
        }
    }
}

#[async_trait]
impl ChatProvider for ClaudeProvider {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;
    use serde_json::json;

    fn request(message: &str, images: &[&str]) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            images: images.iter().map(|s| s.to_string()).collect(),
            model_version: "claude-3-5-haiku-20241022".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_single_image_golden() {
        let body = ClaudeCodec.encode_request(None, &request("Describe", &["IMG1"])).unwrap();

        let expected = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 2048,
            "stream": true,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Image: 1"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "IMG1"}},
                    {"type": "text", "text": "Describe"}
                ]
            }]
        });
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            serde_json::to_string(&expected).unwrap()
        );
    }

    #[test]
    fn test_encode_two_images_newest_pair_first() {
        let body = ClaudeCodec
            .encode_request(None, &request("Compare", &["A", "B"]))
            .unwrap();
        let content = body["messages"][0]["content"].as_array().unwrap();

        assert_eq!(content.len(), 5);
        assert_eq!(content[0]["text"], "Image: 2");
        assert_eq!(content[1]["source"]["data"], "B");
        assert_eq!(content[2]["text"], "Image: 1");
        assert_eq!(content[3]["source"]["data"], "A");
        assert_eq!(content[4]["text"], "Compare");
    }

    #[test]
    fn test_encode_history_and_system_field() {
        let mut answered = ChatMessage::new("Hi", "claude", vec![]);
        answered.append_response("Hello");
        let mut blank = ChatMessage::new("Anyone?", "claude", vec![]);
        blank.append_response("");

        let req = ChatRequest {
            history: vec![answered, blank],
            ..request("Next", &[])
        };
        let body = ClaudeCodec.encode_request(Some("Be brief."), &req).unwrap();

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1], json!({"role": "assistant", "content": "Hello"}));
        assert_eq!(messages[3], json!({"role": "assistant", "content": NO_RESPONSE}));
        assert_eq!(body["system"], "Be brief.");
        assert!(messages.iter().all(|m| m["role"] != "system"));
    }

    #[test]
    fn test_decode_events() {
        let codec = ClaudeCodec;
        assert_eq!(
            codec.decode_chunk(r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#),
            Some(StreamEvent::TextDelta("Hey".to_string()))
        );
        assert_eq!(codec.decode_chunk(r#"data: {"type":"message_stop"}"#), Some(StreamEvent::EndOfStream));
        assert_eq!(codec.decode_chunk(r#"data: {"type":"message_start","message":{}}"#), None);
        assert_eq!(codec.decode_chunk("event: content_block_delta"), None);
        assert_eq!(codec.decode_chunk("data: {oops"), None);
    }
}

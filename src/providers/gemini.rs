use super::codec::{clean_text, sse_payload, WireCodec, IMAGE_MEDIA_TYPE};
use super::error::ProviderError;
use super::transport::Transport;
use super::{open_text_stream, with_default_model, ChatProvider, TextStream};
use crate::models::{ChatRequest, ModelOption, ProviderDescriptor, ProviderId, StreamEvent};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Gemini accepts at most this many images alongside one prompt
pub const MAX_IMAGES: usize = 3;

const VIDEO_MODEL: &str = "gemini-1.5-flash";
const TOOL_MODEL: &str = "gemini-2.0-flash";

const VIDEO_PROMPT: &str = "You are an advanced AI assistant skilled in summarizing multimedia content. Your task is to watch and analyze the provided YouTube video and generate a clear, concise, and accurate summary of its content. Focus on capturing the main ideas, key points, and any important details while ignoring filler or irrelevant information. Ensure the summary is easy to understand and provides valuable insights to someone who has not watched the video.";
const PDF_PROMPT: &str = "You are an AI assistant specialized in summarizing documents. Your task is to generate a concise, structured, and easy-to-read summary of the provided PDF content.";
const MATH_INSTRUCTION: &str = "Solve this math problem from the image.";
const LYRICS_PROMPT: &str = "You are an elite AI lyrics composer, skilled in crafting poetic and meaningful lyrics across all music genres. You can create song lyrics in any style, including Pop, Rock, Rap, Jazz, Country, or Classical.

Your goal is to:
- **Maintain a coherent structure** (verses, chorus, bridge).
- **Match the requested mood and emotion** (romantic, inspirational, dark, uplifting, etc.).
- **Ensure rhythmic and rhyming patterns** where applicable.
- **Incorporate creative metaphors and storytelling** to enhance depth.

Instructions:
1. Start with an engaging hook if applicable.
2. Maintain consistency in theme and mood.
3. Format lyrics in a **clear and readable** way.
4. If a specific artist or era is provided, emulate that style.
5. Offer variations or refinements upon request.

Example Formats:
- **Pop Song:** 🎤 Catchy hooks, emotional lyrics.
- **Rap Song:** 🎙️ Rhythmic flow, strong rhyme schemes.
- **Jazz Song:** 🎷 Smooth, expressive, and poetic.
- **Rock Song:** 🎸 Energetic, rebellious, and vivid imagery.

Your responses should be **highly engaging, original, and musically expressive**. If needed, ask clarifying questions about the genre, theme, or lyrical inspiration before generating the output.

🔥 Now, let’s compose some magical lyrics! 🎶";

/// Streaming route for a model
pub fn stream_path(model: &str) -> String {
    format!("/api/gemini/models/{}:streamGenerateContent?alt=sse", model)
}

/// One-shot route for a model
pub fn generate_path(model: &str) -> String {
    format!("/api/gemini/models/{}:generateContent", model)
}

/// generateContent request format
#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiInstruction<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    role: &'static str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiInstruction<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum GeminiPart<'a> {
    Text(Cow<'a, str>),
    InlineData(GeminiBlob<'a>),
    FileData(GeminiFile<'a>),
}

impl<'a> GeminiPart<'a> {
    fn text(text: impl Into<Cow<'a, str>>) -> Self {
        GeminiPart::Text(text.into())
    }

    fn jpeg(data: &'a str) -> Self {
        GeminiPart::InlineData(GeminiBlob {
            mime_type: IMAGE_MEDIA_TYPE,
            data: Cow::Borrowed(data),
        })
    }
}

#[derive(Debug, Serialize)]
struct GeminiBlob<'a> {
    mime_type: &'static str,
    data: Cow<'a, str>,
}

#[derive(Debug, Serialize)]
struct GeminiFile<'a> {
    mime_type: &'static str,
    file_uri: &'a str,
}

/// Shape shared by streamed chunks and one-shot responses
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentResponse>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Debug, Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate, `None` when it carries none
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Codec for the native Gemini REST schema.
///
/// Prior turns are replayed as `user`/`model` contents. The final turn
/// carries up to `MAX_IMAGES` inline JPEGs followed by the prompt text;
/// extra images are dropped.
#[derive(Debug, Clone, Default)]
pub struct GeminiCodec;

impl WireCodec for GeminiCodec {
    fn encode_request(
        &self,
        system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut contents = Vec::with_capacity(request.history.len() * 2 + 1);

        for turn in &request.history {
            contents.push(GeminiContent {
                role: "user",
                parts: vec![GeminiPart::text(turn.send_text.as_str())],
            });
            if let Some(answer) = turn.response_text.as_deref().filter(|t| !t.is_empty()) {
                contents.push(GeminiContent {
                    role: "model",
                    parts: vec![GeminiPart::text(answer)],
                });
            }
        }

        if request.images.len() > MAX_IMAGES {
            tracing::warn!(
                "Gemini accepts {} images per message, dropping {}",
                MAX_IMAGES,
                request.images.len() - MAX_IMAGES
            );
        }
        let mut parts: Vec<GeminiPart> = request
            .images
            .iter()
            .take(MAX_IMAGES)
            .map(|image| GeminiPart::jpeg(image))
            .collect();
        parts.push(GeminiPart::text(request.message.as_str()));
        contents.push(GeminiContent {
            role: "user",
            parts,
        });

        let body = GeminiRequest {
            contents,
            system_instruction: system_prompt.map(|prompt| GeminiInstruction {
                parts: vec![GeminiPart::text(prompt)],
            }),
        };
        Ok(serde_json::to_value(body)?)
    }

    /// Gemini has no end sentinel; the stream ends when the body closes
    fn decode_chunk(&self, line: &str) -> Option<StreamEvent> {
        let payload = sse_payload(line)?;

        match serde_json::from_str::<GeminiResponse>(payload) {
            Ok(chunk) => chunk.into_text().map(StreamEvent::TextDelta),
            Err(e) => {
                tracing::warn!("Skipping malformed Gemini stream line: {}", e);
                None
            }
        }
    }
}

pub struct GeminiProvider {
    descriptor: ProviderDescriptor,
    codec: Arc<GeminiCodec>,
    transport: Transport,
}

impl GeminiProvider {
    pub fn new(transport: Transport) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::Gemini,
                title: "Gemini",
                description: "Google's Gemini AI, based on the latest deep learning models, offers advanced reasoning and multimodal capabilities.",
                icon: "gemini",
                models: vec![
                    ModelOption { name: "Gemini 2.0 Flash", id: "gemini-2.0-flash" },
                    ModelOption { name: "Gemini 2.0 Flash Lite", id: "gemini-2.0-flash-lite" },
                    ModelOption { name: "Gemini 1.5 Pro", id: "gemini-1.5-pro" },
                    ModelOption { name: "Gemini 1.5 Flash", id: "gemini-1.5-flash" },
                ],
                system_prompt: None,
            },
            codec: Arc::new(GeminiCodec),
            transport,
        }
    }

    async fn generate(
        &self,
        model: &str,
        parts: Vec<GeminiPart<'_>>,
        operation: &str,
    ) -> Result<String, ProviderError> {
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts,
            }],
            system_instruction: None,
        };

        let response: GeminiResponse = self
            .transport
            .request_json(&generate_path(model), &serde_json::to_value(body)?)
            .await?;

        response
            .into_text()
            .map(|text| clean_text(&text))
            .ok_or_else(|| ProviderError::EmptyResponse(operation.to_string()))
    }

    /// Summarize a (YouTube) video by URL
    pub async fn summarize_video(&self, url: &str) -> Result<String, ProviderError> {
        let parts = vec![
            GeminiPart::FileData(GeminiFile {
                mime_type: "video/mp4",
                file_uri: url,
            }),
            GeminiPart::text(VIDEO_PROMPT),
        ];
        self.generate(VIDEO_MODEL, parts, "summarize-video").await
    }

    /// Summarize a PDF document sent inline
    pub async fn summarize_pdf(&self, pdf: &[u8]) -> Result<String, ProviderError> {
        let parts = vec![
            GeminiPart::InlineData(GeminiBlob {
                mime_type: "application/pdf",
                data: Cow::Owned(general_purpose::STANDARD.encode(pdf)),
            }),
            GeminiPart::text(PDF_PROMPT),
        ];
        self.generate(TOOL_MODEL, parts, "summarize-pdf").await
    }

    /// Solve the math problem shown in a base64 JPEG
    pub async fn solve_math(&self, image_b64: &str) -> Result<String, ProviderError> {
        let parts = vec![GeminiPart::jpeg(image_b64), GeminiPart::text(MATH_INSTRUCTION)];
        self.generate(TOOL_MODEL, parts, "solve-math").await
    }

    pub async fn generate_lyrics(&self, prompt: &str, style: &str) -> Result<String, ProviderError> {
        let parts = vec![
            GeminiPart::text(LYRICS_PROMPT),
            GeminiPart::text(prompt),
            GeminiPart::text(format!("Style: {}", style)),
        ];
        self.generate(TOOL_MODEL, parts, "generate-lyrics").await
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
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
            &stream_path(&request.model_version),
            self.codec.clone(),
            self.descriptor.system_prompt,
            &request,
            cancel,
        )
        .await
    }
}

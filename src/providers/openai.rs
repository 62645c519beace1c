use super::codec::{jpeg_data_url, sse_payload, WireCodec, STOP_SEQUENCES};
use super::error::ProviderError;
use super::transport::Transport;
use super::{open_text_stream, with_default_model, ChatProvider, TextStream};
use crate::models::{ChatRequest, ModelOption, ProviderDescriptor, ProviderId, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Chat route shared by ChatGPT and every persona built on it
pub const CHAT_PATH: &str = "/api/chatgpt/chat";
const MATH_PATH: &str = "/api/chatgpt/solve-math-problem";
const SPEECH_PATH: &str = "/api/chatgpt/generate-audio";

const MATH_MODEL: &str = "gpt-4o-mini";
const SPEECH_MODEL: &str = "tts-1";

const CHATGPT_PROMPT: &str =
    "You are Chat GPT, a helpful assistant. You can answer any questions that user has.";
const CODING_PROMPT: &str = "You are an AI coding assistant, helping users write, debug, and optimize code. You provide explanations for programming concepts, suggest best practices, and generate code snippets in various languages. Whether users need help with algorithms, debugging, or learning new technologies, you offer guidance and support.";
const INVEST_PROMPT: &str = "You are an AI financial advisor, providing users with investment insights, market trends, and strategic advice. You analyze financial data, assess risk factors, and guide users in making informed investment decisions.";
const RECRUITER_PROMPT: &str = "You are an AI recruiter, helping users prepare for job interviews. You simulate real-world interview questions, provide feedback on answers, and offer tips to improve confidence and performance.";
const STORYTELLING_PROMPT: &str = "You are an AI storyteller, helping users craft compelling stories. You generate creative plots, develop engaging characters, and refine narratives in various genres. Whether it's fantasy, sci-fi, mystery, or romance, you assist in bringing ideas to life.";
const MATH_PROMPT: &str = "You are MathGPT, a brilliant and patient math expert. Your role is to help users solve math problems of any kind — from basic arithmetic to advanced calculus, linear algebra, and discrete mathematics. Always explain your reasoning clearly and provide step-by-step solutions when possible.";
const MATH_INSTRUCTION: &str = "Solve this math problem from the image.";

/// OpenAI Chat Completions request format
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<[&'static str; 2]>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage<'a> {
    pub role: &'a str,
    pub content: OpenAiContent<'a>,
}

impl<'a> OpenAiMessage<'a> {
    pub fn text(role: &'a str, text: &'a str) -> Self {
        Self {
            role,
            content: OpenAiContent::Text(text),
        }
    }

    pub fn parts(role: &'a str, parts: Vec<OpenAiContentPart<'a>>) -> Self {
        Self {
            role,
            content: OpenAiContent::Parts(parts),
        }
    }
}

/// Content can be string or array of content parts
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum OpenAiContent<'a> {
    Text(&'a str),
    Parts(Vec<OpenAiContentPart<'a>>),
}

/// Content part (text or image_url)
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum OpenAiContentPart<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: OpenAiImageUrl },
}

impl<'a> OpenAiContentPart<'a> {
    pub fn image(image_b64: &str, detail: Option<&'static str>) -> Self {
        OpenAiContentPart::ImageUrl {
            image_url: OpenAiImageUrl {
                url: jpeg_data_url(image_b64),
                detail,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'static str>,
}

/// One `data: ` chunk of a streamed completion
#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Non-streamed completion, used by the math endpoint
#[derive(Debug, Deserialize)]
struct OpenAiCompletion {
    #[serde(default)]
    choices: Vec<OpenAiCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionChoice {
    message: OpenAiCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one line of an OpenAI style SSE body (`choices[0].delta.content`).
/// Shared by the Grok and Qwen codecs.
pub(crate) fn decode_delta_line(line: &str) -> Option<StreamEvent> {
    let payload = sse_payload(line)?;
    if payload == "[DONE]" {
        return Some(StreamEvent::EndOfStream);
    }

    match serde_json::from_str::<OpenAiStreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()?
            .delta?
            .content
            .map(StreamEvent::TextDelta),
        Err(e) => {
            tracing::warn!("Skipping malformed stream line: {}", e);
            None
        }
    }
}

/// Codec for ChatGPT and the personas that reuse its schema.
///
/// The persona prompt goes out under `system_role`; prior assistant turns
/// are sent back with role `developer`.
#[derive(Debug, Clone)]
pub struct OpenAiCodec {
    system_role: &'static str,
}

impl OpenAiCodec {
    const HISTORY_ROLE: &'static str = "developer";

    pub fn with_role(system_role: &'static str) -> Self {
        Self { system_role }
    }

    pub fn developer() -> Self {
        Self::with_role("developer")
    }
}

impl WireCodec for OpenAiCodec {
    fn encode_request(
        &self,
        system_prompt: Option<&str>,
        request: &ChatRequest,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);

        if let Some(prompt) = system_prompt {
            messages.push(OpenAiMessage::text(self.system_role, prompt));
        }

        for turn in &request.history {
            messages.push(OpenAiMessage::text("user", &turn.send_text));
            messages.push(OpenAiMessage::text(Self::HISTORY_ROLE, turn.response_or_empty()));
        }

        let mut parts = vec![OpenAiContentPart::Text {
            text: &request.message,
        }];
        parts.extend(
            request
                .images
                .iter()
                .map(|image| OpenAiContentPart::image(image, None)),
        );
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

/// Voices accepted by the speech endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechVoice {
    #[default]
    Alloy,
    Echo,
    Fable,
    Onyx,
    Nova,
    Shimmer,
}

impl SpeechVoice {
    pub const ALL: [SpeechVoice; 6] = [
        SpeechVoice::Alloy,
        SpeechVoice::Echo,
        SpeechVoice::Fable,
        SpeechVoice::Onyx,
        SpeechVoice::Nova,
        SpeechVoice::Shimmer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechVoice::Alloy => "alloy",
            SpeechVoice::Echo => "echo",
            SpeechVoice::Fable => "fable",
            SpeechVoice::Onyx => "onyx",
            SpeechVoice::Nova => "nova",
            SpeechVoice::Shimmer => "shimmer",
        }
    }
}

impl std::str::FromStr for SpeechVoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpeechVoice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown voice '{}'", s))
    }
}

/// ChatGPT and the OpenAI-schema personas (coding, investing, interview, storytelling)
pub struct OpenAiProvider {
    descriptor: ProviderDescriptor,
    codec: Arc<OpenAiCodec>,
    transport: Transport,
}

impl OpenAiProvider {
    pub fn new(descriptor: ProviderDescriptor, codec: OpenAiCodec, transport: Transport) -> Self {
        Self {
            descriptor,
            codec: Arc::new(codec),
            transport,
        }
    }

    pub fn chatgpt(transport: Transport) -> Self {
        Self::new(
            ProviderDescriptor {
                id: ProviderId::ChatGpt,
                title: "ChatGPT",
                description: "Powered by OpenAI's GPT-4o model, ChatGPT is an advanced conversational AI designed for natural interactions.",
                icon: "chatgpt",
                models: vec![
                    ModelOption { name: "GPT-4o Mini", id: "gpt-4o-mini" },
                    ModelOption { name: "Omni-3 Mini", id: "o3-mini" },
                    ModelOption { name: "Omni-1", id: "o1" },
                    ModelOption { name: "GPT-4o", id: "gpt-4o" },
                    ModelOption { name: "GPT-4 Turbo", id: "gpt-4-turbo" },
                ],
                system_prompt: Some(CHATGPT_PROMPT),
            },
            OpenAiCodec::developer(),
            transport,
        )
    }

    pub fn coding(transport: Transport) -> Self {
        Self::persona(
            ProviderId::Coding,
            "AI Coding Assistant",
            "Enhance your coding skills with AI-powered assistance. Get help with debugging, code generation, best practices, and learning new programming concepts.",
            "coding_ai",
            CODING_PROMPT,
            "coding_assistant",
            transport,
        )
    }

    pub fn invest(transport: Transport) -> Self {
        Self::persona(
            ProviderId::Invest,
            "Investing Insights",
            "Get AI-powered investment insights, market trends, and financial advice. Make informed decisions to grow your wealth.",
            "investing_ai",
            INVEST_PROMPT,
            "developer",
            transport,
        )
    }

    pub fn recruiter(transport: Transport) -> Self {
        Self::persona(
            ProviderId::Recruiter,
            "Interview Coach",
            "Simulate real interview scenarios with an AI recruiter. Get personalized feedback and expert advice to ace your next job interview.",
            "interview_ai",
            RECRUITER_PROMPT,
            "developer",
            transport,
        )
    }

    pub fn storytelling(transport: Transport) -> Self {
        Self::persona(
            ProviderId::StoryTelling,
            "Storytelling AI",
            "Unleash your creativity with AI-powered storytelling. Generate unique plots, craft immersive narratives, and bring your ideas to life.",
            "storytelling_ai",
            STORYTELLING_PROMPT,
            "storyteller",
            transport,
        )
    }

    // Personas publish no model list and fall back to the default model
    fn persona(
        id: ProviderId,
        title: &'static str,
        description: &'static str,
        icon: &'static str,
        prompt: &'static str,
        system_role: &'static str,
        transport: Transport,
    ) -> Self {
        Self::new(
            ProviderDescriptor {
                id,
                title,
                description,
                icon,
                models: vec![],
                system_prompt: Some(prompt),
            },
            OpenAiCodec::with_role(system_role),
            transport,
        )
    }

    /// Ask MathGPT to solve the problem shown in a base64 JPEG
    pub async fn solve_math(&self, image_b64: &str) -> Result<String, ProviderError> {
        let body = OpenAiRequest {
            model: MATH_MODEL,
            messages: vec![
                OpenAiMessage::text("developer", MATH_PROMPT),
                OpenAiMessage::parts(
                    "user",
                    vec![
                        OpenAiContentPart::Text {
                            text: MATH_INSTRUCTION,
                        },
                        OpenAiContentPart::image(image_b64, None),
                    ],
                ),
            ],
            stream: None,
            stop: Some(STOP_SEQUENCES),
        };

        let completion: OpenAiCompletion = self
            .transport
            .request_json(MATH_PATH, &serde_json::to_value(body)?)
            .await?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ProviderError::EmptyResponse("solve-math-problem".to_string()))
    }

    /// Text to speech; returns the encoded audio (mp3)
    pub async fn generate_speech(&self, text: &str, voice: SpeechVoice) -> Result<Bytes, ProviderError> {
        let body = serde_json::json!({
            "model": SPEECH_MODEL,
            "input": text,
            "voice": voice,
        });

        let audio = self.transport.request(SPEECH_PATH, Some(&body)).await?;
        if audio.is_empty() {
            return Err(ProviderError::EmptyResponse("generate-audio".to_string()));
        }
        tracing::debug!("Received {} bytes of audio", audio.len());
        Ok(audio)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of chat assistants the app can talk to.
///
/// Serialized values match the `apiModelType` field of persisted history
/// so that existing `chat_history.json` files keep loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "chatGpt")]
    ChatGpt,
    #[serde(rename = "grok")]
    Grok,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "recruiter")]
    Recruiter,
    #[serde(rename = "invest")]
    Invest,
    #[serde(rename = "storyTelling")]
    StoryTelling,
    #[serde(rename = "coding")]
    Coding,
}

impl ProviderId {
    pub const ALL: [ProviderId; 9] = [
        ProviderId::ChatGpt,
        ProviderId::Claude,
        ProviderId::Gemini,
        ProviderId::Grok,
        ProviderId::Qwen,
        ProviderId::Coding,
        ProviderId::Invest,
        ProviderId::Recruiter,
        ProviderId::StoryTelling,
    ];

    /// Stable identifier used on the command line and in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::ChatGpt => "chatGpt",
            ProviderId::Grok => "grok",
            ProviderId::Qwen => "qwen",
            ProviderId::Claude => "claude",
            ProviderId::Gemini => "gemini",
            ProviderId::Recruiter => "recruiter",
            ProviderId::Invest => "invest",
            ProviderId::StoryTelling => "storyTelling",
            ProviderId::Coding => "coding",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = String;

    /// Case-insensitive, so `chatgpt` and `chatGpt` both parse
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider '{}'", s))
    }
}

/// Display name to wire id pair for one selectable model version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelOption {
    pub name: &'static str,
    pub id: &'static str,
}

/// Fallback model when a provider publishes no model list
pub const FALLBACK_MODEL: &str = "gpt-4o-mini";

/// Static per-provider metadata, built once at startup
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub title: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    /// Ordered model catalogue (display order)
    pub models: Vec<ModelOption>,
    /// Persona prompt sent with every chat request, if the wire format has a slot for it
    #[serde(skip)]
    pub system_prompt: Option<&'static str>,
}

impl ProviderDescriptor {
    pub fn default_model(&self) -> &'static str {
        self.models.first().map(|m| m.id).unwrap_or(FALLBACK_MODEL)
    }

    /// Resolve a display name or wire id to a wire id.
    /// Unknown values are passed through; the server rejects unknown ids.
    pub fn resolve_model<'a>(&self, name_or_id: &'a str) -> &'a str {
        self.models
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name_or_id))
            .map(|m| m.id)
            .unwrap_or(name_or_id)
    }
}

// Selection UI compares assistants by id and description only
impl PartialEq for ProviderDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.description == other.description
    }
}

impl Eq for ProviderDescriptor {}

impl std::hash::Hash for ProviderDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.description.hash(state);
    }
}

/// One conversation turn: the user's input plus the assistant's (possibly partial) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub send_text: String,
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub response_error: Option<String>,
    pub response_icon: String,
    /// Base64 encoded JPEG attachments
    #[serde(default)]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn new(send_text: impl Into<String>, response_icon: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            send_text: send_text.into(),
            response_text: None,
            response_error: None,
            response_icon: response_icon.into(),
            images,
        }
    }

    /// Append a streamed delta. Response text only ever grows.
    pub fn append_response(&mut self, delta: &str) {
        self.response_text
            .get_or_insert_with(String::new)
            .push_str(delta);
    }

    pub fn response_or_empty(&self) -> &str {
        self.response_text.as_deref().unwrap_or("")
    }
}

/// A persisted conversation, tied to exactly one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub api_model_type: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub date: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(provider: ProviderId, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages,
            api_model_type: provider,
            title: None,
            date: Utc::now(),
        }
    }

    /// Title shown in history lists: user title, else the first prompt
    pub fn display_title(&self) -> String {
        if let Some(ref title) = self.title {
            return title.clone();
        }
        self.messages
            .first()
            .map(|m| m.send_text.chars().take(40).collect())
            .unwrap_or_else(|| "New chat".to_string())
    }
}

/// Canonical chat request handed to a provider adapter
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    /// Prior turns, excluding the message being sent
    pub history: Vec<ChatMessage>,
    /// Base64 encoded images attached to this turn
    pub images: Vec<String>,
    pub model_version: String,
}

/// Canonical unit decoded from one streamed provider line.
///
/// Lines that carry nothing (heartbeats, role-only chunks, malformed JSON)
/// decode to `None` instead; failures travel on the `Err` side of the
/// adapter's text stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    EndOfStream,
}

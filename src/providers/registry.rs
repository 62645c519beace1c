use super::transport::Transport;
use super::{
    ChatProvider, ClaudeProvider, GeminiProvider, GrokProvider, OpenAiProvider, QwenProvider,
    StabilityClient,
};
use crate::models::{ProviderDescriptor, ProviderId};
use std::sync::Arc;

/// Provider registry holding the single adapter instance per assistant.
///
/// Lookup is an exhaustive match over `ProviderId`, so an unknown provider
/// cannot be requested.
pub struct ProviderRegistry {
    chatgpt: Arc<OpenAiProvider>,
    coding: Arc<OpenAiProvider>,
    invest: Arc<OpenAiProvider>,
    recruiter: Arc<OpenAiProvider>,
    storytelling: Arc<OpenAiProvider>,
    claude: Arc<ClaudeProvider>,
    gemini: Arc<GeminiProvider>,
    grok: Arc<GrokProvider>,
    qwen: Arc<QwenProvider>,
    stability: Arc<StabilityClient>,
}

impl ProviderRegistry {
    /// Build every adapter over one shared transport
    pub fn new(transport: Transport) -> Self {
        Self {
            chatgpt: Arc::new(OpenAiProvider::chatgpt(transport.clone())),
            coding: Arc::new(OpenAiProvider::coding(transport.clone())),
            invest: Arc::new(OpenAiProvider::invest(transport.clone())),
            recruiter: Arc::new(OpenAiProvider::recruiter(transport.clone())),
            storytelling: Arc::new(OpenAiProvider::storytelling(transport.clone())),
            claude: Arc::new(ClaudeProvider::new(transport.clone())),
            gemini: Arc::new(GeminiProvider::new(transport.clone())),
            grok: Arc::new(GrokProvider::new(transport.clone())),
            qwen: Arc::new(QwenProvider::new(transport.clone())),
            stability: Arc::new(StabilityClient::new(transport)),
        }
    }

    pub fn get(&self, id: ProviderId) -> Arc<dyn ChatProvider> {
        match id {
            ProviderId::ChatGpt => self.chatgpt.clone(),
            ProviderId::Coding => self.coding.clone(),
            ProviderId::Invest => self.invest.clone(),
            ProviderId::Recruiter => self.recruiter.clone(),
            ProviderId::StoryTelling => self.storytelling.clone(),
            ProviderId::Claude => self.claude.clone(),
            ProviderId::Gemini => self.gemini.clone(),
            ProviderId::Grok => self.grok.clone(),
            ProviderId::Qwen => self.qwen.clone(),
        }
    }

    pub fn descriptor(&self, id: ProviderId) -> ProviderDescriptor {
        self.get(id).descriptor().clone()
    }

    /// Descriptors in catalogue order
    pub fn list_providers(&self) -> Vec<ProviderDescriptor> {
        ProviderId::ALL.iter().map(|id| self.descriptor(*id)).collect()
    }

    /// Concrete ChatGPT adapter, for math and speech
    pub fn openai(&self) -> Arc<OpenAiProvider> {
        self.chatgpt.clone()
    }

    /// Concrete Gemini adapter, for summaries, math and lyrics
    pub fn gemini(&self) -> Arc<GeminiProvider> {
        self.gemini.clone()
    }

    pub fn stability(&self) -> Arc<StabilityClient> {
        self.stability.clone()
    }
}

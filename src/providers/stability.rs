use super::error::ProviderError;
use super::transport::Transport;
use bytes::Bytes;

const GENERATE_PATH: &str = "/api/stability/generate-image";

/// Text to image through the backend's Stability AI route
pub struct StabilityClient {
    transport: Transport,
}

impl StabilityClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    fn generate_path(prompt: &str, aspect_ratio: &str, style: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("prompt", prompt)
            .append_pair("aspectRatio", aspect_ratio)
            .append_pair("style", style)
            .finish();
        format!("{}?{}", GENERATE_PATH, query)
    }

    /// Returns the encoded image exactly as the backend sent it
    pub async fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: &str,
        style: &str,
    ) -> Result<Bytes, ProviderError> {
        let path = Self::generate_path(prompt, aspect_ratio, style);
        let image = self.transport.request(&path, None).await?;

        if image.is_empty() {
            return Err(ProviderError::EmptyResponse("generate-image".to_string()));
        }
        tracing::debug!("Received {} bytes of image data", image.len());
        Ok(image)
    }
}

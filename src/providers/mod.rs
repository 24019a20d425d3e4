pub mod anthropic;
pub mod openai;
pub mod registry;

use std::fmt;

use reqwest::header::{HeaderMap, InvalidHeaderValue};
use serde_json::Value;

use crate::chat::ChatMessage;

// Re-export registry for easier access
pub use registry::ProviderRegistry;

/// Native protocol spoken by an upstream provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// `/v1/chat/completions` style APIs; their stream is already canonical
    OpenAiCompatible,
    /// Anthropic messages API; its event stream must be transcoded
    Anthropic,
}

/// What a single native stream payload means once decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// Incremental assistant text
    Delta(String),
    /// The provider's own end-of-stream signal
    Done,
    /// The provider reported an error inside the stream
    Abort(String),
    /// Anything carrying no text (pings, usage, block boundaries)
    Skip,
}

/// One configured upstream, in priority order inside the registry
///
/// The descriptor is plain configuration; behaviour is dispatched on `kind`.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub model: String,
    /// Force transcoding for OpenAI-compatible upstreams that add extra
    /// fields or events to their stream
    pub normalize_stream: bool,
    api_key: String,
}

impl ProviderDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: ProviderKind,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            model: model.into(),
            normalize_stream: false,
            api_key: api_key.into(),
        }
    }

    pub fn with_normalized_stream(mut self, normalize: bool) -> Self {
        self.normalize_stream = normalize;
        self
    }

    pub fn build_headers(&self) -> Result<HeaderMap, InvalidHeaderValue> {
        match self.kind {
            ProviderKind::OpenAiCompatible => openai::build_headers(&self.api_key),
            ProviderKind::Anthropic => anthropic::build_headers(&self.api_key),
        }
    }

    pub fn build_body(&self, system_prompt: &str, messages: &[ChatMessage]) -> Value {
        match self.kind {
            ProviderKind::OpenAiCompatible => {
                openai::build_body(&self.model, system_prompt, messages)
            }
            ProviderKind::Anthropic => anthropic::build_body(&self.model, system_prompt, messages),
        }
    }

    /// Whether the native stream has to pass through the transcoder
    pub fn needs_transcoding(&self) -> bool {
        self.kind == ProviderKind::Anthropic || self.normalize_stream
    }
}

impl ProviderKind {
    /// Decode one `data:` payload of this provider's native stream
    pub fn interpret(&self, payload: &str) -> Result<NativeEvent, serde_json::Error> {
        match self {
            ProviderKind::OpenAiCompatible => openai::interpret_chunk(payload),
            ProviderKind::Anthropic => anthropic::interpret_event(payload),
        }
    }
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("normalize_stream", &self.normalize_stream)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_api_key() {
        let provider = ProviderDescriptor::new(
            "openai",
            ProviderKind::OpenAiCompatible,
            "https://api.openai.com/v1/chat/completions",
            "sk-secret-value",
            "gpt-3.5-turbo",
        );
        let printed = format!("{:?}", provider);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("sk-secret-value"));
    }

    #[test]
    fn test_transcoding_requirement() {
        let openai = ProviderDescriptor::new("openai", ProviderKind::OpenAiCompatible, "http://x", "k", "m");
        assert!(!openai.needs_transcoding());
        assert!(openai.clone().with_normalized_stream(true).needs_transcoding());

        let anthropic = ProviderDescriptor::new("anthropic", ProviderKind::Anthropic, "http://x", "k", "m");
        assert!(anthropic.needs_transcoding());
    }
}

use crate::{
    config::{ProviderSlot, ProvidersConfig},
    providers::{ProviderDescriptor, ProviderKind},
};

pub const LOVABLE_ENDPOINT: &str = "https://ai.gateway.lovable.dev/v1/chat/completions";
pub const LOVABLE_MODEL: &str = "google/gemini-3-flash-preview";
pub const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_MODEL: &str = "claude-3-haiku-20240307";

/// Ordered list of configured providers
///
/// Position is priority: the relay always walks the list front to back.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    /// 从配置创建提供商注册表
    ///
    /// ## 功能说明
    /// 按固定优先级（lovable → openai → anthropic）检查每个提供商槽位，
    /// 只有配置了非空API密钥的槽位才会被注册
    ///
    /// ## 内部实现逻辑
    /// 1. 遍历配置中的三个提供商槽位
    /// 2. 跳过未设置或空白API密钥的槽位
    /// 3. 使用配置中的端点和模型覆盖默认值
    /// 4. 保持插入顺序，顺序即优先级
    ///
    /// ## 执行例子
    /// ```rust
    /// use ai_chat_proxy::{config::ProvidersConfig, providers::ProviderRegistry};
    ///
    /// let mut providers = ProvidersConfig::default();
    /// providers.anthropic.api_key = Some("ant-key".to_string());
    /// providers.openai.api_key = Some("sk-key".to_string());
    ///
    /// let registry = ProviderRegistry::from_config(&providers);
    /// assert_eq!(registry.names(), vec!["openai", "anthropic"]);
    /// ```
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut providers = Vec::new();

        for (name, slot) in config.slots() {
            let Some(api_key) = slot.credential() else {
                tracing::debug!(provider = name, "Provider has no credentials, skipping");
                continue;
            };

            let (kind, endpoint, model) = match name {
                "lovable" => (ProviderKind::OpenAiCompatible, LOVABLE_ENDPOINT, LOVABLE_MODEL),
                "openai" => (ProviderKind::OpenAiCompatible, OPENAI_ENDPOINT, OPENAI_MODEL),
                _ => (ProviderKind::Anthropic, ANTHROPIC_ENDPOINT, ANTHROPIC_MODEL),
            };

            providers.push(Self::describe(name, kind, slot, api_key, endpoint, model));
        }

        Self { providers }
    }

    fn describe(
        name: &str,
        kind: ProviderKind,
        slot: &ProviderSlot,
        api_key: &str,
        default_endpoint: &str,
        default_model: &str,
    ) -> ProviderDescriptor {
        ProviderDescriptor::new(
            name,
            kind,
            slot.endpoint.as_deref().unwrap_or(default_endpoint),
            api_key,
            slot.model.as_deref().unwrap_or(default_model),
        )
        .with_normalized_stream(slot.normalize_stream)
    }

    /// Build a registry from explicit descriptors, keeping their order
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        Self { providers }
    }

    /// Configured provider names in priority order
    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

//! 文本生成服务
//!
//! `generate` 返回 `Ok(None)` 表示"这次没有结果"，不是错误；管道据此跳过本次回复、保留计数。

pub mod markov;
pub mod mock;

use std::fmt;

use async_trait::async_trait;

use crate::core::GenerationError;
use crate::store::ChannelConfig;

pub use markov::MarkovGenerator;
pub use mock::MockGenerator;

/// 选择用哪个模型生成：全部频道混合的通用模型，或单个频道自己的模型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSelector {
    General,
    Channel(String),
}

impl ModelSelector {
    pub fn for_channel(config: &ChannelConfig) -> Self {
        if config.use_general_text_model {
            ModelSelector::General
        } else {
            ModelSelector::Channel(config.name.clone())
        }
    }

    /// cache_build_times 中的键
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSelector::General => write!(f, "general"),
            ModelSelector::Channel(name) => write!(f, "channel:{}", name),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, selector: &ModelSelector) -> Result<Option<String>, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_follows_channel_config() {
        let mut cfg = ChannelConfig::with_defaults("foo");
        assert_eq!(ModelSelector::for_channel(&cfg), ModelSelector::General);
        cfg.use_general_text_model = false;
        let selector = ModelSelector::for_channel(&cfg);
        assert_eq!(selector.cache_key(), "channel:foo");
    }
}

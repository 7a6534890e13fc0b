//! Mock 文本生成（用于测试）：按脚本依次返回结果，并记录调用

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ModelSelector, TextGenerator};
use crate::core::GenerationError;

#[derive(Debug, Default)]
pub struct MockGenerator {
    /// 脚本用完后的默认回复；None 表示"无结果"
    fallback: Option<String>,
    scripted: Mutex<VecDeque<Option<String>>>,
    calls: Mutex<Vec<ModelSelector>>,
}

impl MockGenerator {
    /// 总是返回同一句话
    pub fn always(sentence: impl Into<String>) -> Self {
        Self {
            fallback: Some(sentence.into()),
            ..Default::default()
        }
    }

    /// 总是无结果
    pub fn empty() -> Self {
        Self::default()
    }

    /// 先按顺序返回脚本里的结果，用完再回落到 fallback
    pub fn push(&self, result: Option<&str>) {
        self.scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(result.map(str::to_string));
    }

    pub fn calls(&self) -> Vec<ModelSelector> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, selector: &ModelSelector) -> Result<Option<String>, GenerationError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(selector.clone());
        let next = self.scripted.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

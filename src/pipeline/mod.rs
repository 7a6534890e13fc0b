//! 消息处理管道
//!
//! 每条入站消息：
//! 1. 丢弃自己发出的消息与忽略名单中的用户
//! 2. 持久化（传输层消息 ID 唯一，重复投递直接返回 Duplicate）
//! 3. 写转录文件、行计数 +1
//! 4. 行数阈值或时间阈值任一满足（0 表示关闭该路径）、或受信任用户发出 `!generate` 时触发回复
//! 5. 生成 -> 发送 -> 记为机器人消息 -> 计数复位；频道开启合成时提交同一消息 ID 的合成任务
//!
//! 生成无结果不是错误：计数保持不变，下一条消息重新判断。
//! 同一频道的消息在按频道的锁下顺序处理，不同频道互不影响。

pub mod transcript;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::cache::ColorCache;
use crate::core::{BotError, ChannelStateManager, KeyedLocks, TransportError};
use crate::store::{normalize_channel, ChannelConfig, NewMessage, Store};
use crate::textgen::{ModelSelector, TextGenerator};
use crate::transport::{ChatTransport, IncomingMessage};
use crate::tts::{JobId, SynthesisCoordinator};

pub use transcript::TranscriptWriter;

/// 受信任用户强制触发回复的聊天命令
pub const GENERATE_COMMAND: &str = "!generate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IgnoreReason {
    SelfAuthored,
    IgnoredUser,
}

/// 一条消息的处理结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineOutcome {
    Ignored(IgnoreReason),
    /// 同一传输层消息 ID 已处理过
    Duplicate,
    /// 已记录，未触发回复
    Recorded { line_count: u32 },
    /// 触发了回复但生成无结果（或短于 response_threshold）
    GenerationEmpty { line_count: u32 },
    Dispatched {
        text: String,
        synthesis_job: Option<JobId>,
    },
}

/// 触发条件：非零的行数阈值或时间阈值先满足的那个
pub fn should_respond(config: &ChannelConfig, line_count: u32, elapsed: Duration) -> bool {
    let by_lines = config.lines_between_messages > 0 && line_count >= config.lines_between_messages;
    let by_time = config.time_between_messages > 0 && elapsed.as_secs() >= config.time_between_messages;
    by_lines || by_time
}

fn meets_threshold(config: &ChannelConfig, sentence: &str) -> bool {
    let threshold = config.response_threshold as usize;
    threshold == 0 || sentence.split_whitespace().count() >= threshold
}

pub struct MessagePipeline {
    store: Store,
    state: Arc<ChannelStateManager>,
    transport: Arc<dyn ChatTransport>,
    generator: Arc<dyn TextGenerator>,
    synthesis: Option<Arc<SynthesisCoordinator>>,
    colors: ColorCache,
    transcripts: Option<TranscriptWriter>,
    nickname: String,
    send_timeout: Duration,
    locks: KeyedLocks,
}

impl MessagePipeline {
    pub fn new(
        store: Store,
        state: Arc<ChannelStateManager>,
        transport: Arc<dyn ChatTransport>,
        generator: Arc<dyn TextGenerator>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            state,
            transport,
            generator,
            synthesis: None,
            colors: ColorCache::new(1024),
            transcripts: None,
            nickname: nickname.into().to_lowercase(),
            send_timeout: Duration::from_secs(10),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_synthesis(mut self, synthesis: Option<Arc<SynthesisCoordinator>>) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn with_transcripts(mut self, transcripts: TranscriptWriter) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    pub fn with_color_capacity(mut self, capacity: usize) -> Self {
        self.colors = ColorCache::new(capacity);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub async fn handle(&self, message: IncomingMessage) -> Result<PipelineOutcome, BotError> {
        let channel = normalize_channel(&message.channel);
        if message.is_self || message.author.eq_ignore_ascii_case(&self.nickname) {
            return Ok(PipelineOutcome::Ignored(IgnoreReason::SelfAuthored));
        }

        let _guard = self.locks.acquire(&channel).await;

        let config = match self.store.get_channel_config(&channel).await? {
            Some(config) => config,
            None => self.store.ensure_channel(&channel).await?,
        };
        if config.is_ignored(&message.author) {
            return Ok(PipelineOutcome::Ignored(IgnoreReason::IgnoredUser));
        }

        let color = self.colors.color_for(&message.author, message.color.as_deref());
        let inserted = self
            .store
            .log_message(&NewMessage {
                channel: channel.clone(),
                author: message.author.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
                is_bot_response: false,
                message_id: message.transport_message_id.clone(),
                author_color: Some(color),
            })
            .await?;
        if !inserted {
            tracing::debug!(channel = %channel, id = ?message.transport_message_id, "Duplicate message ignored");
            return Ok(PipelineOutcome::Duplicate);
        }

        let content = message.content.trim();
        let forced = content.eq_ignore_ascii_case(GENERATE_COMMAND) && config.is_trusted(&message.author);
        if !content.starts_with('!') {
            if let Some(transcripts) = &self.transcripts {
                if let Err(e) = transcripts.append(&channel, content).await {
                    tracing::warn!(channel = %channel, "Failed to append transcript: {}", e);
                }
            }
        }

        let line_count = self.state.increment_line_count(&channel).await;
        let runtime = self.state.get_or_create(&channel).await;
        let elapsed = (Utc::now() - runtime.last_message_time).to_std().unwrap_or(Duration::ZERO);

        if !forced && !should_respond(&config, line_count, elapsed) {
            return Ok(PipelineOutcome::Recorded { line_count });
        }

        let selector = ModelSelector::for_channel(&config);
        let sentence = self
            .generator
            .generate(&selector)
            .await?
            .filter(|s| meets_threshold(&config, s));
        let Some(sentence) = sentence else {
            tracing::debug!(channel = %channel, model = %selector, "Generation produced no usable sentence");
            return Ok(PipelineOutcome::GenerationEmpty { line_count });
        };

        match tokio::time::timeout(self.send_timeout, self.transport.send(&channel, &sentence)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(format!("send to #{}", channel)).into()),
        }

        let dispatched_at = Utc::now();
        let logged = self
            .store
            .log_message(&NewMessage {
                channel: channel.clone(),
                author: self.nickname.clone(),
                content: sentence.clone(),
                timestamp: dispatched_at,
                is_bot_response: true,
                message_id: None,
                author_color: Some(self.colors.color_for(&self.nickname, None)),
            })
            .await;
        if let Err(e) = logged {
            tracing::warn!(channel = %channel, "Dispatched message could not be persisted: {}", e);
        }
        self.state.record_dispatch(&channel, dispatched_at).await;
        tracing::info!(channel = %channel, forced, "Dispatched generated message");

        let synthesis_job = self.submit_synthesis(&config, &message, &sentence).await;
        Ok(PipelineOutcome::Dispatched {
            text: sentence,
            synthesis_job,
        })
    }

    async fn submit_synthesis(&self, config: &ChannelConfig, trigger: &IncomingMessage, sentence: &str) -> Option<JobId> {
        let synthesis = self.synthesis.as_ref().filter(|_| config.tts_enabled)?;
        let message_id = trigger
            .transport_message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match synthesis
            .submit(&config.name, sentence, &message_id, trigger.timestamp, None)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::debug!(channel = %config.name, "Synthesis not scheduled: {}", e);
                None
            }
        }
    }
}

//! 运行时错误类型与恢复动作
//!
//! 每类错误对应一个 RecoveryAction：周期任务边界、邮箱轮询根据它决定是重试、替换连接、隔离还是自愈。

use std::time::Duration;

use thiserror::Error;

/// 存储层错误（连接池、SQLite、序列化）
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Timed out acquiring a pooled connection after {0:?}")]
    PoolTimeout(Duration),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Blocking store task failed: {0}")]
    Join(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// 连接本身已不可用（而非一次普通的语句失败），需要丢弃并重建
    pub fn is_connection_fault(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// 聊天传输错误（join / leave / send）
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Join failed for #{channel}: {reason}")]
    Join { channel: String, reason: String },

    #[error("Leave failed for #{channel}: {reason}")]
    Leave { channel: String, reason: String },

    #[error("Send failed for #{channel}: {reason}")]
    Send { channel: String, reason: String },

    #[error("Transport timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// 文本生成服务错误（"无结果"不是错误，走 Ok(None)）
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 语音合成错误：由协调器转换为 FAILED 任务，不向上传播
#[derive(Error, Debug, Clone)]
pub enum SynthesisError {
    #[error("Speech synthesis is disabled for #{0}")]
    Disabled(String),

    #[error("#{channel} is rate limited, retry in {retry_after:?}")]
    RateLimited { channel: String, retry_after: Duration },

    #[error("Failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Synthesis queue is closed")]
    QueueClosed,
}

/// 跨进程命令桥错误
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Malformed request {file}: {reason}")]
    MalformedRequest { file: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// 机器人运行时的统一错误
#[derive(Error, Debug)]
pub enum BotError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Channel not configured: {0}")]
    ConfigurationMissing(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// 恢复动作：错误发生后调用方应该怎么做
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 记录日志，等下一次周期任务再试
    RetryNextPass,
    /// 丢弃当前连接并替换
    ReplaceConnection,
    /// 不是故障，跳过本次即可
    Skip,
    /// 隔离输入（如邮箱文件），不再原样重试
    Quarantine,
    /// 插入默认配置后继续
    SelfHeal,
}

impl BotError {
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            BotError::Transport(_) | BotError::Timeout(_) => RecoveryAction::RetryNextPass,
            BotError::Store(e) if e.is_connection_fault() => RecoveryAction::ReplaceConnection,
            BotError::Store(_) => RecoveryAction::RetryNextPass,
            BotError::Generation(_) => RecoveryAction::Skip,
            BotError::Synthesis(_) => RecoveryAction::Skip,
            BotError::Bridge(BridgeError::MalformedRequest { .. }) => RecoveryAction::Quarantine,
            BotError::Bridge(_) => RecoveryAction::RetryNextPass,
            BotError::UnknownTask(_) => RecoveryAction::Quarantine,
            BotError::ConfigurationMissing(_) => RecoveryAction::SelfHeal,
        }
    }
}

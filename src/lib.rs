//! Parrot - 多频道聊天机器人运行时
//!
//! 模块划分：
//! - **bridge**: 与管理端进程之间的心跳、请求邮箱、持久命令队列
//! - **cache**: 有界 LRU 缓存（用户颜色等）
//! - **channels**: 期望频道与实际连接的对账
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、频道运行时状态、按键加锁、周期任务调度、优雅关闭
//! - **observability**: 日志初始化
//! - **pipeline**: 入站消息处理与回复触发
//! - **runtime**: 事件循环与周期任务编排
//! - **store**: 共享 SQLite 存储（连接池、增量迁移）
//! - **textgen**: 文本生成服务（马尔可夫链 / Mock）
//! - **transport**: 聊天传输（IRC over WebSocket / Mock）
//! - **tts**: 语音合成协调器与引擎

pub mod bridge;
pub mod cache;
pub mod channels;
pub mod config;
pub mod core;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod textgen;
pub mod transport;
pub mod tts;

pub use runtime::BotRuntime;

//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PARROT__*` 覆盖（双下划线表示嵌套，如 `PARROT__BOT__NICKNAME=parrotbot`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotSection,
    pub transport: TransportSection,
    pub store: StoreSection,
    pub paths: PathsSection,
    pub scheduler: SchedulerSection,
    pub tts: TtsSection,
    pub textgen: TextGenSection,
    pub cache: CacheSection,
}

/// [bot] 段：机器人身份
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotSection {
    /// 登录昵称，也用于识别自己发出的消息
    pub nickname: String,
    /// 形如 `oauth:xxxx` 的令牌，建议通过 PARROT__BOT__OAUTH_TOKEN 注入
    pub oauth_token: Option<String>,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            nickname: "parrotbot".to_string(),
            oauth_token: None,
        }
    }
}

/// [transport] 段：聊天服务器地址与单次操作超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub url: String,
    /// join / leave / send 的超时（秒）
    pub operation_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            url: "ws://irc-ws.chat.twitch.tv:80".to_string(),
            operation_timeout_secs: 10,
        }
    }
}

impl TransportSection {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }
}

/// [store] 段：SQLite 路径与连接池参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    pub pool_size: usize,
    /// 获取连接的超时（秒）
    pub acquire_timeout_secs: u64,
    /// SQLite busy_timeout（毫秒），两个进程并发写时等待锁
    pub busy_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/parrot.db"),
            pool_size: 4,
            acquire_timeout_secs: 10,
            busy_timeout_ms: 5000,
        }
    }
}

/// [paths] 段：心跳文件、邮箱目录、聊天记录与音频目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub heartbeat_file: PathBuf,
    pub mailbox_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub audio_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            heartbeat_file: PathBuf::from("data/heartbeat.json"),
            mailbox_dir: PathBuf::from("data/mailbox"),
            transcripts_dir: PathBuf::from("data/transcripts"),
            audio_dir: PathBuf::from("data/audio"),
        }
    }
}

/// [scheduler] 段：周期任务间隔（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub reconcile_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub command_poll_interval_secs: u64,
    /// 心跳过期窗口 = 间隔 × 该倍数
    pub staleness_multiplier: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 300,
            heartbeat_interval_secs: 10,
            command_poll_interval_secs: 2,
            staleness_multiplier: 3,
        }
    }
}

impl SchedulerSection {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_secs(self.command_poll_interval_secs.max(1))
    }

    pub fn staleness_window(&self) -> Duration {
        self.heartbeat_interval() * self.staleness_multiplier.max(2)
    }
}

/// [tts] 段：语音合成开关、默认音色/模型、限流与外部引擎命令
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsSection {
    pub enabled: bool,
    pub default_voice_preset: String,
    pub default_model: String,
    pub device: String,
    /// 同一频道两次合成之间的最小间隔（秒）
    pub min_interval_secs: u64,
    pub model_cache_capacity: usize,
    /// 单个任务的超时（秒）
    pub job_timeout_secs: u64,
    /// 外部合成程序，参数中可用 {text} {voice} {model} {device} {output}
    pub engine_program: Option<String>,
    pub engine_args: Vec<String>,
}

impl Default for TtsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            default_voice_preset: "v2/en_speaker_6".to_string(),
            default_model: "default".to_string(),
            device: "cpu".to_string(),
            min_interval_secs: 10,
            model_cache_capacity: 2,
            job_timeout_secs: 120,
            engine_program: None,
            engine_args: Vec::new(),
        }
    }
}

impl TtsSection {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.max(1))
    }
}

/// [textgen] 段：Markov 模型参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextGenSection {
    pub model_cache_capacity: usize,
    /// 链的阶数（前缀词数）
    pub state_size: usize,
    pub max_words: usize,
    pub timeout_secs: u64,
    /// 模型至少存活这么久才会因转录更新而重建
    pub rebuild_interval_secs: u64,
}

impl Default for TextGenSection {
    fn default() -> Self {
        Self {
            model_cache_capacity: 16,
            state_size: 2,
            max_words: 30,
            timeout_secs: 20,
            rebuild_interval_secs: 300,
        }
    }
}

impl TextGenSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub color_capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { color_capacity: 1024 }
    }
}

/// 从 config 目录加载配置，环境变量 PARROT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PARROT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PARROT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

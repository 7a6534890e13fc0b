//! 语音合成：协调器（排队、限流、模型缓存）与引擎

pub mod coordinator;
pub mod engine;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::store::Store;

pub use coordinator::{JobId, JobState, SynthesisCoordinator, SynthesisJob, SynthesisSettings};
pub use engine::{CommandSpeechEngine, SpeechEngine, VoiceModel};

/// 按配置构建协调器；未启用或未配置引擎程序时返回 None
pub fn from_config(config: &AppConfig, store: Store, shutdown: CancellationToken) -> Option<Arc<SynthesisCoordinator>> {
    if !config.tts.enabled {
        return None;
    }
    let Some(program) = config.tts.engine_program.as_deref() else {
        tracing::warn!("TTS is enabled but no engine program is configured, speech synthesis disabled");
        return None;
    };
    let engine = CommandSpeechEngine::new(program, config.tts.engine_args.clone(), config.tts.job_timeout());
    Some(SynthesisCoordinator::start(
        SynthesisSettings::from_config(config),
        store,
        Arc::new(engine),
        shutdown,
    ))
}

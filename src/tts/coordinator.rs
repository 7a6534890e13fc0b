//! 语音合成协调器
//!
//! 合成资源不可重入：所有任务进入同一个 FIFO 队列，由单个后台 worker 依次执行，
//! 每个任务执行期间持有全局互斥锁（作用域守卫，任何退出路径都会释放）。
//! 任务状态：Queued -> Running -> Succeeded / Failed。
//!
//! submit 只做校验与入队，调用方不会被合成阻塞：
//! - 全局开关与频道 tts_enabled
//! - 同频道最小间隔限流
//! - 音色优先级：显式覆盖 > 频道偏好 > 全局默认

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::engine::{SpeechEngine, VoiceModel};
use crate::cache::BoundedCache;
use crate::config::AppConfig;
use crate::core::{BotError, SynthesisError};
use crate::store::{normalize_channel, Store, TtsLogEntry};

pub type JobId = u64;

/// 保留最近多少个任务的状态供查询
const JOB_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisJob {
    pub id: JobId,
    pub channel: String,
    pub message_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub voice_preset: String,
    pub model: String,
    pub state: JobState,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub enabled: bool,
    pub default_voice_preset: String,
    pub default_model: String,
    pub device: String,
    pub min_interval: Duration,
    pub model_cache_capacity: usize,
    pub audio_dir: PathBuf,
}

impl SynthesisSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enabled: config.tts.enabled,
            default_voice_preset: config.tts.default_voice_preset.clone(),
            default_model: config.tts.default_model.clone(),
            device: config.tts.device.clone(),
            min_interval: config.tts.min_interval(),
            model_cache_capacity: config.tts.model_cache_capacity,
            audio_dir: config.paths.audio_dir.clone(),
        }
    }
}

type ModelKey = (String, String);

struct Shared {
    store: Store,
    engine: Arc<dyn SpeechEngine>,
    device: String,
    audio_dir: PathBuf,
    models: BoundedCache<ModelKey, Arc<dyn VoiceModel>>,
    jobs: BoundedCache<JobId, SynthesisJob>,
    /// 全局合成锁
    gate: tokio::sync::Mutex<()>,
    finished: Notify,
}

impl Shared {
    fn set_state(&self, job: &mut SynthesisJob, state: JobState) {
        job.state = state;
        self.jobs.insert(job.id, job.clone());
    }

    async fn load_model(&self, model: &str) -> Result<Arc<dyn VoiceModel>, SynthesisError> {
        let key = (model.to_string(), self.device.clone());
        if let Some(loaded) = self.models.get(&key) {
            return Ok(loaded);
        }

        let engine = Arc::clone(&self.engine);
        let (model_id, device) = key.clone();
        let loaded = tokio::task::spawn_blocking(move || engine.load(&model_id, &device))
            .await
            .map_err(|e| SynthesisError::ModelLoad {
                model: model.to_string(),
                reason: e.to_string(),
            })??;

        if let Some(((evicted, evicted_device), _)) = self.models.insert(key.clone(), Arc::clone(&loaded)) {
            if (evicted.as_str(), evicted_device.as_str()) != (key.0.as_str(), key.1.as_str()) {
                tracing::info!(model = %evicted, device = %evicted_device, "Evicted voice model from cache");
            }
        }
        Ok(loaded)
    }

    async fn run(&self, job: &mut SynthesisJob) -> Result<(), SynthesisError> {
        let model = self.load_model(&job.model).await?;

        let output = self
            .audio_dir
            .join(sanitize(&job.channel))
            .join(format!("{}.wav", sanitize(&job.message_id)));
        let text = job.text.clone();
        let voice = job.voice_preset.clone();
        let target = output.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SynthesisError::Inference(format!("cannot create {}: {}", parent.display(), e)))?;
            }
            model.synthesize(&text, &voice, &target)
        })
        .await
        .map_err(|e| SynthesisError::Inference(format!("synthesis task failed: {}", e)))??;

        job.file_path = Some(output.clone());
        let entry = TtsLogEntry {
            message_id: job.message_id.clone(),
            channel: job.channel.clone(),
            timestamp: job.timestamp,
            file_path: output.to_string_lossy().into_owned(),
            voice_preset: job.voice_preset.clone(),
            source_text: job.text.clone(),
        };
        match self.store.log_tts(&entry).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(message_id = %job.message_id, "TTS log already present, keeping existing row")
            }
            Err(e) => return Err(SynthesisError::Inference(format!("failed to record TTS log: {}", e))),
        }
        Ok(())
    }

    /// 执行一个任务；全局锁在作用域结束时释放，成功与失败路径都一样
    async fn execute(&self, mut job: SynthesisJob) {
        let _gate = self.gate.lock().await;
        self.set_state(&mut job, JobState::Running);
        let started = Instant::now();

        match self.run(&mut job).await {
            Ok(()) => {
                self.set_state(&mut job, JobState::Succeeded);
                tracing::info!(
                    job = job.id,
                    channel = %job.channel,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Synthesis job succeeded"
                );
            }
            Err(e) => {
                job.error = Some(e.to_string());
                self.set_state(&mut job, JobState::Failed);
                tracing::warn!(job = job.id, channel = %job.channel, "Synthesis job failed: {}", e);
            }
        }
        self.finished.notify_waiters();
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub struct SynthesisCoordinator {
    settings: SynthesisSettings,
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<SynthesisJob>,
    last_accepted: Mutex<HashMap<String, Instant>>,
    next_id: AtomicU64,
}

impl SynthesisCoordinator {
    /// 创建协调器并启动后台 worker；token 取消后 worker 在当前任务结束后退出
    pub fn start(
        settings: SynthesisSettings,
        store: Store,
        engine: Arc<dyn SpeechEngine>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            store,
            engine,
            device: settings.device.clone(),
            audio_dir: settings.audio_dir.clone(),
            models: BoundedCache::new(settings.model_cache_capacity),
            jobs: BoundedCache::new(JOB_HISTORY),
            gate: tokio::sync::Mutex::new(()),
            finished: Notify::new(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<SynthesisJob>();
        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(job) => worker.execute(job).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("Synthesis worker stopped");
        });

        Arc::new(Self {
            settings,
            shared,
            queue: tx,
            last_accepted: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// 提交一个合成任务，返回任务 ID；不等待合成完成
    pub async fn submit(
        &self,
        channel: &str,
        text: &str,
        message_id: &str,
        timestamp: DateTime<Utc>,
        voice_override: Option<&str>,
    ) -> Result<JobId, BotError> {
        let channel = normalize_channel(channel);
        if !self.settings.enabled {
            return Err(SynthesisError::Disabled(channel).into());
        }
        let config = self.shared.store.get_channel_config(&channel).await?;
        let Some(config) = config.filter(|c| c.tts_enabled) else {
            return Err(SynthesisError::Disabled(channel).into());
        };

        self.check_rate_limit(&channel)?;

        let voice_preset = voice_override
            .map(str::to_string)
            .or(config.voice_preset)
            .unwrap_or_else(|| self.settings.default_voice_preset.clone());
        let model = config
            .synthesis_model
            .unwrap_or_else(|| self.settings.default_model.clone());

        let mut job = SynthesisJob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            channel,
            message_id: message_id.to_string(),
            text: text.to_string(),
            timestamp,
            voice_preset,
            model,
            state: JobState::Queued,
            file_path: None,
            error: None,
        };
        self.shared.set_state(&mut job, JobState::Queued);
        let id = job.id;
        tracing::debug!(job = id, channel = %job.channel, voice = %job.voice_preset, "Synthesis job queued");
        self.queue.send(job).map_err(|_| SynthesisError::QueueClosed)?;
        Ok(id)
    }

    /// 同频道最小间隔；通过检查即记为一次接受
    fn check_rate_limit(&self, channel: &str) -> Result<(), SynthesisError> {
        let mut last = self.last_accepted.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if let Some(prev) = last.get(channel) {
            let since = now.duration_since(*prev);
            if since < self.settings.min_interval {
                return Err(SynthesisError::RateLimited {
                    channel: channel.to_string(),
                    retry_after: self.settings.min_interval - since,
                });
            }
        }
        last.insert(channel.to_string(), now);
        Ok(())
    }

    pub fn job(&self, id: JobId) -> Option<SynthesisJob> {
        self.shared.jobs.get(&id)
    }

    /// 等待任务进入终态
    pub async fn wait_for(&self, id: JobId, timeout: Duration) -> Option<SynthesisJob> {
        let wait = async {
            loop {
                let notified = self.shared.finished.notified();
                match self.job(id) {
                    Some(job) if job.state.is_terminal() => return Some(job),
                    None => return None,
                    Some(_) => notified.await,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub fn loaded_models(&self) -> usize {
        self.shared.models.len()
    }
}

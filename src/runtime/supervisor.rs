//! 机器人运行时
//!
//! 启动顺序：清空存储中的连接标记 -> 连接传输层 -> 立即对账一次 -> 登记周期任务。
//! 周期任务：
//! - `reconcile`: 期望频道与实际连接对账
//! - `heartbeat`: 写心跳（文件 + 存储）
//! - `command_poll`: 轮询请求邮箱与持久命令队列
//!
//! 事件循环把每条入站消息交给独立任务处理，一个频道的失败不影响其它频道。
//! 关闭时取消所有周期任务、关闭传输层，并写一次频道列表为空的最终心跳。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::{CommandBridge, HeartbeatEmitter, PollReport};
use crate::channels::{ChannelLifecycle, ReconcileReport};
use crate::config::AppConfig;
use crate::core::{BotError, ChannelStateManager, PeriodicTask, ShutdownManager, ShutdownReason, TaskScheduler};
use crate::pipeline::{MessagePipeline, PipelineOutcome, TranscriptWriter};
use crate::store::{Heartbeat, Store};
use crate::textgen::TextGenerator;
use crate::transport::{ChatTransport, IncomingMessage, TransportEvent};
use crate::tts::SynthesisCoordinator;

pub const RECONCILE_TASK: &str = "reconcile";
pub const HEARTBEAT_TASK: &str = "heartbeat";
pub const COMMAND_POLL_TASK: &str = "command_poll";

pub struct BotRuntime {
    pub(super) config: AppConfig,
    pub(super) store: Store,
    pub(super) state: Arc<ChannelStateManager>,
    pub(super) transport: Arc<dyn ChatTransport>,
    pub(super) lifecycle: Arc<ChannelLifecycle>,
    pub(super) pipeline: Arc<MessagePipeline>,
    pub(super) synthesis: Option<Arc<SynthesisCoordinator>>,
    pub(super) bridge: CommandBridge,
    pub(super) heartbeat: HeartbeatEmitter,
    pub(super) scheduler: TaskScheduler,
    pub(super) shutdown: Arc<ShutdownManager>,
}

impl BotRuntime {
    pub fn new(
        config: AppConfig,
        store: Store,
        transport: Arc<dyn ChatTransport>,
        generator: Arc<dyn TextGenerator>,
        synthesis: Option<Arc<SynthesisCoordinator>>,
        shutdown: Arc<ShutdownManager>,
    ) -> Arc<Self> {
        let state = Arc::new(ChannelStateManager::new());
        let lifecycle = Arc::new(ChannelLifecycle::new(
            store.clone(),
            Arc::clone(&state),
            Arc::clone(&transport),
            config.transport.operation_timeout(),
        ));
        let pipeline = Arc::new(
            MessagePipeline::new(
                store.clone(),
                Arc::clone(&state),
                Arc::clone(&transport),
                generator,
                config.bot.nickname.clone(),
            )
            .with_synthesis(synthesis.clone())
            .with_transcripts(TranscriptWriter::new(&config.paths.transcripts_dir))
            .with_color_capacity(config.cache.color_capacity)
            .with_send_timeout(config.transport.operation_timeout()),
        );

        Arc::new(Self {
            bridge: CommandBridge::new(&config.paths.mailbox_dir, store.clone()),
            heartbeat: HeartbeatEmitter::new(&config.paths.heartbeat_file, store.clone(), config.bot.nickname.clone()),
            scheduler: TaskScheduler::new(shutdown.token()),
            config,
            store,
            state,
            transport,
            lifecycle,
            pipeline,
            synthesis,
            shutdown,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> &Arc<ChannelStateManager> {
        &self.state
    }

    pub fn lifecycle(&self) -> &Arc<ChannelLifecycle> {
        &self.lifecycle
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// 连接传输层、首次对账并登记周期任务
    pub async fn start(self: &Arc<Self>, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), BotError> {
        let cleared = self.store.clear_connected_flags().await?;
        if cleared > 0 {
            tracing::info!(cleared, "Reset stale connection flags");
        }

        self.transport.connect(events).await?;

        if let Err(e) = self.reconcile_pass().await {
            tracing::warn!("Initial reconcile failed, will retry on schedule: {}", e);
        }

        let scheduling = &self.config.scheduler;
        let rt = Arc::clone(self);
        self.scheduler.spawn(
            PeriodicTask::new(RECONCILE_TASK, scheduling.reconcile_interval(), move || {
                let rt = Arc::clone(&rt);
                async move { rt.reconcile_pass().await.map(|_| ()) }
            })
            .delayed(),
        );

        let rt = Arc::clone(self);
        self.scheduler.spawn(PeriodicTask::new(
            HEARTBEAT_TASK,
            scheduling.heartbeat_interval(),
            move || {
                let rt = Arc::clone(&rt);
                async move { rt.emit_heartbeat().await.map(|_| ()) }
            },
        ));

        let rt = Arc::clone(self);
        self.scheduler.spawn(PeriodicTask::new(
            COMMAND_POLL_TASK,
            scheduling.command_poll_interval(),
            move || {
                let rt = Arc::clone(&rt);
                async move { rt.poll_commands().await.map(|_| ()) }
            },
        ));

        tracing::info!(tasks = ?self.scheduler.task_names(), "Bot runtime started");
        Ok(())
    }

    /// 运行到收到关闭信号为止
    pub async fn run(self: Arc<Self>) -> Result<(), BotError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.start(tx).await?;

        let token = self.shutdown.token();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        self.shutdown.shutdown(ShutdownReason::FatalError("transport event stream ended".into()));
                        break;
                    }
                },
            }
        }

        self.stop().await;
        Ok(())
    }

    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                let rt = Arc::clone(self);
                tokio::spawn(async move {
                    rt.process_message(message).await;
                });
            }
            TransportEvent::Parted { channel } => self.lifecycle.mark_parted(&channel).await,
            TransportEvent::Reconnected => {
                tracing::info!("Transport reconnected, rejoining channels");
                self.lifecycle.mark_all_disconnected().await;
                let rt = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = rt.reconcile_pass().await {
                        tracing::warn!("Reconcile after reconnect failed: {}", e);
                    }
                });
            }
            TransportEvent::Closed { reason } => {
                tracing::warn!("Transport closed: {}", reason);
                self.shutdown.shutdown(ShutdownReason::FatalError(reason));
            }
        }
    }

    /// 处理一条消息；错误只影响这一条
    pub async fn process_message(&self, message: IncomingMessage) -> Option<PipelineOutcome> {
        let channel = message.channel.clone();
        match self.pipeline.handle(message).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(channel = %channel, recovery = ?e.recovery(), "Message handling failed: {}", e);
                None
            }
        }
    }

    pub async fn reconcile_pass(&self) -> Result<ReconcileReport, BotError> {
        self.lifecycle.reconcile().await
    }

    pub async fn emit_heartbeat(&self) -> Result<Heartbeat, BotError> {
        let channels = self.state.snapshot_connected().await.into_iter().collect();
        Ok(self.heartbeat.emit(channels).await?)
    }

    pub async fn poll_commands(&self) -> Result<PollReport, BotError> {
        Ok(self.bridge.poll(self).await?)
    }

    /// 停止周期任务、关闭传输层、写最终心跳
    pub async fn stop(&self) {
        self.scheduler.shutdown().await;
        self.transport.close().await;
        if let Err(e) = self.heartbeat.emit(Vec::new()).await {
            tracing::warn!("Final heartbeat failed: {}", e);
        }
        tracing::info!(reason = ?self.shutdown.reason(), "Bot runtime stopped");
    }
}

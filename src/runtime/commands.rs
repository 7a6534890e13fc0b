//! 管理端命令在机器人进程内的执行

use async_trait::async_trait;
use chrono::Utc;

use super::supervisor::BotRuntime;
use crate::bridge::{BotCommand, CommandHandler};
use crate::channels::{JoinOutcome, LeaveOutcome};
use crate::core::{BotError, SynthesisError, TransportError};
use crate::store::{normalize_channel, NewMessage};

#[async_trait]
impl CommandHandler for BotRuntime {
    async fn execute(&self, command: &BotCommand) -> Result<String, BotError> {
        match command {
            BotCommand::Join { channel } => match self.lifecycle.join_channel(channel).await? {
                JoinOutcome::Joined => Ok(format!("joined #{}", normalize_channel(channel))),
                JoinOutcome::AlreadyJoined => Ok(format!("already in #{}", normalize_channel(channel))),
            },
            BotCommand::Leave { channel } => match self.lifecycle.leave_channel(channel).await? {
                LeaveOutcome::Left => Ok(format!("left #{}", normalize_channel(channel))),
                LeaveOutcome::NotJoined => Ok(format!("not in #{}", normalize_channel(channel))),
            },
            BotCommand::Send { channel, text } => self.send_as_bot(channel, text).await,
            BotCommand::Speak { channel, text, voice } => {
                let channel = normalize_channel(channel);
                // 管理端代说需要频道打开 voice_enabled；回复的自动合成只看 tts_enabled
                let config = self.store.ensure_channel(&channel).await?;
                if !config.voice_enabled {
                    return Err(SynthesisError::Disabled(channel).into());
                }
                let synthesis = self
                    .synthesis
                    .as_ref()
                    .ok_or_else(|| SynthesisError::Disabled(channel.clone()))?;
                let message_id = format!("admin-{}", uuid::Uuid::new_v4());
                let job = synthesis
                    .submit(&channel, text, &message_id, Utc::now(), voice.as_deref())
                    .await?;
                Ok(format!("queued synthesis job {}", job))
            }
            BotCommand::RestartTask { task } => {
                self.scheduler.restart(task)?;
                Ok(format!("restarted task {}", task))
            }
            BotCommand::RefreshChannel { channel } => {
                let channel = normalize_channel(channel);
                let config = self.store.ensure_channel(&channel).await?;
                self.state.reset_counters(&channel).await;
                Ok(format!(
                    "refreshed #{} (lines={}, seconds={}, tts={})",
                    channel, config.lines_between_messages, config.time_between_messages, config.tts_enabled
                ))
            }
        }
    }
}

impl BotRuntime {
    /// 管理端代发消息：只发往已连接的频道，并记为机器人消息
    async fn send_as_bot(&self, channel: &str, text: &str) -> Result<String, BotError> {
        let channel = normalize_channel(channel);
        let connected = self.state.get(&channel).await.is_some_and(|s| s.connected);
        if !connected {
            return Err(TransportError::Send {
                channel,
                reason: "not joined".to_string(),
            }
            .into());
        }

        let timeout = self.config.transport.operation_timeout();
        match tokio::time::timeout(timeout, self.transport.send(&channel, text)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(format!("send to #{}", channel)).into()),
        }

        self.store
            .log_message(&NewMessage {
                channel: channel.clone(),
                author: self.config.bot.nickname.to_lowercase(),
                content: text.to_string(),
                timestamp: Utc::now(),
                is_bot_response: true,
                message_id: None,
                author_color: None,
            })
            .await?;
        Ok(format!("sent to #{}", channel))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::AppConfig;
    use crate::core::ShutdownManager;
    use crate::store::{ChannelConfig, Store};
    use crate::textgen::MockGenerator;
    use crate::transport::MockTransport;
    use crate::tts::{SpeechEngine, SynthesisCoordinator, SynthesisSettings, VoiceModel};

    struct SilentEngine;

    struct SilentModel;

    impl SpeechEngine for SilentEngine {
        fn load(&self, _model_id: &str, _device: &str) -> Result<Arc<dyn VoiceModel>, SynthesisError> {
            Ok(Arc::new(SilentModel))
        }
    }

    impl VoiceModel for SilentModel {
        fn synthesize(&self, _text: &str, _voice: &str, output: &Path) -> Result<(), SynthesisError> {
            std::fs::write(output, b"RIFF").map_err(|e| SynthesisError::Inference(e.to_string()))
        }
    }

    async fn runtime() -> (TempDir, Arc<MockTransport>, Arc<BotRuntime>) {
        runtime_with(false).await
    }

    async fn runtime_with(speech: bool) -> (TempDir, Arc<MockTransport>, Arc<BotRuntime>) {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.store.path = dir.path().join("parrot.db");
        config.paths.mailbox_dir = dir.path().join("mailbox");
        config.paths.heartbeat_file = dir.path().join("heartbeat.json");
        config.paths.transcripts_dir = dir.path().join("transcripts");
        config.paths.audio_dir = dir.path().join("audio");
        let store = Store::from_config(&config.store).await.unwrap();
        let transport = Arc::new(MockTransport::new());
        let shutdown = Arc::new(ShutdownManager::new());
        let synthesis = speech.then(|| {
            let mut settings = SynthesisSettings::from_config(&config);
            settings.enabled = true;
            SynthesisCoordinator::start(settings, store.clone(), Arc::new(SilentEngine), shutdown.token())
        });
        let rt = BotRuntime::new(
            config,
            store,
            transport.clone(),
            Arc::new(MockGenerator::empty()),
            synthesis,
            shutdown,
        );
        (dir, transport, rt)
    }

    #[tokio::test]
    async fn test_join_send_leave() {
        let (_dir, transport, rt) = runtime().await;
        let out = rt.execute(&BotCommand::Join { channel: "#Foo".into() }).await.unwrap();
        assert_eq!(out, "joined #foo");

        rt.execute(&BotCommand::Send {
            channel: "foo".into(),
            text: "hello chat".into(),
        })
        .await
        .unwrap();
        assert_eq!(transport.sent(), vec![("foo".to_string(), "hello chat".to_string())]);
        let history = rt.store().recent_messages("foo", 10).await.unwrap();
        assert!(history[0].is_bot_response);

        assert_eq!(rt.execute(&BotCommand::Leave { channel: "foo".into() }).await.unwrap(), "left #foo");
    }

    #[tokio::test]
    async fn test_send_to_unjoined_channel_fails() {
        let (_dir, transport, rt) = runtime().await;
        let err = rt
            .execute(&BotCommand::Send {
                channel: "foo".into(),
                text: "hi".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Transport(_)));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_speak_without_synthesis_is_disabled() {
        let (_dir, _transport, rt) = runtime().await;
        let err = rt
            .execute(&BotCommand::Speak {
                channel: "foo".into(),
                text: "hi".into(),
                voice: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Synthesis(SynthesisError::Disabled(_))));
    }

    #[tokio::test]
    async fn test_speak_requires_voice_enabled() {
        let (_dir, _transport, rt) = runtime_with(true).await;
        let mut cfg = ChannelConfig::with_defaults("foo");
        cfg.tts_enabled = true;
        rt.store().upsert_channel_config(&cfg).await.unwrap();

        let speak = BotCommand::Speak {
            channel: "foo".into(),
            text: "ahoy".into(),
            voice: None,
        };
        let err = rt.execute(&speak).await.unwrap_err();
        assert!(matches!(err, BotError::Synthesis(SynthesisError::Disabled(_))));

        cfg.voice_enabled = true;
        rt.store().upsert_channel_config(&cfg).await.unwrap();
        let out = rt.execute(&speak).await.unwrap();
        assert!(out.starts_with("queued synthesis job"));
    }

    #[tokio::test]
    async fn test_refresh_resets_counters() {
        let (_dir, _transport, rt) = runtime().await;
        rt.state().increment_line_count("foo").await;
        rt.execute(&BotCommand::RefreshChannel { channel: "foo".into() }).await.unwrap();
        assert_eq!(rt.state().get("foo").await.unwrap().chat_line_count, 0);
    }

    #[tokio::test]
    async fn test_restart_unknown_task() {
        let (_dir, _transport, rt) = runtime().await;
        let err = rt
            .execute(&BotCommand::RestartTask { task: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::UnknownTask(_)));
    }
}

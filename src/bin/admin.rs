//! parrot-admin：管理端命令行
//!
//! 与机器人进程共享 SQLite 与磁盘目录：读操作直接查存储，需要在机器人内执行的动作写请求文件 + 入队。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parrot::bridge::{AdminClient, BotCommand};
use parrot::config::load_config;
use parrot::observability;

#[derive(Parser, Debug)]
#[command(name = "parrot-admin", about = "Administer a running parrot bot")]
struct Cli {
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 机器人是否存活（依据心跳）
    Status,
    /// 频道概览
    Channels,
    /// 最近的聊天记录
    History {
        channel: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// 显示语音合成记录而不是聊天记录
        #[arg(long)]
        tts: bool,
    },
    Join {
        channel: String,
    },
    Leave {
        channel: String,
    },
    Send {
        channel: String,
        text: String,
    },
    Speak {
        channel: String,
        text: String,
        #[arg(long)]
        voice: Option<String>,
    },
    /// 重启周期任务（reconcile / heartbeat / command_poll）
    RestartTask {
        task: String,
    },
    /// 修改频道配置，未给出的字段保持不变
    Configure {
        channel: String,
        #[arg(long)]
        lines: Option<u32>,
        #[arg(long)]
        seconds: Option<u64>,
        #[arg(long)]
        tts: Option<bool>,
        /// 允许管理端 speak 代说
        #[arg(long)]
        speak: Option<bool>,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        general_model: Option<bool>,
        #[arg(long)]
        threshold: Option<u32>,
        #[arg(long = "ignore")]
        ignore: Vec<String>,
    },
    Trust {
        channel: String,
        user: String,
    },
    Untrust {
        channel: String,
        user: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    observability::init_with_default("warn");
    let cli = Cli::parse();
    let config = load_config(cli.config).context("Failed to load configuration")?;
    let client = AdminClient::from_config(&config)
        .await
        .context("Failed to open store")?;

    match cli.command {
        Command::Status => {
            let liveness = client.liveness().await;
            println!("{}", if liveness.live { "bot live" } else { "bot not live" });
            if let Some(hb) = liveness.last {
                println!("{}", serde_json::to_string_pretty(&hb)?);
            }
        }
        Command::Channels => {
            for summary in client.channel_summaries().await? {
                let cfg = &summary.config;
                println!(
                    "#{:<24} join={:<5} connected={:<5} tts={:<5} speak={:<5} lines={:<4} secs={:<5} messages={}",
                    cfg.name,
                    cfg.desired_join,
                    cfg.currently_connected,
                    cfg.tts_enabled,
                    cfg.voice_enabled,
                    cfg.lines_between_messages,
                    cfg.time_between_messages,
                    summary.message_count
                );
            }
        }
        Command::History { channel, limit, tts } => {
            if tts {
                for entry in client.tts_history(&channel, limit).await? {
                    println!("{} [{}] {} -> {}", entry.timestamp, entry.voice_preset, entry.source_text, entry.file_path);
                }
            } else {
                for msg in client.history(&channel, limit).await? {
                    let marker = if msg.is_bot_response { "*" } else { " " };
                    println!("{} {}{}: {}", msg.timestamp, marker, msg.author, msg.content);
                }
            }
        }
        Command::Join { channel } => issue(&client, BotCommand::Join { channel }).await?,
        Command::Leave { channel } => issue(&client, BotCommand::Leave { channel }).await?,
        Command::Send { channel, text } => issue(&client, BotCommand::Send { channel, text }).await?,
        Command::Speak { channel, text, voice } => {
            issue(&client, BotCommand::Speak { channel, text, voice }).await?
        }
        Command::RestartTask { task } => {
            let path = client.request_task_restart(&task).await?;
            println!("restart requested: {}", path.display());
        }
        Command::Configure {
            channel,
            lines,
            seconds,
            tts,
            speak,
            voice,
            model,
            general_model,
            threshold,
            ignore,
        } => {
            let mut cfg = client.channel_config(&channel).await?;
            if let Some(v) = lines {
                cfg.lines_between_messages = v;
            }
            if let Some(v) = seconds {
                cfg.time_between_messages = v;
            }
            if let Some(v) = tts {
                cfg.tts_enabled = v;
            }
            if let Some(v) = speak {
                cfg.voice_enabled = v;
            }
            if let Some(v) = voice {
                cfg.voice_preset = Some(v);
            }
            if let Some(v) = model {
                cfg.synthesis_model = Some(v);
            }
            if let Some(v) = general_model {
                cfg.use_general_text_model = v;
            }
            if let Some(v) = threshold {
                cfg.response_threshold = v;
            }
            if !ignore.is_empty() {
                cfg.ignored_users = ignore.into_iter().map(|u| u.to_lowercase()).collect();
            }
            client.configure(&cfg).await?;
            issue(&client, BotCommand::RefreshChannel { channel: cfg.name.clone() }).await?;
        }
        Command::Trust { channel, user } => {
            let added = client.trust(&channel, &user).await?;
            println!("{}", if added { "trusted" } else { "already trusted" });
        }
        Command::Untrust { channel, user } => {
            let removed = client.untrust(&channel, &user).await?;
            println!("{}", if removed { "removed" } else { "not trusted" });
        }
    }
    Ok(())
}

async fn issue(client: &AdminClient, command: BotCommand) -> anyhow::Result<()> {
    let request = client.issue(command).await.context("Failed to issue command")?;
    println!("queued {} ({})", request.command.name(), request.request_id);
    Ok(())
}

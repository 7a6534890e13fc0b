//! Parrot 机器人进程
//!
//! 入口：初始化日志、加载配置、打开共享存储，组装传输层 / 文本生成 / 语音合成并运行到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parrot::config::load_config;
use parrot::core::ShutdownManager;
use parrot::store::Store;
use parrot::textgen::MarkovGenerator;
use parrot::transport::irc::{IrcConfig, IrcTransport};
use parrot::{observability, tts, BotRuntime};

#[derive(Parser, Debug)]
#[command(name = "parrot", about = "Multi-channel chat bot runtime")]
struct Args {
    /// 额外的配置文件，覆盖 config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// 单线程协作式调度；阻塞工作（SQLite、合成、模型编译）交给 spawn_blocking
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();

    let config = load_config(args.config).context("Failed to load configuration")?;
    for dir in [&config.paths.mailbox_dir, &config.paths.transcripts_dir, &config.paths.audio_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create store directory")?;
    }

    let store = Store::from_config(&config.store)
        .await
        .context("Failed to open store")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let transport = Arc::new(IrcTransport::new(IrcConfig::from_app_config(&config)));
    let generator = Arc::new(MarkovGenerator::from_config(&config, store.clone()));
    let synthesis = tts::from_config(&config, store.clone(), shutdown.token());

    tracing::info!(
        nickname = %config.bot.nickname,
        tts = synthesis.is_some(),
        "Starting parrot"
    );
    let runtime = BotRuntime::new(config, store, transport, generator, synthesis, Arc::clone(&shutdown));
    runtime.run().await.context("Bot runtime failed")?;

    Ok(())
}

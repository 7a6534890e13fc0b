//! 日志初始化：默认 info，可通过 RUST_LOG 覆盖

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// 指定默认过滤指令；重复初始化（如测试中）时静默忽略
pub fn init_with_default(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

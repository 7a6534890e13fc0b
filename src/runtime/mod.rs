//! 机器人运行时：事件循环、周期任务与命令执行

mod commands;
pub mod supervisor;

pub use supervisor::{BotRuntime, COMMAND_POLL_TASK, HEARTBEAT_TASK, RECONCILE_TASK};

//! 核心层：错误与恢复、频道运行时状态、按键加锁、周期任务调度、关闭信号

pub mod error;
pub mod keyed_lock;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{
    BotError, BridgeError, GenerationError, RecoveryAction, StoreError, SynthesisError,
    TransportError,
};
pub use keyed_lock::KeyedLocks;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{ChannelRuntimeState, ChannelStateManager};
pub use task_scheduler::{PeriodicTask, TaskScheduler};

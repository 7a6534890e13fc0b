//! 频道管理

pub mod lifecycle;

pub use lifecycle::{ChannelLifecycle, JoinOutcome, LeaveOutcome, ReconcileReport};

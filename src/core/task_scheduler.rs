//! 周期任务调度：按名称登记、每轮结束后重新排期、支持单独重启
//!
//! 任务的一次执行失败（返回 Err 或 panic）只记日志，下一轮照常执行；
//! restart 取消旧循环的 token 并按原参数重新启动，不影响其它任务。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{BotError, RecoveryAction};

/// 单次执行返回的 future
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), BotError>> + Send>>;

/// 任务体：每轮调用一次
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// 周期任务定义
#[derive(Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub interval: Duration,
    /// 启动后是否立即执行一轮
    pub run_immediately: bool,
    pub body: TaskFn,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BotError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            run_immediately: true,
            body: Arc::new(move || Box::pin(body())),
        }
    }

    pub fn delayed(mut self) -> Self {
        self.run_immediately = false;
        self
    }
}

struct RunningTask {
    task: PeriodicTask,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 周期任务登记表
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, RunningTask>>,
    /// 全局关闭 token；每个任务的 token 都是它的子 token
    shutdown: CancellationToken,
}

impl TaskScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// 启动并登记任务；同名任务已存在时先取消旧的
    pub fn spawn(&self, task: PeriodicTask) {
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(run_loop(task.clone(), token.clone()));
        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task.name.clone(), RunningTask { task, token, handle });
        if let Some(old) = previous {
            old.token.cancel();
        }
    }

    /// 取消并按原参数重新启动指定任务
    pub fn restart(&self, name: &str) -> Result<(), BotError> {
        let task = {
            let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            let task = tasks
                .get(name)
                .ok_or_else(|| BotError::UnknownTask(name.to_string()))?;
            task.task.clone()
        };
        tracing::info!(task = name, "Restarting periodic task");
        self.spawn(task);
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// 取消所有任务并等待它们退出
    pub async fn shutdown(&self) {
        let drained: Vec<RunningTask> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain().map(|(_, t)| t).collect()
        };
        for task in &drained {
            task.token.cancel();
        }
        for task in drained {
            let _ = task.handle.await;
        }
    }
}

async fn run_loop(task: PeriodicTask, token: CancellationToken) {
    let mut interval = tokio::time::interval(task.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    if !task.run_immediately {
        interval.tick().await;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let outcome = AssertUnwindSafe((task.body)()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => match e.recovery() {
                RecoveryAction::Skip => tracing::debug!(task = %task.name, "Task pass skipped: {}", e),
                _ => tracing::warn!(task = %task.name, "Task pass failed, will retry next pass: {}", e),
            },
            Err(_) => {
                tracing::error!(task = %task.name, "Task pass panicked, rescheduling");
            }
        }
    }
    tracing::debug!(task = %task.name, "Periodic task stopped");
}

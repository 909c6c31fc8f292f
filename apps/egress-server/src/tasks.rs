use futures_util::FutureExt;
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Background tasks owned by the process, joined on shutdown.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    /// Give every task up to `grace` to finish on its own, then abort it.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                }
            }
        }
    }
}

/// Spawn a background task that restarts on panic with exponential backoff.
/// Use for long-running loops that should survive transient failures.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        // thrash detection window
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            match std::panic::AssertUnwindSafe(factory()).catch_unwind().await {
                Ok(()) => {
                    tracing::debug!(task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(_) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                        backoff_ms = 200;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    tracing::error!(
                        task = %name_for_task,
                        backoff_ms,
                        restarts_in_window,
                        "supervised task panicked; restarting"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}

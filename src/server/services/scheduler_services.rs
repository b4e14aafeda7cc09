use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// wraps an async closure into a schedulable task
pub fn task<F, Fut>(f: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

struct ScheduledEntry {
    generation: u64,
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

struct SchedulerInner {
    tasks: Mutex<HashMap<String, ScheduledEntry>>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

/// named timers. an id is either pending or free, adding a pending id does nothing
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduledEntry>> {
        self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// runs `task` once after `delay`. the id is freed right before the task runs, so a task
    /// may schedule itself again. returns false when the id was already pending
    pub fn add(&self, id: &str, delay: Duration, task: TaskFn) -> bool {
        let mut tasks = self.tasks();
        if self.inner.shutdown.is_cancelled() {
            debug!("scheduler stopped, dropping task {}", id);
            return false;
        }
        if tasks.contains_key(id) {
            debug!("task {} already pending", id);
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        let scheduler = self.clone();
        let task_id = id.to_string();
        let wait = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = wait.cancelled() => {
                    debug!("task {} cancelled before running", task_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            scheduler.release(&task_id, generation);
            run_logged(&task_id, &task).await;
        });

        tasks.insert(
            id.to_string(),
            ScheduledEntry {
                generation,
                token,
                _handle: handle,
            },
        );
        debug!("scheduled {} in {:?}", id, delay);
        true
    }

    /// runs `task` every `interval` until cancelled. the id stays pending the whole time
    pub fn add_recurring(&self, id: &str, interval: Duration, task: TaskFn) -> bool {
        let mut tasks = self.tasks();
        if self.inner.shutdown.is_cancelled() || tasks.contains_key(id) {
            debug!("recurring task {} not added", id);
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.shutdown.child_token();
        let task_id = id.to_string();
        let wait = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = wait.cancelled() => {
                        debug!("recurring task {} stopped", task_id);
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                run_logged(&task_id, &task).await;
            }
        });

        tasks.insert(
            id.to_string(),
            ScheduledEntry {
                generation,
                token,
                _handle: handle,
            },
        );
        info!("scheduled {} every {:?}", id, interval);
        true
    }

    fn release(&self, id: &str, generation: u64) {
        let mut tasks = self.tasks();
        if tasks.get(id).is_some_and(|e| e.generation == generation) {
            tasks.remove(id);
        }
    }

    /// cancels a pending task, a run already in progress is left alone
    pub fn cancel(&self, id: &str) -> bool {
        match self.tasks().remove(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.tasks().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks().len()
    }

    /// cancels every pending timer and refuses new ones, running tasks finish on their own
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        let drained = self.tasks().drain().count();
        info!("scheduler stopped, {} pending tasks cancelled", drained);
    }
}

async fn run_logged(id: &str, task: &TaskFn) {
    debug!("running task {}", id);
    if let Err(e) = task().await {
        error!("task {} failed: {:#}", id, e);
    }
}

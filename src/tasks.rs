use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Submission point for detached webhook work.
///
/// Production queues spawn and forget. Tracked queues additionally record
/// join handles so tests can `drain` them and observe side effects
/// deterministically.
#[derive(Clone)]
pub struct TaskQueue {
    tracked: Option<Arc<Mutex<Vec<JoinHandle<()>>>>>,
}

impl TaskQueue {
    /// Fire-and-forget queue for production use.
    pub fn detached() -> Self {
        Self { tracked: None }
    }

    /// Queue that records handles for `drain`.
    pub fn tracked() -> Self {
        Self {
            tracked: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Spawn `task` without awaiting it. The caller gets no completion
    /// signal; the task owns its own error handling.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        if let Some(tracked) = &self.tracked {
            tracked.lock().await.push(handle);
        }
    }

    /// Await every task submitted so far. A no-op on detached queues.
    pub async fn drain(&self) {
        let Some(tracked) = &self.tracked else {
            return;
        };

        let handles: Vec<JoinHandle<()>> = tracked.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

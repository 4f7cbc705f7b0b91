//! Execution backend seam and the timeout sweeps built on it

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_scheduler::TimeoutSweep;
use courier_store::{Task, TaskStore};

/// Backend that actually executes tasks received by the server.
///
/// The server hands every new task to [`TaskDelegator::submit`] and forwards
/// cancellations. Failures are logged by the caller and never fail the
/// originating request.
#[async_trait]
pub trait TaskDelegator: Send + Sync + 'static {
    async fn submit(&self, task: &Task) -> anyhow::Result<()>;

    /// Drop in-flight work for a task that was just cancelled
    async fn cancel(&self, task_id: &str) -> anyhow::Result<()>;

    /// Expire overdue work. Returns how many tasks were timed out.
    async fn check_timeouts(&self) -> anyhow::Result<usize>;
}

/// Timeout sweep that defers to an attached delegator
pub struct DelegatorSweep {
    delegator: Arc<dyn TaskDelegator>,
}

impl DelegatorSweep {
    pub fn new(delegator: Arc<dyn TaskDelegator>) -> Self {
        Self { delegator }
    }
}

#[async_trait]
impl TimeoutSweep for DelegatorSweep {
    async fn check_timeouts(&self) -> anyhow::Result<usize> {
        self.delegator.check_timeouts().await
    }
}

/// Built-in sweep: expire tasks idle for longer than `max_idle`
pub struct StoreSweep {
    store: TaskStore,
    max_idle: Duration,
}

impl StoreSweep {
    pub fn new(store: TaskStore, max_idle: Duration) -> Self {
        Self { store, max_idle }
    }
}

#[async_trait]
impl TimeoutSweep for StoreSweep {
    async fn check_timeouts(&self) -> anyhow::Result<usize> {
        Ok(self.store.expire_stale_tasks(self.max_idle).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_store::{NewTask, TaskState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegator {
        checks: AtomicUsize,
    }

    #[async_trait]
    impl TaskDelegator for CountingDelegator {
        async fn submit(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cancel(&self, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn check_timeouts(&self) -> anyhow::Result<usize> {
            Ok(self.checks.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_delegator_sweep_forwards() {
        let delegator = Arc::new(CountingDelegator {
            checks: AtomicUsize::new(0),
        });
        let sweep = DelegatorSweep::new(delegator.clone());
        assert_eq!(sweep.check_timeouts().await.unwrap(), 1);
        assert_eq!(sweep.check_timeouts().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_store_sweep_expires_idle_tasks() {
        let store = TaskStore::open_in_memory().unwrap();
        let task = store
            .create_task(NewTask::new("slow", "agent-a"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweep = StoreSweep::new(store.clone(), Duration::from_millis(1));
        assert_eq!(sweep.check_timeouts().await.unwrap(), 1);
        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Timeout);
    }

    #[tokio::test]
    async fn test_store_sweep_surfaces_errors() {
        let store = TaskStore::open_in_memory().unwrap();
        store.close().await.unwrap();
        let sweep = StoreSweep::new(store, Duration::from_secs(1));
        let err = sweep.check_timeouts().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}

use crate::{ControlError, ControlResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DISPATCH_QUEUE_KEY: &str = "runs.queue";

pub fn cancel_marker_key(run_id: &str) -> String {
    format!("runs.cancel.{run_id}")
}

pub fn branch_lock_key(project_id: &str, target_branch: &str) -> String {
    format!("runs.lock.{project_id}.{target_branch}")
}

/// Queue, cancel-marker, and branch-lock collaborator. The deployment backs
/// this with the shared queue/bus; tests and the CLI use the memory variant.
#[async_trait]
pub trait RunBus: Send + Sync {
    /// Append a run id to the FIFO dispatch queue.
    async fn enqueue_run(&self, run_id: &str) -> ControlResult<()>;
    /// Pop one run id; the caller owns the run until its worker finishes.
    async fn dequeue_run(&self) -> ControlResult<Option<String>>;

    async fn set_cancel_marker(&self, run_id: &str, ttl: Duration) -> ControlResult<()>;
    async fn cancel_marker_set(&self, run_id: &str) -> ControlResult<bool>;

    /// Acquire the `(projectId, targetBranch)` lock for a run. Returns the
    /// holding run id on contention.
    async fn acquire_branch_lock(
        &self,
        project_id: &str,
        target_branch: &str,
        run_id: &str,
        ttl: Duration,
    ) -> ControlResult<Result<(), String>>;
    async fn release_branch_lock(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<()>;
    async fn branch_lock_holder(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<Option<String>>;
}

pub type SharedRunBus = Arc<dyn RunBus>;

#[derive(Clone, Debug)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct BusState {
    queue: VecDeque<String>,
    cancel_markers: BTreeMap<String, Instant>,
    branch_locks: BTreeMap<String, Expiring>,
}

#[derive(Clone, Default)]
pub struct MemoryRunBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryRunBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ControlResult<std::sync::MutexGuard<'_, BusState>> {
        self.state
            .lock()
            .map_err(|_| ControlError::Internal("run bus mutex poisoned".to_string()))
    }
}

#[async_trait]
impl RunBus for MemoryRunBus {
    async fn enqueue_run(&self, run_id: &str) -> ControlResult<()> {
        self.lock()?.queue.push_back(run_id.to_string());
        Ok(())
    }

    async fn dequeue_run(&self) -> ControlResult<Option<String>> {
        Ok(self.lock()?.queue.pop_front())
    }

    async fn set_cancel_marker(&self, run_id: &str, ttl: Duration) -> ControlResult<()> {
        self.lock()?
            .cancel_markers
            .insert(cancel_marker_key(run_id), Instant::now() + ttl);
        Ok(())
    }

    async fn cancel_marker_set(&self, run_id: &str) -> ControlResult<bool> {
        let key = cancel_marker_key(run_id);
        let mut state = self.lock()?;
        match state.cancel_markers.get(&key) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                state.cancel_markers.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn acquire_branch_lock(
        &self,
        project_id: &str,
        target_branch: &str,
        run_id: &str,
        ttl: Duration,
    ) -> ControlResult<Result<(), String>> {
        let key = branch_lock_key(project_id, target_branch);
        let mut state = self.lock()?;
        if let Some(existing) = state.branch_locks.get(&key) {
            if existing.expires_at > Instant::now() && existing.value != run_id {
                return Ok(Err(existing.value.clone()));
            }
        }
        state.branch_locks.insert(
            key,
            Expiring {
                value: run_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(Ok(()))
    }

    async fn release_branch_lock(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<()> {
        self.lock()?
            .branch_locks
            .remove(&branch_lock_key(project_id, target_branch));
        Ok(())
    }

    async fn branch_lock_holder(
        &self,
        project_id: &str,
        target_branch: &str,
    ) -> ControlResult<Option<String>> {
        let key = branch_lock_key(project_id, target_branch);
        let mut state = self.lock()?;
        match state.branch_locks.get(&key) {
            Some(lock) if lock.expires_at > Instant::now() => Ok(Some(lock.value.clone())),
            Some(_) => {
                state.branch_locks.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_queue_is_fifo_with_single_owner_pop() {
        let bus = MemoryRunBus::new();
        bus.enqueue_run("r-1").await.expect("enqueue");
        bus.enqueue_run("r-2").await.expect("enqueue");

        assert_eq!(bus.dequeue_run().await.expect("dequeue"), Some("r-1".to_string()));
        assert_eq!(bus.dequeue_run().await.expect("dequeue"), Some("r-2".to_string()));
        assert_eq!(bus.dequeue_run().await.expect("dequeue"), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_marker_expires_with_ttl() {
        let bus = MemoryRunBus::new();
        bus.set_cancel_marker("r-1", Duration::from_millis(20))
            .await
            .expect("set marker");
        assert!(bus.cancel_marker_set("r-1").await.expect("query"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!bus.cancel_marker_set("r-1").await.expect("query"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn branch_lock_exclusive_until_released() {
        let bus = MemoryRunBus::new();
        let ttl = Duration::from_secs(60);
        assert!(
            bus.acquire_branch_lock("p-1", "impl/1", "r-1", ttl)
                .await
                .expect("acquire")
                .is_ok()
        );
        let contended = bus
            .acquire_branch_lock("p-1", "impl/1", "r-2", ttl)
            .await
            .expect("acquire attempt");
        assert_eq!(contended, Err("r-1".to_string()));

        // Re-acquisition by the holder refreshes, other branches are free.
        assert!(
            bus.acquire_branch_lock("p-1", "impl/1", "r-1", ttl)
                .await
                .expect("reacquire")
                .is_ok()
        );
        assert!(
            bus.acquire_branch_lock("p-1", "impl/2", "r-2", ttl)
                .await
                .expect("acquire")
                .is_ok()
        );

        bus.release_branch_lock("p-1", "impl/1").await.expect("release");
        assert_eq!(
            bus.branch_lock_holder("p-1", "impl/1").await.expect("holder"),
            None
        );
        assert!(
            bus.acquire_branch_lock("p-1", "impl/1", "r-2", ttl)
                .await
                .expect("acquire after release")
                .is_ok()
        );
    }
}

//! Unbounded worker pool on top of the tokio runtime.
//!
//! Every connection, datagram and peer exchange runs as one pooled task. The
//! pool keeps the task handles so that shutdown can cancel whatever is still
//! in flight instead of waiting for it. There is no admission control.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct PoolState {
    handles: Vec<JoinHandle<()>>,
    shut_down: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` on the pool. Returns false (and drops the task) once the
    /// pool has been shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.shut_down {
            debug!("Worker pool is shut down, dropping task");
            return false;
        }

        // Reap finished tasks so the handle list tracks live work only
        state.handles.retain(|handle| !handle.is_finished());
        state.handles.push(tokio::spawn(task));
        true
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shut_down
    }

    /// Refuses new work and aborts every task still running. Returns how many
    /// tasks were cancelled. Calling it again is a no-op.
    pub fn shutdown_now(&self) -> usize {
        let handles = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.shut_down = true;
            std::mem::take(&mut state.handles)
        };

        let mut cancelled = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!("Worker pool cancelled {} in-flight tasks", cancelled);
        }
        cancelled
    }
}

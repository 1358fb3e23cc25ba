use crate::errors::PoolError;

/// Snapshot of the pool counters, taken under a single lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    /// All workers, whatever their state.
    pub thread_count: usize,
    /// Idle plus busy.
    pub online_threads: usize,
    /// Busy.
    pub active_threads: usize,
    pub queued_tasks: usize,
    /// Busy plus queued.
    pub pending_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.online_threads == 0 {
            return 0.0;
        }
        self.active_threads as f64 / self.online_threads as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        if self.thread_count == 0 {
            return self.queued_tasks as f64;
        }
        self.queued_tasks as f64 / self.thread_count as f64
    }
}

/// Pool lifecycle notifications, delivered through `ThreadPoolInner::subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A failure with no job to reject it on.
    Error(PoolError),
    /// `online_threads` changed to this value.
    Online(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Initializing,
    Idle,
    Busy,
    Gone,
}

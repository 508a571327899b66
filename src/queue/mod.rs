pub mod memory;

pub use memory::MemJobQueue;

use chrono::{DateTime, Utc};

use crate::broker::job::Job;

/// Per-function job storage. One queue exists per registered function;
/// the broker task is the only caller, so implementations need no
/// internal locking.
pub trait JobQueue: Send {
    fn func_name(&self) -> &str;

    fn push_job(&mut self, job: Job);

    /// Pop the next job, higher priority classes first, FIFO within a
    /// class.
    fn pop_job(&mut self) -> Option<Job>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every queued job whose deadline has passed at
    /// `now`, preserving order among the survivors.
    fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<Job>;
}

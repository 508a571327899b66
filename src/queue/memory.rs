use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::broker::job::{Job, JobPriority};
use crate::queue::JobQueue;

/// In-memory queue with one FIFO lane per priority class.
#[derive(Debug, Default)]
pub struct MemJobQueue {
    func_name: String,
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
}

impl MemJobQueue {
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
        }
    }
}

impl JobQueue for MemJobQueue {
    fn func_name(&self) -> &str {
        &self.func_name
    }

    fn push_job(&mut self, job: Job) {
        match job.priority {
            JobPriority::High => self.high.push_back(job),
            JobPriority::Normal => self.normal.push_back(job),
            JobPriority::Low => self.low.push_back(job),
        }
    }

    fn pop_job(&mut self) -> Option<Job> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let mut expired = Vec::new();
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            let mut kept = VecDeque::with_capacity(lane.len());
            while let Some(job) = lane.pop_front() {
                if job.timed_out(now) {
                    expired.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            *lane = kept;
        }
        expired
    }
}

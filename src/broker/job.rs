use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::broker::event::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
        }
    }
}

/// A submitted job. Lives in exactly one per-function queue until
/// grabbed, then in the broker's in-flight table until a terminal work
/// report or timeout removes it.
#[derive(Debug, Clone)]
pub struct Job {
    /// Broker-allocated handle, unique for the broker's lifetime.
    pub handle: String,
    /// Client-supplied unique key; not interpreted.
    pub unique_id: String,
    pub func_name: String,
    pub data: Vec<u8>,
    pub priority: JobPriority,
    pub background: bool,
    pub create_at: DateTime<Utc>,
    pub create_by: SessionId,
    pub process_at: Option<DateTime<Utc>>,
    pub process_by: Option<SessionId>,
    /// 0 means the job never times out.
    pub timeout_secs: u32,
    pub percent: u32,
    pub denominator: u32,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: String,
        unique_id: String,
        func_name: String,
        data: Vec<u8>,
        priority: JobPriority,
        background: bool,
        create_by: SessionId,
        timeout_secs: u32,
    ) -> Self {
        Self {
            handle,
            unique_id,
            func_name,
            data,
            priority,
            background,
            create_at: Utc::now(),
            create_by,
            process_at: None,
            process_by: None,
            timeout_secs,
            percent: 0,
            denominator: 0,
        }
    }

    /// Whether the job's deadline has passed at `now`.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_secs > 0
            && now.timestamp() >= self.create_at.timestamp() + i64::from(self.timeout_secs)
    }
}

/// Allocates job handles of the shape `H:<host>:<counter>`. The counter
/// is atomic so handles may be allocated off the broker task as well.
#[derive(Debug)]
pub struct HandleGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl HandleGenerator {
    pub fn new(host: impl AsRef<str>) -> Self {
        Self {
            prefix: format!("H:{}", host.as_ref()),
            counter: AtomicU64::new(0),
        }
    }

    /// Build a generator using the local host name when available.
    pub fn from_env() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::new(host)
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_handles_are_monotonic() {
        let handles = HandleGenerator::new("box1");
        assert_eq!(handles.next(), "H:box1:1");
        assert_eq!(handles.next(), "H:box1:2");
        assert_eq!(handles.next(), "H:box1:3");
    }

    #[test]
    fn test_job_with_zero_timeout_never_times_out() {
        let job = Job::new(
            "H:t:1".into(),
            "u1".into(),
            "reverse".into(),
            vec![],
            JobPriority::Normal,
            false,
            1,
            0,
        );
        assert!(!job.timed_out(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_job_times_out_after_deadline() {
        let job = Job::new(
            "H:t:1".into(),
            "u1".into(),
            "reverse".into(),
            vec![],
            JobPriority::Normal,
            false,
            1,
            5,
        );
        assert!(!job.timed_out(job.create_at));
        assert!(!job.timed_out(job.create_at + Duration::seconds(4)));
        assert!(job.timed_out(job.create_at + Duration::seconds(5)));
        assert!(job.timed_out(job.create_at + Duration::seconds(60)));
    }
}

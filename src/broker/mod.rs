//! The event-loop broker: a single task owns every mutable table
//! (function rosters, per-function queues, in-flight jobs, worker and
//! client sessions) and serializes all protocol events through one
//! channel. Sessions never touch broker state directly.

pub mod engine;
pub mod event;
pub mod job;

pub use engine::{Broker, WorkerStatus, SWEEP_INTERVAL};
pub use event::{
    BrokerSnapshot, Event, JobAssignment, SessionHandle, SessionId, WorkUpdate,
};
pub use job::{HandleGenerator, Job, JobPriority};

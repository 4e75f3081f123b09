//! Exactly-once periodic job scheduling across a fleet of workers.
//!
//! Workers share nothing but a key/value store with etag-conditioned writes.
//! Each cloud-scoped job has one persisted [`schedule::ScheduleState`] record;
//! a worker runs the job only after winning a conditional write that stamps a
//! time-bounded lease into that record.

pub mod admin;
pub mod codec;
pub mod coordinator;
pub mod ctl;
pub mod keys;
pub mod kv;
pub mod metrics;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod settings;
pub mod shutdown;
pub mod trace;

pub use leasehold_macros::test;

//! Core of a distributed karaoke-production system.
//!
//! Three process roles talk JSON over NUL-delimited TCP frames:
//!
//! * the **master** (`kara-master`) owns the job registry, places jobs on
//!   host slaves, and fans progress out to listeners;
//! * a **host slave** (`kara-slave`) forks one worker process per job and
//!   forwards lifecycle events;
//! * a **worker** (`kara-worker`) runs one job's task DAG, each task in its
//!   own subprocess, and streams updates back to the master.

pub mod config;
pub mod master;
pub mod pipeline;
pub mod slave;
pub mod stages;
pub mod types;
pub mod wire;
pub mod worker;

/// Wall-clock timestamp in epoch seconds, as stored on jobs and in dumps.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

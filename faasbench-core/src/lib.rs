//! The benchmark engine: load generation against serverless functions, the result archive, and
//! progress reporting.
//!
//! A benchmark run applies the same [workload](config::WorkloadParameters) to every configured
//! function target. Each target gets its own [`LoadGenerator`](loadgen::LoadGenerator), which
//! issues a fixed number of requests with a bounded number of workers and appends every
//! successful result to an [archive](archive) file. Targets are run concurrently by a
//! [`Timeline`](timeline::Timeline), and all components report progress through an
//! [`Events`](events::Events) handle.
//!
//! This crate does not know how functions are deployed. See `faasbench-cloud` for that.
#![warn(missing_debug_implementations)]

pub mod archive;
pub mod config;
pub mod events;
pub mod loadgen;
pub mod provider;
pub mod response;
pub mod timeline;

pub use events::{Event, Events, Severity};
pub use provider::Provider;

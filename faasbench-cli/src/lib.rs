//! Commands and settings of the `faasbench` binary.
#![warn(missing_debug_implementations)]

pub mod bench;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod observability;

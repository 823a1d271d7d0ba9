//! The `faasbench` command line tool.
//!
//! Deploys benchmark functions to cloud providers, generates benchmark configs for them, and runs
//! fixed-size HTTP workloads against every function in parallel.
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    faasbench_cli::cli::execute()
}

//! Test utilities for the benchmark engine and the deployment tooling.
//!
//! This crate provides an in-process stand-in for deployed benchmark functions and a tracing
//! setup for tests. See the modules for all available utilities.

pub mod server;
pub mod tracing;

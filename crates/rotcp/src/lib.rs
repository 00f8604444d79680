//! Ambient stack for the `rotcp` binary: argument parsing, the resolved
//! `Config` record, logging setup, and signal handling, all layered on top
//! of the `rotcp-core` forwarding engine.

pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;

//! CLI subcommands. Each submodule owns one subcommand's argument struct and
//! its `run(...)` entry point; `main.rs` just matches on [`Commands`] and
//! dispatches.

pub mod diff;
pub mod gc;
pub mod logs;
pub mod run;
pub mod stats;
pub mod validate;

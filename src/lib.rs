#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod logging;
pub mod output;
pub(crate) mod persist;
pub mod runner;
pub mod step;
pub mod task;
pub mod workspace;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

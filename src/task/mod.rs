#![forbid(unsafe_code)]

pub mod artifacts;
pub mod engine;
pub mod lock;
pub mod model;
pub mod progress;
pub mod retry;
pub mod store;
pub mod template;

#![forbid(unsafe_code)]

pub mod manager;
pub mod model;
pub mod store;

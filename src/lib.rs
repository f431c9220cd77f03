//! Agent Pool: streaming agent conversations on isolated worker processes.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod worker;

// Distributed query-execution core: per-query Exchange operators, plan
// rewriting, and the TCP tuple-shuffle mesh that moves rows between peers
// in a shared-nothing parallel relational database cluster.

pub mod catalog;
pub mod common;
pub mod config;
pub mod error;
pub mod exchange;
pub mod network;
pub mod plan;
pub mod session;

pub use error::{DbError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

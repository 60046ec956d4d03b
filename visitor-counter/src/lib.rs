// invocations share one process, a panic in one of them should not take down the rest
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod counter;
pub mod error;
pub mod handler;
pub mod kv;
pub mod metrics;
pub mod server;

#![deny(
    clippy::expect_used,
    clippy::panic,
    clippy::print_stdout,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used
)]

pub mod config;
pub mod exchange;
pub mod http;
pub mod maintenance;
pub mod operations;
pub mod session;
pub mod tokens;
pub mod upload;

//! Sealed request/reply layer.
//!
//! Requests arrive as envelopes sealed under the caller's session key. They are
//! decoded into a [`Command`], dispatched, and answered with a [`Reply`] sealed
//! under the same key.

mod command;
mod dispatch;
mod error;
pub mod http;
mod reply;

pub use command::{Command, UploadMeta};
pub use dispatch::{into_reply, Exchange};
pub use error::ExchangeError;
pub use reply::{Failure, FailureCategory, Reply};

//! Error plumbing and time helpers shared by the synchro crates.

pub mod error;
pub mod time;

pub use error::FromMessage;

#![warn(rust_2018_idioms)]

pub mod channel;
pub mod consumer;
pub mod error;
pub mod messages;
pub mod producer;
pub mod router;
pub mod rtp;
pub mod transport;

pub use error::{Error, Result};
pub use router::Router;

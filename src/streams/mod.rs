//! Stream Consumer Framework (spec §4.I) and its Babysitter specialization
//! (§4.J).

pub mod babysitter;
pub mod consumer;

pub use consumer::{StreamConsumer, StreamHandler, StreamMessage};

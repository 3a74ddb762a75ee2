//! Replay log and per-link statistics of the frames that crossed the network

pub mod stats;
pub mod step;
pub mod tracer;

//! Per-batch worker pool.
//!
//! - [`policy`] - how many workers a batch gets.
//! - [`worker`] - one worker's session lifecycle and send loop.
//! - [`manager`] - the [`manager::Dispatcher`] that wires feeder, workers and
//!   streamer together for one batch.

pub mod manager;
pub mod policy;
pub mod worker;

//! The sequential trigger pipeline: processed-item store, run completion
//! tracking, the per-cycle dispatcher, the polling loop around it, and the
//! activity log of every attempt.

pub mod dispatch;
pub mod log;
pub mod monitor;
pub mod store;
pub mod tracker;

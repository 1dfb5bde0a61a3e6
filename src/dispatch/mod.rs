//! Key-Ordered Dispatch
//!
//! Per-key serial lanes over a shared bounded pool. Messages sharing a
//! correlation key are handled strictly in submission order; unrelated keys
//! proceed in parallel.

pub mod dispatcher;
pub mod failure;
mod lane;

pub use dispatcher::{DispatchError, DrainReport, KeyedDispatcher, UNKNOWN_KEY};
pub use failure::{FailureObserver, LaneTaskFailure, LogFailureObserver, panic_message};

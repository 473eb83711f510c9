//! Reaching-experiment controller.
//!
//! Receives arm telemetry from the peripheral PC over UDP, commands trials over TCP,
//! logs every in-trial sample per block to CSV and sequences blocks and trials.

pub mod display;
pub mod link;
pub mod session;
pub mod utils;

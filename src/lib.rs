//! Driver and calibration engine for Rotronic humidity/temperature probes
//! on RS-232, verified against a chilled-mirror reference instrument.
//!
//! The crate covers the device protocol codec, serial transport ownership,
//! probe discovery and background polling, the calibration run state
//! machine, and the least-squares solver that fits replacement PT100
//! coefficients. Presentation (grids, reports, dialogs) is an external
//! consumer of the event streams and records emitted here.

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod sequence;
pub mod solver;
pub mod transport;

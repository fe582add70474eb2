//! statharvest - harvest labels and time-sliced statistics from constraint
//! solver runs.
//!
//! A SQLite-backed queue holds problems (a model plus optional instance
//! data). Worker processes claim problems one at a time, run the external
//! solver under a hard deadline, and write results back. A supervisor keeps
//! a pool of workers alive until the queue drains.

pub mod cli;
pub mod error;
pub mod logging;
pub mod output;
pub mod paths;
pub mod process;
pub mod snapshot;
pub mod solver;
pub mod store;
pub mod supervisor;
pub mod theme;
pub mod worker;

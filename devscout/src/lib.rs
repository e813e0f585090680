//! devscout library crate.
//!
//! A self-scaling pipeline: feeders push device candidates into a chain of
//! priority queues, and each stage's worker pool is resized every tick from
//! the depth of its input queue.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod feeder;
pub mod logging;
pub mod migration;
pub mod pipeline;
pub mod process;
pub mod shutdown;
pub mod store;

pub use error::{Error, Result};

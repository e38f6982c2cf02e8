//! group-sim: runs a process group in one address space.
//!
//! Spins up `GroupNode`s over the in-memory network, lets an optional late
//! joiner discover the authorized processes, multicasts a batch of messages
//! and reports what every process delivered.

pub mod config;
pub mod scenario;

pub use config::{LinkCut, SimConfig};
pub use scenario::{SimReport, Simulation};

//! tb-broker: Test-target broker daemon
//!
//! The broker arbitrates access to a fleet of hardware and emulated test
//! targets. Principals acquire groups of targets, drive their power rails
//! and stream their consoles through a REST interface, while the daemon
//! keeps its supervisor informed that it is alive.

pub mod allocation;
pub mod console;
pub mod drivers;
pub mod power;
pub mod registry;
pub mod rest;
pub mod state;
pub mod supervisor;

pub use state::BrokerState;

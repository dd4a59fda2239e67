//! Driver capability traits
//!
//! The broker core depends only on these interfaces; concrete board
//! drivers are bound per target component by configuration.

mod console;
mod power;

pub use console::{ConsoleDriver, ConsoleEvent};
pub use power::PowerDriver;

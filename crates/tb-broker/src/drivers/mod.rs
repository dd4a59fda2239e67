//! Driver binding
//!
//! Maps each configured power component and console to a capability
//! implementation. The controllers only ever see the trait objects.

mod console;
mod power;

use std::sync::Arc;

use tb_core::config::{
    ConsoleConfig, ConsoleDriverConfig, PowerComponentConfig, PowerDriverConfig,
};
use tb_core::traits::{ConsoleDriver, PowerDriver};
use tb_core::TargetId;

pub use console::{CommandConsole, LoopbackConsole};
pub use power::{CommandPower, SimulatedPower};

/// Builds drivers for configured components
pub trait DriverFactory: Send + Sync {
    fn power(&self, target: &TargetId, component: &PowerComponentConfig) -> Arc<dyn PowerDriver>;

    fn console(&self, target: &TargetId, console: &ConsoleConfig) -> Arc<dyn ConsoleDriver>;
}

/// Drivers shipped with the broker
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDrivers;

impl DriverFactory for BuiltinDrivers {
    fn power(&self, target: &TargetId, component: &PowerComponentConfig) -> Arc<dyn PowerDriver> {
        tracing::debug!(target_id = %target, component = %component.name, "Binding power driver");
        match &component.driver {
            PowerDriverConfig::Simulated { initial } => Arc::new(SimulatedPower::new(*initial)),
            PowerDriverConfig::Command { on, off, state } => {
                Arc::new(CommandPower::new(on, off, state))
            }
        }
    }

    fn console(&self, target: &TargetId, console: &ConsoleConfig) -> Arc<dyn ConsoleDriver> {
        tracing::debug!(target_id = %target, console = %console.name, "Binding console driver");
        match &console.driver {
            ConsoleDriverConfig::Loopback => Arc::new(LoopbackConsole::new()),
            ConsoleDriverConfig::Command {
                program,
                args,
                respawn,
            } => Arc::new(CommandConsole::new(program, args.clone(), *respawn)),
        }
    }
}

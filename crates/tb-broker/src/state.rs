//! Global broker state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tb_core::config::{BrokerConfig, PrincipalConfig};
use tb_core::Principal;

use crate::allocation::AllocationManager;
use crate::console::{ConsoleLimits, ConsoleMultiplexer};
use crate::drivers::{BuiltinDrivers, DriverFactory};
use crate::power::PowerController;
use crate::registry::TargetRegistry;

/// Global state for the broker daemon
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Target catalog
    pub registry: Arc<TargetRegistry>,
    /// Ownership arbitration
    pub allocations: Arc<AllocationManager>,
    /// Power rails
    pub power: PowerController,
    /// Console streams
    pub consoles: ConsoleMultiplexer,
    /// Shutdown signal shared with every background task
    pub cancel: CancellationToken,
}

impl BrokerState {
    /// Create broker state with the built-in drivers
    pub fn new(config: BrokerConfig, cancel: CancellationToken) -> Self {
        Self::with_drivers(config, &BuiltinDrivers, cancel)
    }

    /// Create broker state binding components through `drivers`
    pub fn with_drivers(
        config: BrokerConfig,
        drivers: &dyn DriverFactory,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(TargetRegistry::new(config.targets.iter().cloned()));
        let allocations = Arc::new(AllocationManager::new(Arc::clone(&registry)));
        let power = PowerController::new(
            &registry,
            drivers,
            config.driver_timeout,
            cancel.child_token(),
        );
        let consoles = ConsoleMultiplexer::new(
            &registry,
            drivers,
            ConsoleLimits {
                chunk_size: config.console_chunk_size,
                buffer_limit: config.console_buffer_limit,
            },
            config.driver_timeout,
            cancel.child_token(),
        );

        Self {
            config,
            registry,
            allocations,
            power,
            consoles,
            cancel,
        }
    }

    /// Resolve a bearer token to the principal it authenticates
    pub fn authenticate(&self, token: &str) -> Option<Principal> {
        self.config
            .principals
            .iter()
            .find(|p| p.matches_token(token))
            .map(PrincipalConfig::principal)
    }
}

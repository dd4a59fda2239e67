//! tb-core: Core abstractions and configuration for the target broker
//!
//! This crate provides shared types, the error taxonomy, the driver
//! capability traits and the configuration structures used by the broker
//! daemon and its drivers.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{BrokerError, ErrorKind};
pub use types::{AllocationId, Principal, TargetId};

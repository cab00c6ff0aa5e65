//! Domain layer - Remote API ports, entity references and unit conversions
//!
//! This module defines the traits (ports) that remote adapters implement,
//! following hexagonal architecture principles.

pub mod ports;
pub mod reference;
pub mod units;

pub use ports::*;
pub use reference::Reference;
pub use units::{CapacityUnit, RetentionUnit};

//! Domain layer - Core types and port definitions
//!
//! This module defines the traits (ports) that session transports implement,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;

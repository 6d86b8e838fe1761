//! Ledsim Core - Topology validation and device runtime
//!
//! This crate provides the foundational pieces of the simulated device:
//! - Device configuration parsing, validation, and serialization
//! - The runtime that owns the global LED address space and the
//!   double-buffered color state with frame reassembly

pub mod config;
pub mod runtime;

pub use config::{ConfigError, DeviceConfig, MatrixMap, OutputSpec, OutputType};
pub use runtime::{DeviceRuntime, OutputFrame, OutputRuntime, PixelUpdate};

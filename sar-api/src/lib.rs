//! SAR API - Core interfaces and types for the ATM-155 SAR engine
//!
//! This crate holds everything the segmentation-and-reassembly engine shares
//! with the platform that hosts it and the protocol layer above it.
//!
//! # Architecture
//!
//! - **Hardware**: register map, interrupt bits and report ring geometry
//! - **Error**: common error type and result alias
//! - **Types**: circuit identifiers, packets and VC parameters
//! - **Config**: adapter configuration record and its source
//! - **Device**: register and shared-memory access supplied by the platform
//! - **Upstream**: notifications delivered to the protocol layer
//!
//! # Usage
//!
//! ```rust
//! use sar_api::{ConfigSource, Result, SarConfig};
//!
//! fn main() -> Result<()> {
//!     let config = SarConfig::default().query_configuration()?;
//!     assert_eq!(config.vc_hash_table_size, 13);
//!     Ok(())
//! }
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod hw;
pub mod sync;
pub mod types;
pub mod upstream;

// Re-export commonly used types
pub use crate::config::{ConfigSource, SarConfig};
pub use crate::device::SarDevice;
pub use crate::error::{Error, Result};
pub use crate::hw::{InterruptStatus, Register, SarControl};
pub use crate::types::*;
pub use crate::upstream::Upstream;

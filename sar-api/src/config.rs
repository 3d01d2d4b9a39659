//! Adapter configuration
//!
//! The values an external configuration loader supplies before the engine
//! starts. Validation and derived register encodings live in the engine.

use crate::error::Result;

/// Fewest receive buffers an adapter may be configured with.
pub const MINIMUM_RECEIVE_BUFFERS: u32 = 48;
/// Most receive buffers an adapter may be configured with.
pub const MAXIMUM_RECEIVE_BUFFERS: u32 = 2048;

/// SAR adapter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SarConfig {
    /// Buckets in the circuit hash table
    pub vc_hash_table_size: u32,
    /// Upper bound on receive buffers allocated per size class
    pub total_receive_buffers: u32,
    /// Buffers allocated for each receive circuit that is activated
    pub receive_buffers_per_pool: u32,
    /// Size of a big receive buffer in bytes
    pub big_buffer_size: u32,
    /// Size of a small receive buffer in bytes
    pub small_buffer_size: u32,
    /// Entries in the adapter VC table; also the slot ring capacity
    pub num_vcs: u32,
}

impl Default for SarConfig {
    fn default() -> Self {
        Self {
            vc_hash_table_size: 13,
            total_receive_buffers: 300,
            receive_buffers_per_pool: 32,
            big_buffer_size: 8192,
            small_buffer_size: 2048,
            num_vcs: 1024,
        }
    }
}

/// External configuration loader
pub trait ConfigSource {
    /// Returns the configuration the adapter should run with.
    fn query_configuration(&self) -> Result<SarConfig>;
}

impl ConfigSource for SarConfig {
    fn query_configuration(&self) -> Result<SarConfig> {
        Ok(*self)
    }
}

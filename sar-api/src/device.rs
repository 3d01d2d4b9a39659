//! Platform abstraction for the SAR hardware
//!
//! The engine never touches a bus directly. Register access and the
//! DMA-visible memory it shares with the adapter both go through
//! [`SarDevice`], which the platform layer implements.

use crate::hw::Register;
use crate::types::PhysAddr;

/// Register and shared-memory access supplied by the platform
pub trait SarDevice: Send + Sync {
    /// Reads a 32-bit register.
    fn read_register(&self, reg: Register) -> u32;

    /// Writes a 32-bit register.
    fn write_register(&self, reg: Register, value: u32);

    /// Allocates `size` bytes of zeroed DMA-visible memory.
    fn alloc_shared(&self, size: usize) -> Option<PhysAddr>;

    /// Returns memory obtained from `alloc_shared`.
    fn free_shared(&self, addr: PhysAddr, size: usize);

    /// Copies shared memory at `addr` into `buf`.
    fn read_shared(&self, addr: PhysAddr, buf: &mut [u8]);

    /// Copies `data` into shared memory at `addr`.
    fn write_shared(&self, addr: PhysAddr, data: &[u8]);
}

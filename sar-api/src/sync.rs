//! Synchronization primitives for the SAR engine
//!
//! Every lock in the engine is a short, non-blocking spin section.

pub use spin::Mutex;
pub use spin::RwLock;
pub use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

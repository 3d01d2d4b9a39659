//! SAR Core - Segmentation and reassembly engine for the ATM-155 PCI SAR
//!
//! This crate turns outbound packets into slot descriptors for the
//! adapter's transmit ring and reassembles AAL5 packets from the buffers
//! the adapter fills on receive.
//!
//! # Architecture
//!
//! - **Engine**: the [`SarEngine`] context that owns all adapter state
//! - **Registry**: generational arena of circuits plus the circuit-id hash
//! - **VC**: circuit control blocks, lifecycle and reference counting
//! - **Transmit**: `SegWait -> DmaWait -> DmaCompleting` pipeline
//! - **Receive**: buffer pools, slot tags and packet reassembly
//! - **Report**: hardware completion ring cursors
//! - **Interrupt**: event channel drained by a single consumer
//! - **Reset**: abort, reprogram and repost
//! - **Hardware**: bit-exact slot and report encodings
//!
//! # Usage
//!
//! ```rust,ignore
//! use sar_api::{SarConfig, VcParameters};
//! use sar_core::SarEngine;
//!
//! let engine = SarEngine::new(device, upstream, &SarConfig::default())?;
//! let vc = engine.create_vc();
//! engine.activate_vc(vc, &params)?;
//! engine.send_packets(vc, packets)?;
//!
//! // from the interrupt handler
//! engine.handle_interrupt();
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod aal5;
pub mod config;
pub mod engine;
pub mod hw;
pub mod interrupt;
pub mod receive;
pub mod registry;
pub mod report;
pub mod reset;
pub mod slot;
pub mod stats;
pub mod transmit;
pub mod vc;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-export commonly used types
pub use crate::config::EngineConfig;
pub use crate::engine::{QueueDepths, ResourceUsage, SarEngine, SlotUsage};
pub use crate::vc::{VcInfo, VcLifecycle};

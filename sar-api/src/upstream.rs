//! Notifications delivered to the protocol layer above the engine
//!
//! None of these are called while the engine holds a lock, so an
//! implementation may call straight back into the engine.

use crate::error::Result;
use crate::types::{PacketDisposition, PacketToken, ReceivedPacket, SendOutcome, VcHandle};

/// Protocol layer sitting on top of the SAR engine
pub trait Upstream: Send + Sync {
    /// A complete AAL5 packet arrived on `vc`.
    ///
    /// Returning `Err(Error::Busy(_))` means the receiver is out of
    /// resources; the engine reclaims the packet's buffers immediately.
    fn packet_received(&self, vc: VcHandle, packet: &ReceivedPacket) -> Result<PacketDisposition>;

    /// A packet submitted on `vc` finished. Called exactly once per packet.
    fn send_complete(&self, vc: VcHandle, token: PacketToken, outcome: SendOutcome);

    /// A pending deactivation of `vc` finished.
    fn deactivate_complete(&self, _vc: VcHandle) {}

    /// A pending adapter reset finished.
    fn reset_complete(&self) {}
}

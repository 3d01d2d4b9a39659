//! Slot ring abstraction
//!
//! The SAR exposes a handful of pending-slot register pairs. Every write of
//! a control word followed by a base address hands one buffer fragment to
//! the DMA engine; the hardware queues it internally, so the logical ring
//! is far larger than the register set. Software keeps the admission count:
//! a post consumes one slot, a completion releases it.

use sar_api::hw::SLOT_REGISTER_PAIRS;
use sar_api::{Error, PhysAddr, Register, Result, SarDevice, SizeClass};

use crate::hw::{RxSlotControl, TxSlotControl};

/// Free/maximum slot accounting for one ring
///
/// `0 <= remaining <= maximum` holds after every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounter {
    maximum: usize,
    remaining: usize,
}

impl SlotCounter {
    pub fn new(maximum: usize) -> Self {
        Self { maximum, remaining: maximum }
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Slots currently owned by the hardware.
    pub fn outstanding(&self) -> usize {
        self.maximum - self.remaining
    }

    pub fn can_reserve(&self, count: usize) -> bool {
        self.remaining >= count
    }

    /// Takes `count` slots, all or nothing.
    pub fn consume(&mut self, count: usize) -> Result<()> {
        if self.remaining < count {
            return Err(Error::InsufficientSlots);
        }
        self.remaining -= count;
        Ok(())
    }

    /// Returns `count` slots. Never exceeds the maximum.
    pub fn release(&mut self, count: usize) {
        let restored = self.remaining + count;
        if restored > self.maximum {
            log::error!(
                "slot release overflow: remaining {} + {} > maximum {}",
                self.remaining,
                count,
                self.maximum
            );
        }
        self.remaining = restored.min(self.maximum);
    }

    /// Forgets every outstanding slot.
    pub fn reset(&mut self) {
        self.remaining = self.maximum;
    }
}

/// Round-robin position over the pending-slot register pairs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCursor {
    next: usize,
}

impl SlotCursor {
    fn advance(&mut self) -> usize {
        let slot = self.next;
        self.next = (self.next + 1) % SLOT_REGISTER_PAIRS;
        slot
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Transmit slot ring
#[derive(Debug)]
pub struct TransmitSlots {
    pub counter: SlotCounter,
    cursor: SlotCursor,
}

impl TransmitSlots {
    pub fn new(maximum: usize) -> Self {
        Self { counter: SlotCounter::new(maximum), cursor: SlotCursor::default() }
    }

    /// Writes one fragment descriptor and consumes its slot.
    ///
    /// Callers reserve the whole packet's worth of slots up front by checking
    /// `counter.can_reserve`; this only refuses when the ring is empty.
    pub fn post_fragment<D: SarDevice>(
        &mut self,
        device: &D,
        mut ctrl: TxSlotControl,
        addr: PhysAddr,
        len: usize,
        end_of_packet: bool,
    ) -> Result<()> {
        debug_assert!(self.counter.remaining() > 0);
        self.counter.consume(1)?;
        ctrl.size = len as u16;
        ctrl.eop = end_of_packet;
        let (control, base) = Register::tx_slot(self.cursor.advance());
        device.write_register(control, ctrl.encode());
        device.write_register(base, addr.as_u32());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.counter.reset();
        self.cursor.reset();
    }
}

/// Receive slot rings, one counter per buffer size class
#[derive(Debug)]
pub struct ReceiveSlots {
    big: SlotCounter,
    small: SlotCounter,
    cursor: SlotCursor,
}

impl ReceiveSlots {
    pub fn new(maximum_per_class: usize) -> Self {
        Self {
            big: SlotCounter::new(maximum_per_class),
            small: SlotCounter::new(maximum_per_class),
            cursor: SlotCursor::default(),
        }
    }

    pub fn counter(&self, class: SizeClass) -> &SlotCounter {
        match class {
            SizeClass::Big => &self.big,
            SizeClass::Small => &self.small,
        }
    }

    pub fn counter_mut(&mut self, class: SizeClass) -> &mut SlotCounter {
        match class {
            SizeClass::Big => &mut self.big,
            SizeClass::Small => &mut self.small,
        }
    }

    /// Hands one receive buffer to the hardware and consumes its slot.
    pub fn post_buffer<D: SarDevice>(
        &mut self,
        device: &D,
        ctrl: RxSlotControl,
        addr: PhysAddr,
    ) -> Result<()> {
        self.counter_mut(ctrl.slot_type).consume(1)?;
        let (control, base) = Register::rx_slot(self.cursor.advance());
        device.write_register(control, ctrl.encode());
        device.write_register(base, addr.as_u32());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.big.reset();
        self.small.reset();
        self.cursor.reset();
    }
}

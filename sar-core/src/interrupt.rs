//! Interrupt entry and completion processing
//!
//! `isr` runs in interrupt context: it acknowledges the adapter and posts
//! the status bits to a fixed-size channel. `process_interrupts` is the
//! only consumer of that channel, so report processing never re-enters
//! itself even when several contexts call it.

use core::sync::atomic::{AtomicBool, Ordering};
use heapless::Deque;
use sar_api::{InterruptStatus, Register, SarDevice, Upstream};
use sar_api::sync::Mutex;

use crate::engine::{AdapterFlags, Completions, SarEngine, Section};

/// Pending interrupt events before new ones are merged into the newest.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Interrupt sources enabled at init.
pub const INTERRUPT_MASK: InterruptStatus = InterruptStatus::TX_IOC
    .union(InterruptStatus::RX_IOC)
    .union(InterruptStatus::TX_REPORT_FULL)
    .union(InterruptStatus::RX_REPORT_FULL)
    .union(InterruptStatus::FATAL);

/// Single-consumer channel of interrupt status words
pub struct InterruptChannel {
    events: Mutex<Deque<InterruptStatus, EVENT_QUEUE_DEPTH>>,
    consumer_active: AtomicBool,
}

/// Proof of being the one consumer; releases the claim on drop.
pub struct ConsumerGuard<'a> {
    channel: &'a InterruptChannel,
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.channel.consumer_active.store(false, Ordering::Release);
    }
}

impl ConsumerGuard<'_> {
    pub fn next(&self) -> Option<InterruptStatus> {
        self.channel.events.lock().pop_front()
    }
}

impl InterruptChannel {
    pub fn new() -> Self {
        Self { events: Mutex::new(Deque::new()), consumer_active: AtomicBool::new(false) }
    }

    /// Queues `status`. A full queue folds it into the newest event.
    pub fn post(&self, status: InterruptStatus) {
        let mut events = self.events.lock();
        if let Err(status) = events.push_back(status) {
            if let Some(newest) = events.back_mut() {
                *newest |= status;
            }
        }
    }

    /// Claims the consumer role, or `None` if another context holds it.
    pub fn try_consume(&self) -> Option<ConsumerGuard<'_>> {
        self.consumer_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ConsumerGuard { channel: self })
    }

    pub fn pending(&self) -> usize {
        self.events.lock().len()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for InterruptChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Interrupt service routine.
    ///
    /// Returns false when the adapter did not raise the interrupt.
    pub fn isr(&self) -> bool {
        let status = InterruptStatus::from_bits_truncate(self.device.read_register(Register::InterruptStatus));
        if status.is_empty() {
            return false;
        }
        self.device.write_register(Register::InterruptStatus, status.bits());
        self.events.post(status);
        true
    }

    /// Drains posted interrupt events.
    ///
    /// Returns immediately if another context is already draining. The
    /// draining context checks the channel again after giving up the
    /// consumer role, so an event posted while it was finishing up is not
    /// left behind.
    pub fn process_interrupts(&self) {
        loop {
            let Some(consumer) = self.events.try_consume() else {
                log::trace!("interrupt processing already active");
                return;
            };
            if !self.enter_section(Section::Interrupt) {
                return;
            }

            let mut completions = Completions::default();
            while let Some(status) = consumer.next() {
                log::trace!("interrupt {:?}", status);
                if status.intersects(InterruptStatus::FATAL) {
                    log::error!("fatal adapter error {:?}, requesting reset", status & InterruptStatus::FATAL);
                    self.adapter
                        .lock()
                        .flags
                        .insert(AdapterFlags::HARDWARE_FAILURE | AdapterFlags::RESET_REQUESTED);
                    break;
                }
                if status.intersects(InterruptStatus::TX_IOC | InterruptStatus::TX_REPORT_FULL) {
                    self.process_tx_reports(&mut completions);
                }
                if status.intersects(InterruptStatus::RX_IOC | InterruptStatus::RX_REPORT_FULL) {
                    self.process_rx_reports(&mut completions);
                }
            }
            drop(consumer);

            self.post_receive_buffers();
            self.dispatch(completions);
            self.leave_section(Section::Interrupt);

            if self.events.pending() == 0 {
                return;
            }
        }
    }

    /// `isr` followed by `process_interrupts`.
    pub fn handle_interrupt(&self) -> bool {
        let ours = self.isr();
        if ours {
            self.process_interrupts();
        }
        ours
    }
}

//! The SAR engine context
//!
//! [`SarEngine`] owns every piece of adapter state: the circuit registry,
//! both DMA queues, the report rings, the interrupt channel and the
//! statistics. The other modules extend it with their operations.
//!
//! Lock order, outermost first: `adapter`, `registry`, a circuit's
//! `state`, the circuit's `xmit` or `recv`, the engine `xmit` or `recv`
//! queue, then the circuit's `in_flight`. Upstream callbacks run with no
//! lock held; work that ends in a callback is collected in
//! [`Completions`] and handed to [`SarEngine::dispatch`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;
use hashbrown::HashMap;
use sar_api::hw::{
    ATM_155_CELL_RATE, RX_REPORT_ENTRY_SIZE, RX_REPORT_QUEUE_ENTRIES, TX_REPORT_ENTRY_SIZE,
    TX_REPORT_QUEUE_ENTRIES,
};
use sar_api::{
    ConfigSource, PacketDisposition, PacketToken, Register, Result, RxPacketToken, SarControl,
    SarDevice, SarStatistics, SendOutcome, SizeClass, Upstream, VcHandle,
};
use sar_api::sync::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::interrupt::{InterruptChannel, INTERRUPT_MASK};
use crate::receive::{Delivery, HeldPacket, RecvDmaQueue};
use crate::registry::VcRegistry;
use crate::report::ReportRing;
use crate::slot::SlotCounter;
use crate::stats::SarStats;
use crate::transmit::XmitDmaQueue;
use crate::vc::VcBlock;

bitflags::bitflags! {
    /// Adapter-wide condition flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdapterFlags: u32 {
        /// A reset is waiting for the active sections to finish
        const RESET_REQUESTED = 1 << 0;
        const RESET_IN_PROGRESS = 1 << 1;
        /// A fatal interrupt was seen; cleared by the next reset
        const HARDWARE_FAILURE = 1 << 2;
    }
}

/// Adapter-level state guarded by the adapter lock
#[derive(Debug)]
pub struct AdapterState {
    pub flags: AdapterFlags,
    /// Send batches currently being processed
    pub send_sections: usize,
    /// Interrupt processing passes currently running, nested ones included
    pub interrupt_sections: usize,
    /// CBR cell rate not yet reserved
    pub remaining_bandwidth: u32,
    /// Receive circuits each size class can still accept
    pub receive_vcs_available: [usize; 2],
}

impl AdapterState {
    fn sections_active(&self) -> bool {
        self.send_sections > 0 || self.interrupt_sections > 0
    }
}

/// Critical sections a reset must not interleave with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Send,
    Interrupt,
}

/// Upstream notifications owed once locks are dropped
#[derive(Debug, Default)]
pub struct Completions {
    /// Packets refused before they took a circuit reference
    pub rejected: Vec<(VcHandle, PacketToken, SendOutcome)>,
    /// Packets that held a circuit reference
    pub finished: Vec<(Arc<VcBlock>, PacketToken, SendOutcome)>,
    pub deliveries: Vec<Delivery>,
    /// Circuit references to drop without a notification
    pub released: Vec<Arc<VcBlock>>,
    pub reset_complete: bool,
}

impl Completions {
    pub fn is_empty(&self) -> bool {
        self.rejected.is_empty()
            && self.finished.is_empty()
            && self.deliveries.is_empty()
            && self.released.is_empty()
            && !self.reset_complete
    }
}

/// Slot counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotUsage {
    pub maximum: usize,
    pub remaining: usize,
}

impl From<&SlotCounter> for SlotUsage {
    fn from(counter: &SlotCounter) -> Self {
        Self { maximum: counter.maximum(), remaining: counter.remaining() }
    }
}

/// Adapter-wide resource snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub transmit_slots: SlotUsage,
    pub small_receive_slots: SlotUsage,
    pub big_receive_slots: SlotUsage,
    pub small_buffers_allocated: usize,
    pub big_buffers_allocated: usize,
    pub small_buffers_free: usize,
    pub big_buffers_free: usize,
    /// Receive packets retained by the upstream
    pub held_packets: usize,
}

/// Transmit queue lengths for one circuit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub seg_wait: usize,
    pub dma_wait: usize,
    pub dma_completing: usize,
}

/// Segmentation and reassembly engine for one adapter
pub struct SarEngine<D: SarDevice, U: Upstream> {
    pub(crate) device: D,
    pub(crate) upstream: U,
    pub(crate) config: EngineConfig,
    pub(crate) adapter: Mutex<AdapterState>,
    pub(crate) registry: RwLock<VcRegistry>,
    pub(crate) xmit: Mutex<XmitDmaQueue>,
    pub(crate) recv: Mutex<RecvDmaQueue>,
    pub(crate) tx_reports: Mutex<ReportRing>,
    pub(crate) rx_reports: Mutex<ReportRing>,
    pub(crate) events: InterruptChannel,
    pub(crate) held: Mutex<HashMap<RxPacketToken, HeldPacket>>,
    pub(crate) next_rx_token: AtomicU64,
    pub(crate) stats: SarStats,
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Builds an engine, allocates the report rings and initialises the
    /// adapter.
    pub fn new<C: ConfigSource + ?Sized>(device: D, upstream: U, source: &C) -> Result<Self> {
        let config = EngineConfig::load(source)?;
        let tx_reports = ReportRing::allocate(
            &device,
            Register::TxReportBase,
            Register::TxReportPointer,
            TX_REPORT_QUEUE_ENTRIES,
            TX_REPORT_ENTRY_SIZE,
        )?;
        let rx_reports = match ReportRing::allocate(
            &device,
            Register::RxReportBase,
            Register::RxReportPointer,
            RX_REPORT_QUEUE_ENTRIES,
            RX_REPORT_ENTRY_SIZE,
        ) {
            Ok(ring) => ring,
            Err(err) => {
                tx_reports.free(&device);
                return Err(err);
            }
        };

        let engine = Self {
            adapter: Mutex::new(AdapterState {
                flags: AdapterFlags::empty(),
                send_sections: 0,
                interrupt_sections: 0,
                remaining_bandwidth: ATM_155_CELL_RATE,
                receive_vcs_available: [config.receive_vcs_per_class; 2],
            }),
            registry: RwLock::new(VcRegistry::new(config.vc_hash_table_size)),
            xmit: Mutex::new(XmitDmaQueue::new(config.num_vcs)),
            recv: Mutex::new(RecvDmaQueue::new(config.num_vcs)),
            tx_reports: Mutex::new(tx_reports),
            rx_reports: Mutex::new(rx_reports),
            events: InterruptChannel::new(),
            held: Mutex::new(HashMap::new()),
            next_rx_token: AtomicU64::new(1),
            stats: SarStats::new(),
            device,
            upstream,
            config,
        };
        engine.init_device();
        log::info!(
            "SAR engine up: {} VCs, {}/{} byte receive buffers",
            engine.config.num_vcs,
            engine.config.small_buffer_size,
            engine.config.big_buffer_size
        );
        Ok(engine)
    }

    /// Resets the adapter and programs it from scratch.
    pub(crate) fn init_device(&self) {
        self.device.write_register(Register::SarControl, SarControl::RESET.bits());
        self.device.write_register(Register::Control2, self.config.control2());
        self.reset_report_rings();
        self.device.write_register(Register::InterruptMask, INTERRUPT_MASK.bits());
        self.device
            .write_register(Register::SarControl, (SarControl::TX_ENABLE | SarControl::RX_ENABLE).bits());
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn hardware_failed(&self) -> bool {
        self.adapter.lock().flags.contains(AdapterFlags::HARDWARE_FAILURE)
    }

    /// Marks a critical section active. Returns false, without entering,
    /// while a reset is running.
    pub(crate) fn enter_section(&self, section: Section) -> bool {
        let mut adapter = self.adapter.lock();
        if adapter.flags.contains(AdapterFlags::RESET_IN_PROGRESS) {
            return false;
        }
        match section {
            Section::Send => adapter.send_sections += 1,
            Section::Interrupt => adapter.interrupt_sections += 1,
        }
        true
    }

    /// Ends a critical section and runs a reset deferred behind it.
    pub(crate) fn leave_section(&self, section: Section) {
        let run = {
            let mut adapter = self.adapter.lock();
            match section {
                Section::Send => adapter.send_sections = adapter.send_sections.saturating_sub(1),
                Section::Interrupt => {
                    adapter.interrupt_sections = adapter.interrupt_sections.saturating_sub(1)
                }
            }
            self.claim_reset(&mut adapter)
        };
        if run {
            self.run_reset(true);
        }
    }

    /// Moves a requested reset to in-progress when nothing blocks it.
    pub(crate) fn claim_reset(&self, adapter: &mut AdapterState) -> bool {
        if !adapter.flags.contains(AdapterFlags::RESET_REQUESTED)
            || adapter.flags.contains(AdapterFlags::RESET_IN_PROGRESS)
            || adapter.sections_active()
        {
            return false;
        }
        adapter.flags.remove(AdapterFlags::RESET_REQUESTED);
        adapter.flags.insert(AdapterFlags::RESET_IN_PROGRESS);
        true
    }

    /// Delivers collected notifications and finishes deactivations they
    /// unblock.
    pub(crate) fn dispatch(&self, completions: Completions) {
        if completions.is_empty() {
            return;
        }
        let mut ready: Vec<Arc<VcBlock>> = Vec::new();
        let mut keep_ready = |block: Arc<VcBlock>| {
            if !ready.iter().any(|known| Arc::ptr_eq(known, &block)) {
                ready.push(block);
            }
        };

        for (vc, token, outcome) in completions.rejected {
            let block = self.registry.read().get(vc);
            self.notify_send(vc, block.as_deref(), token, outcome);
        }

        for (block, token, outcome) in completions.finished {
            self.notify_send(block.handle(), Some(&block), token, outcome);
            if block.release_reference() {
                keep_ready(block);
            }
        }

        let delivered = !completions.deliveries.is_empty();
        for Delivery { block, buffers, packet } in completions.deliveries {
            let token = packet.token;
            self.held.lock().insert(token, HeldPacket { block: block.clone(), buffers });
            let reclaim = match self.upstream.packet_received(block.handle(), &packet) {
                Ok(PacketDisposition::Retained) => false,
                Ok(PacketDisposition::Released) => true,
                Err(err) => {
                    log::debug!("upstream refused packet {:?}: {}", token, err);
                    true
                }
            };
            if reclaim {
                if let Some(Some(block)) = self.reclaim_packet(token) {
                    keep_ready(block);
                }
            }
        }
        if delivered {
            self.post_receive_buffers();
        }

        for block in completions.released {
            if block.release_reference() {
                keep_ready(block);
            }
        }

        if completions.reset_complete {
            self.upstream.reset_complete();
        }

        for block in ready {
            self.complete_deactivation(&block, true);
        }
    }

    pub fn stats(&self) -> SarStatistics {
        self.stats.snapshot()
    }

    pub fn slot_usage(&self) -> ResourceUsage {
        let transmit_slots = SlotUsage::from(&self.xmit.lock().slots.counter);
        let held_packets = self.held.lock().len();
        let recv = self.recv.lock();
        ResourceUsage {
            transmit_slots,
            small_receive_slots: SlotUsage::from(recv.slots.counter(SizeClass::Small)),
            big_receive_slots: SlotUsage::from(recv.slots.counter(SizeClass::Big)),
            small_buffers_allocated: recv.allocated(SizeClass::Small),
            big_buffers_allocated: recv.allocated(SizeClass::Big),
            small_buffers_free: recv.free_count(SizeClass::Small),
            big_buffers_free: recv.free_count(SizeClass::Big),
            held_packets,
        }
    }

    pub fn queue_depths(&self, vc: VcHandle) -> Result<QueueDepths> {
        let block = self.vc_block(vc)?;
        let seg_wait = block.xmit.lock().as_ref().map_or(0, |segment| segment.seg_wait.len());
        let dma_wait = self
            .xmit
            .lock()
            .dma_wait
            .iter()
            .filter(|(owner, _)| Arc::ptr_eq(owner, &block))
            .count();
        let dma_completing = block
            .in_flight
            .lock()
            .as_ref()
            .map_or(0, |in_flight| in_flight.dma_completing.len());
        Ok(QueueDepths { seg_wait, dma_wait, dma_completing })
    }

    pub fn active_vcs(&self) -> usize {
        self.registry.read().active_count()
    }
}

impl<D: SarDevice, U: Upstream> Drop for SarEngine<D, U> {
    fn drop(&mut self) {
        self.device.write_register(Register::InterruptMask, 0);
        self.device.write_register(Register::SarControl, SarControl::RESET.bits());

        for block in self.registry.get_mut().blocks() {
            block.xmit.lock().take();
            if let Some(in_flight) = block.in_flight.lock().take() {
                in_flight.free(&self.device);
            }
            block.recv.lock().take();
        }
        self.held.get_mut().clear();
        self.recv.get_mut().free_all(&self.device);
        self.tx_reports.get_mut().free(&self.device);
        self.rx_reports.get_mut().free(&self.device);
        log::debug!("SAR engine released");
    }
}

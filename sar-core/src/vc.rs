//! Virtual-circuit control blocks and lifecycle
//!
//! A circuit moves `Inactive -> Activating -> Active -> Deactivating ->
//! Inactive`. Every packet, receive assembly and held receive packet owns
//! one reference; the control block itself owns the first. Deactivation
//! waits for the count to fall back to 1 and never busy-waits.

use alloc::sync::Arc;
use sar_api::error::{busy, invalid_argument, invalid_state, not_found, unsupported};
use sar_api::hw::ATM_155_CELL_RATE;
use sar_api::{
    AalType, CompletionStatus, Error, Result, SarDevice, SarStatistics, ServiceCategory,
    SizeClass, Upstream, VcHandle, VcParameters, VpiVci, MAX_AAL5_PDU_SIZE,
};
use sar_api::sync::Mutex;

use crate::engine::{AdapterFlags, SarEngine};
use crate::receive::RecvSegment;
use crate::stats::SarStats;
use crate::transmit::{XmitInFlight, XmitSegment};

/// Lifecycle of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcLifecycle {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

impl VcLifecycle {
    fn can_become(self, next: VcLifecycle) -> bool {
        use VcLifecycle::*;
        matches!(
            (self, next),
            (Inactive, Activating)
                | (Activating, Active)
                | (Activating, Inactive)
                | (Active, Deactivating)
                | (Deactivating, Inactive)
        )
    }

    /// Hardware may still report work for the circuit.
    pub fn is_open(self) -> bool {
        matches!(self, VcLifecycle::Active | VcLifecycle::Deactivating)
    }
}

bitflags::bitflags! {
    /// Per-circuit attributes orthogonal to the lifecycle
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VcFlags: u32 {
        /// Transmit direction configured
        const TRANSMIT = 1 << 0;
        /// Receive direction configured
        const RECEIVE = 1 << 1;
        /// Adapter reset is draining this circuit
        const RESETTING = 1 << 2;
        /// Resource setup failed during activation
        const ERROR = 1 << 3;
    }
}

/// Mutable circuit state, guarded by the circuit lock
#[derive(Debug)]
pub struct VcState {
    pub lifecycle: VcLifecycle,
    pub flags: VcFlags,
    pub references: u32,
    pub params: Option<VcParameters>,
    /// Receive size class whose quota this circuit holds
    pub class: Option<SizeClass>,
    /// CBR cell rate reserved from the adapter
    pub bandwidth: u32,
}

impl VcState {
    fn new() -> Self {
        Self {
            lifecycle: VcLifecycle::Inactive,
            flags: VcFlags::empty(),
            references: 1,
            params: None,
            class: None,
            bandwidth: 0,
        }
    }

    pub fn transition(&mut self, next: VcLifecycle) -> Result<()> {
        if !self.lifecycle.can_become(next) {
            return Err(invalid_state("illegal circuit lifecycle transition"));
        }
        self.lifecycle = next;
        Ok(())
    }

    pub fn reference(&mut self) {
        self.references += 1;
    }

    pub fn dereference(&mut self) {
        debug_assert!(self.references > 1);
        self.references = self.references.saturating_sub(1).max(1);
    }

    /// Only the control block's own reference is left on a closing circuit.
    pub fn deactivation_ready(&self) -> bool {
        self.lifecycle == VcLifecycle::Deactivating
            && self.references == 1
            && !self.flags.contains(VcFlags::RESETTING)
    }

    pub fn can_transmit(&self) -> bool {
        self.lifecycle == VcLifecycle::Active && self.flags.contains(VcFlags::TRANSMIT)
    }

    pub fn accepts_receive(&self, class: SizeClass) -> bool {
        self.lifecycle == VcLifecycle::Active
            && self.flags.contains(VcFlags::RECEIVE)
            && self.class == Some(class)
    }

    pub fn circuit(&self) -> Option<u16> {
        self.params.map(|params| params.vpi_vci.circuit_id())
    }
}

/// Circuit control block
///
/// Lock order inside a block: `state`, then `xmit` or `recv`, then the
/// adapter DMA queues, then `in_flight`.
#[derive(Debug)]
pub struct VcBlock {
    handle: VcHandle,
    pub state: Mutex<VcState>,
    /// Packets waiting for a pad/trailer buffer
    pub xmit: Mutex<Option<XmitSegment>>,
    /// Packets owned by the hardware, oldest first
    pub in_flight: Mutex<Option<XmitInFlight>>,
    /// In-progress receive assembly
    pub recv: Mutex<Option<RecvSegment>>,
    pub stats: SarStats,
}

impl VcBlock {
    pub fn new(handle: VcHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(VcState::new()),
            xmit: Mutex::new(None),
            in_flight: Mutex::new(None),
            recv: Mutex::new(None),
            stats: SarStats::new(),
        }
    }

    pub fn handle(&self) -> VcHandle {
        self.handle
    }

    /// Drops one reference; true when the circuit can finish deactivating.
    pub fn release_reference(&self) -> bool {
        let mut state = self.state.lock();
        state.dereference();
        state.deactivation_ready()
    }
}

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcInfo {
    pub lifecycle: VcLifecycle,
    pub references: u32,
    pub vpi_vci: Option<VpiVci>,
    pub class: Option<SizeClass>,
}

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    pub(crate) fn vc_block(&self, vc: VcHandle) -> Result<Arc<VcBlock>> {
        self.registry.read().get(vc).ok_or_else(|| not_found("unknown circuit handle"))
    }

    /// Creates an inactive circuit.
    pub fn create_vc(&self) -> VcHandle {
        let handle = self.registry.write().allocate().handle();
        log::debug!("created circuit {:?}", handle);
        handle
    }

    /// Deletes an inactive circuit with no outstanding work.
    pub fn delete_vc(&self, vc: VcHandle) -> Result<()> {
        let mut registry = self.registry.write();
        let block = registry.get(vc).ok_or_else(|| not_found("unknown circuit handle"))?;
        {
            let state = block.state.lock();
            if state.lifecycle != VcLifecycle::Inactive {
                return Err(invalid_state("circuit is active or deactivating"));
            }
            if state.references != 1 {
                return Err(busy("circuit still referenced"));
            }
        }
        registry.release(vc)?;
        log::debug!("deleted circuit {:?}", vc);
        Ok(())
    }

    fn validate_parameters(&self, params: &VcParameters) -> Result<()> {
        if !matches!(params.service_category, ServiceCategory::Cbr | ServiceCategory::Ubr) {
            return Err(unsupported("only CBR and UBR circuits are supported"));
        }
        if params.aal != AalType::Aal5 {
            return Err(unsupported("only AAL5 is supported"));
        }
        if params.vpi_vci.vpi != 0 {
            return Err(invalid_argument("VPI must be 0"));
        }
        if params.vpi_vci.vci as usize >= self.config.num_vcs {
            return Err(invalid_argument("VCI beyond the adapter VC table"));
        }
        if params.transmit.is_none() && params.receive.is_none() {
            return Err(invalid_argument("circuit has no direction"));
        }
        for flow in [params.transmit, params.receive].into_iter().flatten() {
            if flow.max_sdu_size == 0 || flow.max_sdu_size as usize > MAX_AAL5_PDU_SIZE {
                return Err(invalid_argument("max SDU size outside 1..=65535"));
            }
        }
        Ok(())
    }

    /// Allocates resources for `params` and hashes the circuit.
    pub fn activate_vc(&self, vc: VcHandle, params: &VcParameters) -> Result<()> {
        if self
            .adapter
            .lock()
            .flags
            .intersects(AdapterFlags::RESET_REQUESTED | AdapterFlags::RESET_IN_PROGRESS)
        {
            return Err(Error::ResetInProgress);
        }
        let block = self.vc_block(vc)?;
        self.validate_parameters(params)?;
        let circuit = params.vpi_vci.circuit_id();
        if self.registry.read().lookup(circuit).is_some() {
            return Err(invalid_state("circuit id already active"));
        }

        block.state.lock().transition(VcLifecycle::Activating)?;

        if let Err(err) = self.allocate_vc_resources(&block, params) {
            log::warn!("activation of {} failed: {}", params.vpi_vci, err);
            self.release_vc_resources(&block);
            let mut state = block.state.lock();
            state.flags.insert(VcFlags::ERROR);
            state.transition(VcLifecycle::Inactive)?;
            return Err(err);
        }

        if let Err(err) = self.registry.write().insert(circuit, block.clone()) {
            self.release_vc_resources(&block);
            block.state.lock().transition(VcLifecycle::Inactive)?;
            return Err(err);
        }

        {
            let mut state = block.state.lock();
            state.params = Some(*params);
            state.flags.remove(VcFlags::ERROR);
            state.flags.set(VcFlags::TRANSMIT, params.transmit.is_some());
            state.flags.set(VcFlags::RECEIVE, params.receive.is_some());
            state.transition(VcLifecycle::Active)?;
        }

        if params.receive.is_some() {
            self.post_receive_buffers();
        }
        log::info!("circuit {} active", params.vpi_vci);
        Ok(())
    }

    fn allocate_vc_resources(&self, block: &Arc<VcBlock>, params: &VcParameters) -> Result<()> {
        if let Some(transmit) = params.transmit {
            if params.service_category == ServiceCategory::Cbr {
                let mut adapter = self.adapter.lock();
                if transmit.peak_cell_rate > adapter.remaining_bandwidth {
                    return Err(busy("insufficient transmit bandwidth"));
                }
                adapter.remaining_bandwidth -= transmit.peak_cell_rate;
                drop(adapter);
                block.state.lock().bandwidth = transmit.peak_cell_rate;
            }
            let (segment, in_flight) = XmitSegment::allocate(&self.device)?;
            *block.xmit.lock() = Some(segment);
            *block.in_flight.lock() = Some(in_flight);
        }

        if let Some(receive) = params.receive {
            let class = self.config.receive_class(receive.max_sdu_size);
            {
                let mut adapter = self.adapter.lock();
                let available = &mut adapter.receive_vcs_available[class.index()];
                if *available == 0 {
                    return Err(busy("no receive circuits left in size class"));
                }
                *available -= 1;
            }
            block.state.lock().class = Some(class);

            let pool = {
                let mut recv = self.recv.lock();
                if recv.allocated(class) >= self.config.max_receive_buffers {
                    log::debug!("{:?} class already holds its buffer cap", class);
                    None
                } else {
                    Some(recv.allocate_pool(
                        &self.device,
                        class,
                        self.config.receive_buffers_per_pool,
                        self.config.buffer_size(class),
                    )?)
                }
            };
            *block.recv.lock() = Some(RecvSegment::new(class, pool));
        }
        Ok(())
    }

    /// Returns everything `allocate_vc_resources` took. Safe on partial setups.
    fn release_vc_resources(&self, block: &Arc<VcBlock>) {
        let (class, bandwidth) = {
            let mut state = block.state.lock();
            let taken = (state.class.take(), state.bandwidth);
            state.bandwidth = 0;
            taken
        };

        block.xmit.lock().take();
        if let Some(in_flight) = block.in_flight.lock().take() {
            in_flight.free(&self.device);
        }

        if let Some(mut segment) = block.recv.lock().take() {
            let mut recv = self.recv.lock();
            if let Some(assembly) = segment.assembly.take() {
                for (buffer, _) in assembly.buffers {
                    recv.free_buffer(&self.device, buffer);
                }
            }
            if let Some(pool) = segment.pool {
                recv.release_pool(&self.device, pool);
            }
        }

        let mut adapter = self.adapter.lock();
        adapter.remaining_bandwidth = (adapter.remaining_bandwidth + bandwidth).min(ATM_155_CELL_RATE);
        if let Some(class) = class {
            adapter.receive_vcs_available[class.index()] += 1;
        }
    }

    /// Starts tearing down an active circuit.
    ///
    /// Returns `Complete` when nothing was outstanding. Otherwise the
    /// circuit drains and `Upstream::deactivate_complete` fires once the
    /// last reference goes away, or once a running reset finishes.
    pub fn deactivate_vc(&self, vc: VcHandle) -> Result<CompletionStatus> {
        let resetting = self
            .adapter
            .lock()
            .flags
            .intersects(AdapterFlags::RESET_REQUESTED | AdapterFlags::RESET_IN_PROGRESS);
        let block = self.vc_block(vc)?;
        let ready = {
            let mut state = block.state.lock();
            match state.lifecycle {
                VcLifecycle::Deactivating => return Err(Error::Closing),
                VcLifecycle::Active => {}
                _ => return Err(invalid_state("circuit is not active")),
            }
            state.transition(VcLifecycle::Deactivating)?;

            // a half-built packet can never finish now
            let abandoned = block
                .recv
                .lock()
                .as_mut()
                .and_then(|segment| segment.assembly.take());
            if let Some(assembly) = abandoned {
                let mut recv = self.recv.lock();
                for (buffer, _) in assembly.buffers {
                    recv.free_buffer(&self.device, buffer);
                }
                state.dereference();
            }

            !resetting && state.deactivation_ready()
        };

        if ready {
            self.complete_deactivation(&block, false);
            Ok(CompletionStatus::Complete)
        } else {
            Ok(CompletionStatus::Pending)
        }
    }

    /// Finishes a deactivation once only the block's own reference is left.
    pub(crate) fn complete_deactivation(&self, block: &Arc<VcBlock>, notify: bool) {
        let circuit = {
            let state = block.state.lock();
            if !state.deactivation_ready() {
                return;
            }
            state.circuit()
        };

        if let Some(circuit) = circuit {
            self.registry.write().remove(circuit, block.handle());
        }
        self.release_vc_resources(block);

        let vpi_vci = {
            let mut state = block.state.lock();
            if state.transition(VcLifecycle::Inactive).is_err() {
                return;
            }
            state.flags.remove(VcFlags::TRANSMIT | VcFlags::RECEIVE);
            state.params.take().map(|params| params.vpi_vci)
        };

        if let Some(vpi_vci) = vpi_vci {
            log::info!("circuit {} deactivated", vpi_vci);
        }
        if notify {
            self.upstream.deactivate_complete(block.handle());
        }
    }

    pub fn vc_info(&self, vc: VcHandle) -> Result<VcInfo> {
        let block = self.vc_block(vc)?;
        let state = block.state.lock();
        Ok(VcInfo {
            lifecycle: state.lifecycle,
            references: state.references,
            vpi_vci: state.params.map(|params| params.vpi_vci),
            class: state.class,
        })
    }

    pub fn vc_stats(&self, vc: VcHandle) -> Result<SarStatistics> {
        Ok(self.vc_block(vc)?.stats.snapshot())
    }
}

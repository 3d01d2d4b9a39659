//! Common test utilities
//!
//! A recording upstream, an engine builder and helpers that stage packet
//! payloads in simulated shared memory.

use sar_api::{
    AalType, Error, FlowParameters, PacketDisposition, PacketToken, PhysFragment, ReceivedPacket,
    Result, SarConfig, SarDevice, SendOutcome, ServiceCategory, TxPacket, Upstream, VcHandle,
    VcParameters, VpiVci,
};
use sar_core::SarEngine;
use sar_core::sim::SimAdapter;
use spin::Mutex;
use std::sync::Arc;

/// Engine type every integration test runs
pub type TestEngine = SarEngine<SimAdapter, RecordingUpstream>;

/// How the recording upstream answers `packet_received`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    Release,
    Retain,
    Busy,
}

/// Something the engine told the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Sent { vc: VcHandle, token: PacketToken, outcome: SendOutcome },
    Received(ReceivedPacket),
    Deactivated(VcHandle),
    ResetComplete,
}

/// Runs inside `send_complete`, after the event is recorded
pub type SendHook = Arc<dyn Fn(PacketToken, SendOutcome) + Send + Sync>;

/// Upstream that records every notification in order
pub struct RecordingUpstream {
    events: Mutex<Vec<UpstreamEvent>>,
    mode: Mutex<ReceiveMode>,
    on_send: Mutex<Option<SendHook>>,
}

impl RecordingUpstream {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            mode: Mutex::new(ReceiveMode::Release),
            on_send: Mutex::new(None),
        }
    }

    /// Calls `hook` on every send completion. The hook may call back into
    /// the engine.
    pub fn on_send(&self, hook: impl Fn(PacketToken, SendOutcome) + Send + Sync + 'static) {
        *self.on_send.lock() = Some(Arc::new(hook));
    }

    pub fn set_mode(&self, mode: ReceiveMode) {
        *self.mode.lock() = mode;
    }

    pub fn events(&self) -> Vec<UpstreamEvent> {
        self.events.lock().clone()
    }

    /// Send completions in the order they were reported.
    pub fn sends(&self) -> Vec<(PacketToken, SendOutcome)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UpstreamEvent::Sent { token, outcome, .. } => Some((*token, *outcome)),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self) -> Vec<ReceivedPacket> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UpstreamEvent::Received(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deactivated(&self) -> Vec<VcHandle> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UpstreamEvent::Deactivated(vc) => Some(*vc),
                _ => None,
            })
            .collect()
    }

    pub fn reset_completions(&self) -> usize {
        self.events.lock().iter().filter(|event| **event == UpstreamEvent::ResetComplete).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for RecordingUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Upstream for RecordingUpstream {
    fn packet_received(&self, _vc: VcHandle, packet: &ReceivedPacket) -> Result<PacketDisposition> {
        self.events.lock().push(UpstreamEvent::Received(packet.clone()));
        match *self.mode.lock() {
            ReceiveMode::Release => Ok(PacketDisposition::Released),
            ReceiveMode::Retain => Ok(PacketDisposition::Retained),
            ReceiveMode::Busy => Err(Error::Busy("receiver out of resources".into())),
        }
    }

    fn send_complete(&self, vc: VcHandle, token: PacketToken, outcome: SendOutcome) {
        self.events.lock().push(UpstreamEvent::Sent { vc, token, outcome });
        let hook = self.on_send.lock().clone();
        if let Some(hook) = hook {
            hook(token, outcome);
        }
    }

    fn deactivate_complete(&self, vc: VcHandle) {
        self.events.lock().push(UpstreamEvent::Deactivated(vc));
    }

    fn reset_complete(&self) {
        self.events.lock().push(UpstreamEvent::ResetComplete);
    }
}

/// Smaller rings and pools than the defaults so limits are easy to hit.
pub fn small_config() -> SarConfig {
    SarConfig { receive_buffers_per_pool: 8, num_vcs: 64, ..SarConfig::default() }
}

pub fn engine() -> TestEngine {
    engine_with(small_config())
}

pub fn engine_with(config: SarConfig) -> TestEngine {
    SarEngine::new(SimAdapter::new(), RecordingUpstream::new(), &config).expect("engine init")
}

/// UBR AAL5 parameters; `None` leaves a direction unconfigured.
pub fn ubr(vci: u16, transmit_sdu: Option<u32>, receive_sdu: Option<u32>) -> VcParameters {
    let flow = |max_sdu_size| FlowParameters { peak_cell_rate: 0, max_sdu_size };
    VcParameters {
        vpi_vci: VpiVci::new(0, vci),
        aal: AalType::Aal5,
        service_category: ServiceCategory::Ubr,
        transmit: transmit_sdu.map(flow),
        receive: receive_sdu.map(flow),
    }
}

/// CBR transmit-only parameters at `peak_cell_rate`.
pub fn cbr(vci: u16, peak_cell_rate: u32) -> VcParameters {
    VcParameters {
        vpi_vci: VpiVci::new(0, vci),
        aal: AalType::Aal5,
        service_category: ServiceCategory::Cbr,
        transmit: Some(FlowParameters { peak_cell_rate, max_sdu_size: 9180 }),
        receive: None,
    }
}

/// Creates and activates a circuit.
pub fn open(engine: &TestEngine, params: VcParameters) -> VcHandle {
    let vc = engine.create_vc();
    engine.activate_vc(vc, &params).expect("activate");
    vc
}

/// Bidirectional circuit receiving into small buffers.
pub fn open_duplex(engine: &TestEngine, vci: u16) -> VcHandle {
    open(engine, ubr(vci, Some(9180), Some(1500)))
}

/// Copies each payload into its own shared-memory fragment.
pub fn packet(engine: &TestEngine, token: u64, payloads: &[&[u8]]) -> TxPacket {
    let device = engine.device();
    let fragments = payloads
        .iter()
        .map(|payload| {
            let addr = device.alloc_shared(payload.len().max(1)).expect("fragment memory");
            device.write_shared(addr, payload);
            PhysFragment::new(addr, payload.len() as u32)
        })
        .collect();
    TxPacket::new(PacketToken(token), fragments)
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|n| (n as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Engine shared with upstream hooks, which hold it weakly.
pub fn shared_engine() -> Arc<TestEngine> {
    Arc::new(engine())
}

/// Lets the simulated adapter finish `count` transmits and processes the
/// resulting interrupt.
pub fn complete_transmits(engine: &TestEngine, count: usize) -> usize {
    let completed = engine.device().complete_transmits(count);
    engine.handle_interrupt();
    completed
}

/// CPCS-PDU for `payload`: payload, zero padding and trailer.
pub fn aal5_pdu(payload: &[u8], info: sar_api::Aal5Info) -> Vec<u8> {
    let mut pdu = payload.to_vec();
    pdu.resize(sar_core::aal5::pdu_length(payload.len()) - sar_core::aal5::TRAILER_SIZE, 0);
    pdu.extend_from_slice(&sar_core::aal5::Aal5Trailer::new(info, payload.len() as u16).to_bytes());
    pdu
}

//! Adapter reset and recovery
//!
//! A reset aborts every transmit, abandons every partial reassembly,
//! reprograms the adapter and reposts the free receive buffers. It never
//! runs inside a send batch or interrupt processing; a request made then
//! is latched and carried out when the last such section ends. A send
//! batch that arrives while a reset runs is aborted whole.

use alloc::vec::Vec;
use sar_api::{CompletionStatus, Result, SarDevice, Upstream};

use crate::engine::{AdapterFlags, Completions, SarEngine};
use crate::vc::VcFlags;

impl<D: SarDevice, U: Upstream> SarEngine<D, U> {
    /// Requests an adapter reset.
    ///
    /// Returns `Complete` when the reset ran before returning. `Pending`
    /// means it was deferred or is already underway, and
    /// `Upstream::reset_complete` follows once it finishes.
    pub fn reset(&self) -> Result<CompletionStatus> {
        let run = {
            let mut adapter = self.adapter.lock();
            if adapter.flags.contains(AdapterFlags::RESET_IN_PROGRESS) {
                return Ok(CompletionStatus::Pending);
            }
            adapter.flags.insert(AdapterFlags::RESET_REQUESTED);
            self.claim_reset(&mut adapter)
        };

        if run {
            self.run_reset(false);
            Ok(CompletionStatus::Complete)
        } else {
            log::debug!("reset deferred behind an active section");
            Ok(CompletionStatus::Pending)
        }
    }

    /// Carries out a claimed reset.
    pub(crate) fn run_reset(&self, notify: bool) {
        log::info!("adapter reset started");
        let blocks = self.registry.read().blocks();
        for block in &blocks {
            block.state.lock().flags.insert(VcFlags::RESETTING);
        }

        let mut completions = Completions::default();
        self.abort_transmits(&blocks, &mut completions);
        self.abandon_receives(&blocks, &mut completions);

        self.init_device();
        self.events.clear();

        for block in &blocks {
            block.state.lock().flags.remove(VcFlags::RESETTING);
        }
        self.adapter
            .lock()
            .flags
            .remove(AdapterFlags::RESET_IN_PROGRESS | AdapterFlags::HARDWARE_FAILURE);

        self.post_receive_buffers();
        completions.reset_complete = notify;
        self.dispatch(completions);

        // deactivations that had nothing left to drain were held by the reset
        let deferred: Vec<_> = blocks
            .into_iter()
            .filter(|block| block.state.lock().deactivation_ready())
            .collect();
        for block in deferred {
            self.complete_deactivation(&block, true);
        }
        log::info!("adapter reset finished");
    }
}

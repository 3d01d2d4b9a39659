//! Virtual-circuit registry
//!
//! Every circuit control block lives in a generational arena addressed by
//! [`VcHandle`]. Active circuits are additionally chained into a small hash
//! table keyed by `circuit id % table_size`, which is what the completion
//! path uses to resolve report entries.

use alloc::sync::Arc;
use alloc::vec::Vec;
use sar_api::error::{invalid_state, not_found};
use sar_api::{Result, VcHandle};

use crate::vc::VcBlock;

struct ArenaSlot {
    generation: u32,
    block: Option<Arc<VcBlock>>,
}

/// Arena of circuit control blocks plus the active-circuit hash table
pub struct VcRegistry {
    slots: Vec<ArenaSlot>,
    spare: Vec<u32>,
    buckets: Vec<Vec<(u16, Arc<VcBlock>)>>,
}

impl VcRegistry {
    pub fn new(table_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(table_size);
        buckets.resize_with(table_size.max(1), Vec::new);
        Self { slots: Vec::new(), spare: Vec::new(), buckets }
    }

    fn bucket(&self, circuit: u16) -> usize {
        circuit as usize % self.buckets.len()
    }

    /// Creates a control block and returns it.
    pub fn allocate(&mut self) -> Arc<VcBlock> {
        let index = match self.spare.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ArenaSlot { generation: 0, block: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let block = Arc::new(VcBlock::new(VcHandle::new(index, slot.generation)));
        slot.block = Some(block.clone());
        block
    }

    /// Resolves a handle, rejecting stale generations.
    pub fn get(&self, handle: VcHandle) -> Option<Arc<VcBlock>> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.block.clone()
    }

    /// Drops the control block behind `handle` and retires the handle.
    pub fn release(&mut self, handle: VcHandle) -> Result<Arc<VcBlock>> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .ok_or_else(|| not_found("stale circuit handle"))?;
        let block = slot.block.take().ok_or_else(|| not_found("circuit already deleted"))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.spare.push(handle.index());
        Ok(block)
    }

    /// Hashes an active circuit under its circuit id.
    pub fn insert(&mut self, circuit: u16, block: Arc<VcBlock>) -> Result<()> {
        let bucket = self.bucket(circuit);
        if self.buckets[bucket].iter().any(|(id, _)| *id == circuit) {
            return Err(invalid_state("circuit id already active"));
        }
        self.buckets[bucket].push((circuit, block));
        Ok(())
    }

    /// Unhashes `handle` from `circuit`. Returns whether it was present.
    pub fn remove(&mut self, circuit: u16, handle: VcHandle) -> bool {
        let bucket = self.bucket(circuit);
        let chain = &mut self.buckets[bucket];
        let before = chain.len();
        chain.retain(|(id, block)| !(*id == circuit && block.handle() == handle));
        chain.len() != before
    }

    /// Finds the active circuit with `circuit` id.
    pub fn lookup(&self, circuit: u16) -> Option<Arc<VcBlock>> {
        self.buckets[self.bucket(circuit)]
            .iter()
            .find(|(id, _)| *id == circuit)
            .map(|(_, block)| block.clone())
    }

    /// All control blocks, active or not.
    pub fn blocks(&self) -> Vec<Arc<VcBlock>> {
        self.slots.iter().filter_map(|slot| slot.block.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

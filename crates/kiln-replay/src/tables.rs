//! Object tables: per-tag Hash → handle maps.
//!
//! An entry is reserved (inserted as NULL) by the thread that enqueues the
//! work item and overwritten by the worker that creates the object, so
//! presence means "enqueued" and a non-null value means "created". Nothing
//! holds references into a table; workers write results keyed by hash, which
//! keeps entry addresses irrelevant.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use kiln_archive::Hash;
use kiln_driver::{
    DescriptorSetLayoutHandle, PipelineHandle, PipelineLayoutHandle, RenderPassHandle,
    SamplerHandle, ShaderModuleHandle,
};

#[derive(Debug)]
pub struct HandleTable<H> {
    map: Mutex<HashMap<Hash, H>>,
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<H: Copy + Default + PartialEq> HandleTable<H> {
    fn lock(&self) -> MutexGuard<'_, HashMap<Hash, H>> {
        match self.map.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mark `hash` as enqueued; the value stays NULL until a worker stores
    /// the created handle.
    pub fn reserve(&self, hash: Hash) {
        self.lock().entry(hash).or_default();
    }

    pub fn store(&self, hash: Hash, handle: H) {
        self.lock().insert(hash, handle);
    }

    pub fn get(&self, hash: Hash) -> Option<H> {
        self.lock().get(&hash).copied()
    }

    pub fn contains(&self, hash: Hash) -> bool {
        self.lock().contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entries holding a created (non-null) handle. Placeholder entries for
    /// enqueued-but-failed items are excluded.
    pub fn live_len(&self) -> usize {
        self.lock()
            .values()
            .filter(|handle| **handle != H::default())
            .count()
    }

    /// Remove and return every non-null handle, for teardown.
    pub fn take_live_handles(&self) -> Vec<H> {
        let mut map = self.lock();
        let handles = map
            .values()
            .copied()
            .filter(|handle| *handle != H::default())
            .collect();
        map.clear();
        handles
    }
}

#[derive(Debug, Default)]
pub struct ObjectTables {
    pub samplers: HandleTable<SamplerHandle>,
    pub descriptor_set_layouts: HandleTable<DescriptorSetLayoutHandle>,
    pub pipeline_layouts: HandleTable<PipelineLayoutHandle>,
    pub render_passes: HandleTable<RenderPassHandle>,
    pub shader_modules: HandleTable<ShaderModuleHandle>,
    pub graphics_pipelines: HandleTable<PipelineHandle>,
    pub compute_pipelines: HandleTable<PipelineHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_does_not_clobber_a_stored_handle() {
        let table = HandleTable::<PipelineHandle>::default();
        table.reserve(1);
        assert_eq!(table.get(1), Some(PipelineHandle::NULL));

        table.store(1, PipelineHandle(42));
        table.reserve(1);
        assert_eq!(table.get(1), Some(PipelineHandle(42)));
    }

    #[test]
    fn take_live_handles_skips_nulls_and_clears() {
        let table = HandleTable::<PipelineHandle>::default();
        table.reserve(1);
        table.store(2, PipelineHandle(7));
        table.store(3, PipelineHandle(9));

        let mut handles = table.take_live_handles();
        handles.sort_by_key(|h| h.0);
        assert_eq!(handles, vec![PipelineHandle(7), PipelineHandle(9)]);
        assert!(table.is_empty());
    }
}

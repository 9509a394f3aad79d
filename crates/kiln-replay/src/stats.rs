//! Process-local replay statistics.
//!
//! Workers feed relaxed atomics; snapshots are taken after the final drain,
//! so totals are exact for a completed replay. When a shared control block is
//! attached these counters are mirrored there as well; the local copy is
//! always maintained so the summary never depends on shared memory.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct KindCounters {
    pub total: AtomicU32,
    pub completed: AtomicU32,
    pub skipped: AtomicU32,
    pub successful: AtomicU32,
}

impl KindCounters {
    pub fn snapshot(&self) -> KindSnapshot {
        KindSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KindSnapshot {
    pub total: u32,
    pub completed: u32,
    pub skipped: u32,
    pub successful: u32,
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    pub graphics: KindCounters,
    pub compute: KindCounters,
    pub total_modules: AtomicU32,
    pub banned_modules: AtomicU32,

    pub shader_module_count: AtomicU32,
    pub shader_module_ns: AtomicU64,
    pub graphics_pipeline_ns: AtomicU64,
    pub compute_pipeline_ns: AtomicU64,
}

impl ReplayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            graphics: self.graphics.snapshot(),
            compute: self.compute.snapshot(),
            total_modules: self.total_modules.load(Ordering::Relaxed),
            banned_modules: self.banned_modules.load(Ordering::Relaxed),
            shader_module_count: self.shader_module_count.load(Ordering::Relaxed),
            shader_module_ns: self.shader_module_ns.load(Ordering::Relaxed),
            graphics_pipeline_ns: self.graphics_pipeline_ns.load(Ordering::Relaxed),
            compute_pipeline_ns: self.compute_pipeline_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub graphics: KindSnapshot,
    pub compute: KindSnapshot,
    pub total_modules: u32,
    pub banned_modules: u32,
    pub shader_module_count: u32,
    pub shader_module_ns: u64,
    pub graphics_pipeline_ns: u64,
    pub compute_pipeline_ns: u64,
}

/// Object counts and timings reported at the end of a replay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub samplers: usize,
    pub descriptor_set_layouts: usize,
    pub pipeline_layouts: usize,
    pub shader_modules: usize,
    pub render_passes: usize,
    pub graphics_pipelines: usize,
    pub compute_pipelines: usize,

    pub stats: StatsSnapshot,
    pub worker_idle_ns: u64,
    pub worker_total_ns: u64,
}

impl ReplaySummary {
    pub fn total_objects(&self) -> usize {
        self.samplers
            + self.descriptor_set_layouts
            + self.pipeline_layouts
            + self.shader_modules
            + self.render_passes
            + self.graphics_pipelines
            + self.compute_pipelines
    }
}

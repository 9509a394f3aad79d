//! The replay engine.
//!
//! Implements the deserializer's [`StateCreator`] callbacks: trivial objects
//! are created synchronously on the calling thread, shader modules and
//! pipelines become work items for the pool. Pipelines are classified by
//! derivation and by their position relative to the configured index range;
//! derivatives are held back and resolved in levels once their tag's normal
//! pass completes.
//!
//! Per-tag pipeline indices are assigned on the parsing thread, so they are
//! stable across runs and across processes regardless of worker scheduling.
//! Derivatives never consume an index during the normal pass; they are
//! indexed last, in resolution order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{error, info};

use kiln_archive::Hash;
use kiln_driver::{
    ComputePipelineRefs, Device, DeviceOptions, DriverBackend, GraphicsPipelineRefs,
    PipelineCacheHandle, PipelineHandle, SamplerHandle, ShaderModuleHandle,
};
use kiln_state::{
    ApplicationInfo, ComputePipelineCreateInfo, DescriptorSetLayoutCreateInfo, DeviceFeatures,
    GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo, RenderPassCreateInfo, SamplerCreateInfo,
    ShaderModuleCreateInfo, StateCreator,
};

use crate::cache;
use crate::control::ControlHandle;
use crate::error::{ReplayError, Result};
use crate::queue::WorkerPool;
use crate::stats::{KindCounters, ReplayStats, ReplaySummary};
use crate::tables::{HandleTable, ObjectTables};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphics => f.write_str("graphics"),
            Self::Compute => f.write_str("compute"),
        }
    }
}

/// Half-open `[start, end)` pipeline index range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRange {
    pub start: u32,
    pub end: u32,
}

impl IndexRange {
    pub const ALL: Self = Self {
        start: 0,
        end: u32::MAX,
    };
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(self, index: u32) -> bool {
        index >= self.start && index < self.end
    }

    pub fn len(self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(self) -> bool {
        self.end <= self.start
    }
}

impl Default for IndexRange {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub device: DeviceOptions,
    pub pipeline_cache: bool,
    pub on_disk_pipeline_cache_path: Option<PathBuf>,
    /// Worker count; 0 means hardware parallelism.
    pub num_threads: usize,
    /// Compile every work item this many times, for throughput measurement.
    pub loop_count: u32,
    pub graphics_range: IndexRange,
    pub compute_range: IndexRange,
    /// Range accounting is owned by a supervising master rather than by this
    /// process: out-of-range pipelines are someone else's shard and must not
    /// be counted skipped here.
    pub slave: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            device: DeviceOptions::default(),
            pipeline_cache: false,
            on_disk_pipeline_cache_path: None,
            num_threads: 0,
            loop_count: 1,
            graphics_range: IndexRange::ALL,
            compute_range: IndexRange::ALL,
            slave: false,
        }
    }
}

enum WorkItem {
    ShaderModule {
        hash: Hash,
        info: Arc<ShaderModuleCreateInfo>,
    },
    Pipeline(PipelineWork),
}

struct PipelineWork {
    kind: PipelineKind,
    hash: Hash,
    /// The stable pipeline index this item accounts for, or `None` for
    /// pipelines compiled only as derivation prerequisites outside the shard
    /// range.
    index: Option<u32>,
    /// `None` means the item is unbuildable (masked or failed references)
    /// and only exists to keep counters coherent.
    payload: Option<PipelinePayload>,
}

enum PipelinePayload {
    Graphics(Arc<GraphicsPipelineCreateInfo>, GraphicsPipelineRefs),
    Compute(Arc<ComputePipelineCreateInfo>, ComputePipelineRefs),
}

struct WorkerShared {
    tables: ObjectTables,
    stats: ReplayStats,
    device: OnceLock<Arc<dyn Device>>,
    pipeline_cache: OnceLock<PipelineCacheHandle>,
    control: Option<ControlHandle>,
    loop_count: u32,
}

struct Deferred<I> {
    hash: Hash,
    info: Arc<I>,
    contributes: bool,
}

struct PipelineTracker<I> {
    index: u32,
    range: IndexRange,
    derived: Vec<Deferred<I>>,
    potential_parents: HashMap<Hash, Deferred<I>>,
}

impl<I> PipelineTracker<I> {
    fn new(range: IndexRange) -> Self {
        Self {
            index: 0,
            range,
            derived: Vec::new(),
            potential_parents: HashMap::new(),
        }
    }
}

/// One pipeline kind's hooks into the engine, so classification and the
/// two-phase resolver are written once.
trait PipelineFamily {
    type Info: Send + Sync + 'static;
    const KIND: PipelineKind;

    fn is_derivative(info: &Self::Info) -> bool;
    fn allows_derivatives(info: &Self::Info) -> bool;
    fn base_hash(info: &Self::Info) -> Hash;
    fn tracker(engine: &mut ReplayEngine) -> &mut PipelineTracker<Self::Info>;
    fn table(tables: &ObjectTables) -> &HandleTable<PipelineHandle>;
    /// Resolve referenced hashes to live handles. `None` when any reference
    /// is missing or null, which downgrades the work item to a counted skip.
    fn make_payload(
        tables: &ObjectTables,
        info: &Arc<Self::Info>,
        base: PipelineHandle,
    ) -> Option<PipelinePayload>;
}

struct GraphicsFamily;

impl PipelineFamily for GraphicsFamily {
    type Info = GraphicsPipelineCreateInfo;
    const KIND: PipelineKind = PipelineKind::Graphics;

    fn is_derivative(info: &Self::Info) -> bool {
        info.is_derivative()
    }

    fn allows_derivatives(info: &Self::Info) -> bool {
        info.allows_derivatives()
    }

    fn base_hash(info: &Self::Info) -> Hash {
        info.base_pipeline
    }

    fn tracker(engine: &mut ReplayEngine) -> &mut PipelineTracker<Self::Info> {
        &mut engine.graphics
    }

    fn table(tables: &ObjectTables) -> &HandleTable<PipelineHandle> {
        &tables.graphics_pipelines
    }

    fn make_payload(
        tables: &ObjectTables,
        info: &Arc<Self::Info>,
        base: PipelineHandle,
    ) -> Option<PipelinePayload> {
        let layout = tables.pipeline_layouts.get(info.layout).unwrap_or_default();
        let render_pass = tables.render_passes.get(info.render_pass).unwrap_or_default();
        let mut valid = !layout.is_null() && !render_pass.is_null();
        let mut stages = Vec::with_capacity(info.stages.len());
        for stage in &info.stages {
            let module = tables
                .shader_modules
                .get(stage.module)
                .unwrap_or(ShaderModuleHandle::NULL);
            valid &= !module.is_null();
            stages.push(module);
        }
        valid.then(|| {
            PipelinePayload::Graphics(
                Arc::clone(info),
                GraphicsPipelineRefs {
                    stages,
                    layout,
                    render_pass,
                    base_pipeline: base,
                },
            )
        })
    }
}

struct ComputeFamily;

impl PipelineFamily for ComputeFamily {
    type Info = ComputePipelineCreateInfo;
    const KIND: PipelineKind = PipelineKind::Compute;

    fn is_derivative(info: &Self::Info) -> bool {
        info.is_derivative()
    }

    fn allows_derivatives(info: &Self::Info) -> bool {
        info.allows_derivatives()
    }

    fn base_hash(info: &Self::Info) -> Hash {
        info.base_pipeline
    }

    fn tracker(engine: &mut ReplayEngine) -> &mut PipelineTracker<Self::Info> {
        &mut engine.compute
    }

    fn table(tables: &ObjectTables) -> &HandleTable<PipelineHandle> {
        &tables.compute_pipelines
    }

    fn make_payload(
        tables: &ObjectTables,
        info: &Arc<Self::Info>,
        base: PipelineHandle,
    ) -> Option<PipelinePayload> {
        let stage = tables
            .shader_modules
            .get(info.stage.module)
            .unwrap_or(ShaderModuleHandle::NULL);
        let layout = tables.pipeline_layouts.get(info.layout).unwrap_or_default();
        let valid = !stage.is_null() && !layout.is_null();
        valid.then(|| {
            PipelinePayload::Compute(
                Arc::clone(info),
                ComputePipelineRefs {
                    stage,
                    layout,
                    base_pipeline: base,
                },
            )
        })
    }
}

pub struct ReplayEngine {
    opts: ReplayOptions,
    backend: Arc<dyn DriverBackend>,
    shared: Arc<WorkerShared>,
    pool: WorkerPool<WorkItem>,
    graphics: PipelineTracker<GraphicsPipelineCreateInfo>,
    compute: PipelineTracker<ComputePipelineCreateInfo>,
    masked_shader_modules: HashSet<Hash>,
    device_init_attempted: bool,
    fatal: Option<ReplayError>,
}

impl ReplayEngine {
    pub fn new(backend: Arc<dyn DriverBackend>, opts: ReplayOptions) -> Self {
        Self::with_control(backend, opts, None)
    }

    pub fn with_control(
        backend: Arc<dyn DriverBackend>,
        mut opts: ReplayOptions,
        control: Option<ControlHandle>,
    ) -> Self {
        opts.loop_count = opts.loop_count.max(1);
        let num_threads = if opts.num_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            opts.num_threads
        };

        let shared = Arc::new(WorkerShared {
            tables: ObjectTables::default(),
            stats: ReplayStats::default(),
            device: OnceLock::new(),
            pipeline_cache: OnceLock::new(),
            control,
            loop_count: opts.loop_count,
        });
        let worker_shared = Arc::clone(&shared);
        let pool = WorkerPool::new(num_threads, move |item| execute_work(&worker_shared, item));

        let graphics = PipelineTracker::new(opts.graphics_range);
        let compute = PipelineTracker::new(opts.compute_range);
        Self {
            opts,
            backend,
            shared,
            pool,
            graphics,
            compute,
            masked_shader_modules: HashSet::new(),
            device_init_attempted: false,
            fatal: None,
        }
    }

    pub fn options(&self) -> &ReplayOptions {
        &self.opts
    }

    pub fn stats(&self) -> &ReplayStats {
        &self.shared.stats
    }

    pub fn tables(&self) -> &ObjectTables {
        &self.shared.tables
    }

    pub fn control(&self) -> Option<&ControlHandle> {
        self.shared.control.as_ref()
    }

    /// The error that makes continuing pointless, if one occurred inside a
    /// creator callback (callbacks themselves only report accept/reject).
    pub fn take_fatal(&mut self) -> Option<ReplayError> {
        self.fatal.take()
    }

    /// Permanently skip a shader module known to take the driver down. Any
    /// pipeline referencing it replays as a counted skip with a null handle.
    pub fn mask_shader_module(&mut self, hash: Hash) {
        if self.masked_shader_modules.insert(hash) {
            self.shared.stats.banned_modules.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reserve_pipelines(&mut self, kind: PipelineKind, count: usize) {
        match kind {
            PipelineKind::Graphics => {
                self.graphics.derived.reserve(count);
                self.graphics.potential_parents.reserve(count);
            }
            PipelineKind::Compute => {
                self.compute.derived.reserve(count);
                self.compute.potential_parents.reserve(count);
            }
        }
    }

    /// Block until every queued work item has completed.
    pub fn sync_threads(&mut self) {
        self.pool.drain();
    }

    pub fn resolve_derived_graphics_pipelines(&mut self) -> Result<()> {
        self.resolve_derived::<GraphicsFamily>()
    }

    pub fn resolve_derived_compute_pipelines(&mut self) -> Result<()> {
        self.resolve_derived::<ComputeFamily>()
    }

    fn ensure_device(
        &mut self,
        app: Option<&ApplicationInfo>,
        features: Option<&DeviceFeatures>,
    ) -> bool {
        if self.shared.device.get().is_some() {
            return true;
        }
        if self.device_init_attempted {
            return false;
        }
        self.device_init_attempted = true;

        let start = Instant::now();
        match self.backend.create_device(&self.opts.device, app, features) {
            Ok(device) => {
                info!(
                    "created device \"{}\" in {:.3} ms",
                    device.properties().device_name,
                    start.elapsed().as_secs_f64() * 1e3
                );
                let cache_handle = if self.opts.pipeline_cache {
                    cache::create_pipeline_cache(
                        device.as_ref(),
                        self.opts.on_disk_pipeline_cache_path.as_deref(),
                    )
                } else {
                    PipelineCacheHandle::NULL
                };
                let _ = self.shared.pipeline_cache.set(cache_handle);
                let _ = self.shared.device.set(device);
                true
            }
            Err(err) => {
                error!("failed to initialize device: {err}");
                self.fatal = Some(ReplayError::DeviceInit(err));
                false
            }
        }
    }

    fn device(&self) -> Option<Arc<dyn Device>> {
        self.shared.device.get().cloned()
    }

    fn count_out_of_range_skip(&self, kind: PipelineKind) {
        if self.opts.slave {
            return;
        }
        self.kind_counters(kind).skipped.fetch_add(1, Ordering::Relaxed);
        if let Some(control) = &self.shared.control {
            control
                .block()
                .kind(kind)
                .skipped
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn kind_counters(&self, kind: PipelineKind) -> &KindCounters {
        match kind {
            PipelineKind::Graphics => &self.shared.stats.graphics,
            PipelineKind::Compute => &self.shared.stats.compute,
        }
    }

    fn classify_pipeline<F: PipelineFamily>(&mut self, hash: Hash, info: F::Info) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        let info = Arc::new(info);
        let derived = F::is_derivative(&info);
        if derived && F::base_hash(&info) == 0 {
            error!(
                "derivative {} pipeline {hash:016x} names a null base",
                F::KIND
            );
        }

        if derived {
            // The base may not exist yet; hold the derivative until its
            // tag's normal pass is over. Derivatives index last.
            F::tracker(self).derived.push(Deferred {
                hash,
                info,
                contributes: true,
            });
            return true;
        }

        let (index, in_range) = {
            let tracker = F::tracker(self);
            (tracker.index, tracker.range.contains(tracker.index))
        };
        if in_range {
            let payload = F::make_payload(&self.shared.tables, &info, PipelineHandle::NULL);
            if payload.is_some() {
                F::table(&self.shared.tables).reserve(hash);
            }
            self.pool.enqueue(WorkItem::Pipeline(PipelineWork {
                kind: F::KIND,
                hash,
                index: Some(index),
                payload,
            }));
        } else {
            // A derivative inside the range may still need this one as its
            // base; keep the create-info around just in case.
            if F::allows_derivatives(&info) {
                F::tracker(self).potential_parents.insert(
                    hash,
                    Deferred {
                        hash,
                        info,
                        contributes: false,
                    },
                );
            }
            self.count_out_of_range_skip(F::KIND);
        }
        F::tracker(self).index += 1;
        true
    }

    /// Queue a pipeline whose base handle (if any) is already resolved.
    /// Contributing items advance the per-tag index and are subject to the
    /// shard range; rescued parents bypass both.
    fn enqueue_resolved<F: PipelineFamily>(
        &mut self,
        hash: Hash,
        info: Arc<F::Info>,
        base: PipelineHandle,
        contributes: bool,
    ) {
        let index_for_item = if contributes {
            let (index, in_range) = {
                let tracker = F::tracker(self);
                (tracker.index, tracker.range.contains(tracker.index))
            };
            F::tracker(self).index += 1;
            if !in_range {
                self.count_out_of_range_skip(F::KIND);
                return;
            }
            Some(index)
        } else {
            None
        };

        let payload = F::make_payload(&self.shared.tables, &info, base);
        if payload.is_some() {
            F::table(&self.shared.tables).reserve(hash);
        }
        self.pool.enqueue(WorkItem::Pipeline(PipelineWork {
            kind: F::KIND,
            hash,
            index: index_for_item,
            payload,
        }));
    }

    /// Two-phase derived-pipeline resolution, one `drain` per derivation
    /// level. Phase one materializes the out-of-range parents derivatives
    /// actually need; phase two repeatedly partitions the deferred list on
    /// "base already enqueued", rewrites the captured base hash to the live
    /// handle, and requeues.
    fn resolve_derived<F: PipelineFamily>(&mut self) -> Result<()> {
        let mut derived = std::mem::take(&mut F::tracker(self).derived);
        let mut parents = std::mem::take(&mut F::tracker(self).potential_parents);

        for item in &derived {
            if let Some(parent) = parents.remove(&F::base_hash(&item.info)) {
                self.enqueue_resolved::<F>(
                    parent.hash,
                    parent.info,
                    PipelineHandle::NULL,
                    parent.contributes,
                );
            }
        }

        let shared = Arc::clone(&self.shared);
        while !derived.is_empty() {
            let table = F::table(&shared.tables);

            // Unstable partition: ready items swap to the tail. A table
            // entry means the base was enqueued, not that it is done; the
            // drain below makes its handle final before we read it.
            let mut ready_start = derived.len();
            let mut i = 0;
            while i < ready_start {
                if table.contains(F::base_hash(&derived[i].info)) {
                    ready_start -= 1;
                    derived.swap(i, ready_start);
                } else {
                    i += 1;
                }
            }

            if ready_start == derived.len() {
                error!(
                    "derived {} pipeline resolution cannot make progress ({} left)",
                    F::KIND,
                    derived.len()
                );
                return Err(ReplayError::ResolverStall(F::KIND));
            }

            self.pool.drain();

            for item in derived.split_off(ready_start) {
                let base = table
                    .get(F::base_hash(&item.info))
                    .unwrap_or(PipelineHandle::NULL);
                self.enqueue_resolved::<F>(item.hash, item.info, base, item.contributes);
            }
        }

        F::tracker(self).potential_parents = parents;
        Ok(())
    }

    /// Drain outstanding work, destroy every created object in reverse
    /// dependency order, flush the driver cache, and report totals.
    pub fn finish(self) -> ReplaySummary {
        self.pool.drain();
        self.pool.shutdown();

        let tables = &self.shared.tables;
        let summary = ReplaySummary {
            samplers: tables.samplers.live_len(),
            descriptor_set_layouts: tables.descriptor_set_layouts.live_len(),
            pipeline_layouts: tables.pipeline_layouts.live_len(),
            shader_modules: tables.shader_modules.live_len(),
            render_passes: tables.render_passes.live_len(),
            graphics_pipelines: tables.graphics_pipelines.live_len(),
            compute_pipelines: tables.compute_pipelines.live_len(),
            stats: self.shared.stats.snapshot(),
            worker_idle_ns: self.pool.idle_ns(),
            worker_total_ns: self.pool.total_ns(),
        };

        if let Some(device) = self.shared.device.get() {
            for handle in tables.compute_pipelines.take_live_handles() {
                device.destroy_pipeline(handle);
            }
            for handle in tables.graphics_pipelines.take_live_handles() {
                device.destroy_pipeline(handle);
            }

            let cache_handle = self
                .shared
                .pipeline_cache
                .get()
                .copied()
                .unwrap_or(PipelineCacheHandle::NULL);
            cache::flush_pipeline_cache(
                device.as_ref(),
                cache_handle,
                self.opts.on_disk_pipeline_cache_path.as_deref(),
            );

            for handle in tables.shader_modules.take_live_handles() {
                device.destroy_shader_module(handle);
            }
            for handle in tables.render_passes.take_live_handles() {
                device.destroy_render_pass(handle);
            }
            for handle in tables.pipeline_layouts.take_live_handles() {
                device.destroy_pipeline_layout(handle);
            }
            for handle in tables.descriptor_set_layouts.take_live_handles() {
                device.destroy_descriptor_set_layout(handle);
            }
            for handle in tables.samplers.take_live_handles() {
                device.destroy_sampler(handle);
            }
        }

        summary
    }
}

impl StateCreator for ReplayEngine {
    fn set_application_info(
        &mut self,
        _hash: Hash,
        app: &ApplicationInfo,
        features: &DeviceFeatures,
    ) -> bool {
        if self.shared.device.get().is_some() {
            return true;
        }
        info!(
            "replaying for application {:?} (engine {:?}, api version {}.{}.{})",
            app.application_name.as_deref().unwrap_or("unknown"),
            app.engine_name.as_deref().unwrap_or("unknown"),
            app.api_version >> 22,
            (app.api_version >> 12) & 0x3ff,
            app.api_version & 0xfff,
        );
        self.ensure_device(Some(app), Some(features))
    }

    fn create_sampler(&mut self, hash: Hash, info: SamplerCreateInfo) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        let Some(device) = self.device() else {
            return false;
        };
        match device.create_sampler(hash, &info) {
            Ok(handle) => {
                self.shared.tables.samplers.store(hash, handle);
                true
            }
            Err(err) => {
                error!("creating sampler {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        hash: Hash,
        info: DescriptorSetLayoutCreateInfo,
    ) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        let Some(device) = self.device() else {
            return false;
        };
        let immutable_samplers: Vec<Vec<SamplerHandle>> = info
            .bindings
            .iter()
            .map(|binding| {
                binding
                    .immutable_samplers
                    .iter()
                    .map(|hash| self.shared.tables.samplers.get(*hash).unwrap_or_default())
                    .collect()
            })
            .collect();
        match device.create_descriptor_set_layout(hash, &info, &immutable_samplers) {
            Ok(handle) => {
                self.shared.tables.descriptor_set_layouts.store(hash, handle);
                true
            }
            Err(err) => {
                error!("creating descriptor set layout {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_pipeline_layout(&mut self, hash: Hash, info: PipelineLayoutCreateInfo) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        let Some(device) = self.device() else {
            return false;
        };
        let set_layouts: Vec<_> = info
            .set_layouts
            .iter()
            .map(|hash| {
                self.shared
                    .tables
                    .descriptor_set_layouts
                    .get(*hash)
                    .unwrap_or_default()
            })
            .collect();
        match device.create_pipeline_layout(hash, &info, &set_layouts) {
            Ok(handle) => {
                self.shared.tables.pipeline_layouts.store(hash, handle);
                true
            }
            Err(err) => {
                error!("creating pipeline layout {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_render_pass(&mut self, hash: Hash, info: RenderPassCreateInfo) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        let Some(device) = self.device() else {
            return false;
        };
        match device.create_render_pass(hash, &info) {
            Ok(handle) => {
                self.shared.tables.render_passes.store(hash, handle);
                true
            }
            Err(err) => {
                error!("creating render pass {hash:016x} failed: {err}");
                false
            }
        }
    }

    fn create_shader_module(&mut self, hash: Hash, info: ShaderModuleCreateInfo) -> bool {
        if !self.ensure_device(None, None) {
            return false;
        }
        self.shared.stats.total_modules.fetch_add(1, Ordering::Relaxed);
        if self.masked_shader_modules.contains(&hash) {
            // Known to take the driver down. Report success with no handle
            // so dependent pipelines replay as counted skips.
            return true;
        }
        self.shared.tables.shader_modules.reserve(hash);
        self.pool.enqueue(WorkItem::ShaderModule {
            hash,
            info: Arc::new(info),
        });
        true
    }

    fn create_graphics_pipeline(&mut self, hash: Hash, info: GraphicsPipelineCreateInfo) -> bool {
        self.classify_pipeline::<GraphicsFamily>(hash, info)
    }

    fn create_compute_pipeline(&mut self, hash: Hash, info: ComputePipelineCreateInfo) -> bool {
        self.classify_pipeline::<ComputeFamily>(hash, info)
    }

    fn sync_threads(&mut self) {
        ReplayEngine::sync_threads(self);
    }
}

fn execute_work(shared: &WorkerShared, item: WorkItem) {
    match item {
        WorkItem::ShaderModule { hash, info } => execute_shader_module(shared, hash, &info),
        WorkItem::Pipeline(work) => execute_pipeline(shared, work),
    }
}

fn execute_shader_module(shared: &WorkerShared, hash: Hash, info: &ShaderModuleCreateInfo) {
    let Some(device) = shared.device.get() else {
        error!("shader module {hash:016x} queued without a device");
        return;
    };
    if let Some(control) = &shared.control {
        control
            .block()
            .publish_attempt_modules(control.slot(), &[hash]);
    }

    let mut handle = ShaderModuleHandle::NULL;
    for _ in 0..shared.loop_count {
        if !handle.is_null() {
            // Avoid leaking the previous iteration's module.
            device.destroy_shader_module(handle);
            handle = ShaderModuleHandle::NULL;
        }
        let start = Instant::now();
        match device.create_shader_module(hash, info) {
            Ok(created) => {
                shared
                    .stats
                    .shader_module_ns
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                shared
                    .stats
                    .shader_module_count
                    .fetch_add(1, Ordering::Relaxed);
                handle = created;
            }
            Err(err) => {
                error!("failed to create shader module {hash:016x}: {err}");
            }
        }
    }
    if !handle.is_null() {
        shared.tables.shader_modules.store(hash, handle);
    }
}

fn execute_pipeline(shared: &WorkerShared, work: PipelineWork) {
    let contributing = work.index.is_some();
    let counters = match work.kind {
        PipelineKind::Graphics => &shared.stats.graphics,
        PipelineKind::Compute => &shared.stats.compute,
    };
    let control = shared.control.as_ref();
    let control_counters = control.map(|handle| handle.block().kind(work.kind));

    // Publish where we are before anything risky so a supervising master can
    // attribute a crash and resume one index past it.
    if let (Some(handle), Some(index)) = (control, work.index) {
        handle
            .block()
            .publish_pipeline_index(handle.slot(), work.kind, index);
    }

    let bump_skipped = || {
        if contributing {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            if let Some(progress) = control_counters {
                progress.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    };

    let Some(payload) = work.payload else {
        bump_skipped();
        return;
    };
    let Some(device) = shared.device.get() else {
        error!("{} pipeline {:016x} queued without a device", work.kind, work.hash);
        bump_skipped();
        return;
    };

    let (derivative, base_is_null, modules) = match &payload {
        PipelinePayload::Graphics(info, refs) => (
            info.is_derivative(),
            refs.base_pipeline.is_null(),
            info.stages.iter().map(|stage| stage.module).collect::<Vec<_>>(),
        ),
        PipelinePayload::Compute(info, refs) => (
            info.is_derivative(),
            refs.base_pipeline.is_null(),
            vec![info.stage.module],
        ),
    };
    if derivative && base_is_null {
        // The base failed to compile; don't hand the driver a null base.
        error!("invalid derivative {} pipeline {:016x}", work.kind, work.hash);
        bump_skipped();
        return;
    }

    if let Some(handle) = control {
        handle
            .block()
            .publish_attempt_modules(handle.slot(), &modules);
    }

    let cache = shared
        .pipeline_cache
        .get()
        .copied()
        .unwrap_or(PipelineCacheHandle::NULL);
    let kind_ns = match work.kind {
        PipelineKind::Graphics => &shared.stats.graphics_pipeline_ns,
        PipelineKind::Compute => &shared.stats.compute_pipeline_ns,
    };

    let mut handle = PipelineHandle::NULL;
    for i in 0..shared.loop_count {
        if !handle.is_null() {
            // Avoid leaking the previous iteration's pipeline.
            device.destroy_pipeline(handle);
            handle = PipelineHandle::NULL;
        }
        let start = Instant::now();
        let result = match &payload {
            PipelinePayload::Graphics(info, refs) => {
                device.create_graphics_pipeline(work.hash, cache, info, refs)
            }
            PipelinePayload::Compute(info, refs) => {
                device.create_compute_pipeline(work.hash, cache, info, refs)
            }
        };
        match result {
            Ok(created) => {
                handle = created;
                if contributing {
                    kind_ns.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                    if i == 0 {
                        counters.successful.fetch_add(1, Ordering::Relaxed);
                        if let Some(progress) = control_counters {
                            progress.successful.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            Err(err) => {
                error!(
                    "failed to create {} pipeline {:016x}: {err}",
                    work.kind, work.hash
                );
            }
        }
    }

    if !handle.is_null() {
        let table = match work.kind {
            PipelineKind::Graphics => &shared.tables.graphics_pipelines,
            PipelineKind::Compute => &shared.tables.compute_pipelines,
        };
        table.store(work.hash, handle);
        if contributing {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            if let Some(progress) = control_counters {
                progress.completed.fetch_add(1, Ordering::Relaxed);
            }
        }
    } else {
        bump_skipped();
    }
}

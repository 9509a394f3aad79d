//! Ordered playback over an archive.
//!
//! Shader modules are kicked off right after the application info so they
//! compile in the background while the trivial objects replay on this
//! thread; a `sync_threads` barrier after render passes guarantees every
//! module handle is visible before pipeline classification reads them.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{info, warn};

use kiln_archive::reader::ArchiveReadError;
use kiln_archive::{ArchiveReader, Hash, PayloadRead, ResourceTag};
use kiln_state::StateReplayer;

use crate::engine::{PipelineKind, ReplayEngine};
use crate::error::Result;
use crate::stats::ReplaySummary;

/// Playback order: the device first, then modules (threaded), then the
/// trivial objects in-thread, then pipelines.
pub const PLAYBACK_ORDER: [ResourceTag; ResourceTag::COUNT] = [
    ResourceTag::AppInfo,
    ResourceTag::ShaderModule,
    ResourceTag::Sampler,
    ResourceTag::DescriptorSetLayout,
    ResourceTag::PipelineLayout,
    ResourceTag::RenderPass,
    ResourceTag::GraphicsPipeline,
    ResourceTag::ComputePipeline,
];

/// The slice of the archive interface the replay loop consumes.
pub trait ArchiveSource {
    fn hash_list(&self, tag: ResourceTag) -> Vec<Hash>;
    /// Size of the stored (possibly compressed) entry payload.
    fn entry_stored_len(&self, tag: ResourceTag, hash: Hash) -> Option<u64>;
    fn read_entry(
        &mut self,
        tag: ResourceTag,
        hash: Hash,
    ) -> std::result::Result<Vec<u8>, ArchiveReadError>;
}

impl<R: std::io::Read + std::io::Seek> ArchiveSource for ArchiveReader<R> {
    fn hash_list(&self, tag: ResourceTag) -> Vec<Hash> {
        ArchiveReader::hash_list(self, tag).to_vec()
    }

    fn entry_stored_len(&self, tag: ResourceTag, hash: Hash) -> Option<u64> {
        ArchiveReader::entry_stored_len(self, tag, hash).map(u64::from)
    }

    fn read_entry(
        &mut self,
        tag: ResourceTag,
        hash: Hash,
    ) -> std::result::Result<Vec<u8>, ArchiveReadError> {
        ArchiveReader::read_entry(self, tag, hash, PayloadRead::Decompressed)
    }
}

/// Replay an archive through `engine` and tear everything down.
///
/// Individual entry failures (bad blob, rejected create) are logged and
/// skipped; the only fatal conditions are device init, a resolver stall, and
/// archive enumeration itself.
pub fn run_replay<A: ArchiveSource>(
    archive: &mut A,
    mut engine: ReplayEngine,
) -> Result<ReplaySummary> {
    let mut parser = StateReplayer::new();
    // The engine performs its own two-phase resolution; it needs captured
    // hashes in base-pipeline fields, not live handles.
    parser.set_resolve_derivative_pipeline_handles(false);

    let replay_start = Instant::now();

    for tag in PLAYBACK_ORDER {
        let tag_start = Instant::now();
        let hashes = archive.hash_list(tag);

        publish_tag_totals(&engine, tag, hashes.len() as u32);
        match tag {
            ResourceTag::GraphicsPipeline => {
                engine.reserve_pipelines(PipelineKind::Graphics, hashes.len());
            }
            ResourceTag::ComputePipeline => {
                engine.reserve_pipelines(PipelineKind::Compute, hashes.len());
            }
            _ => {}
        }

        let mut stored_bytes = 0u64;
        let mut raw_bytes = 0u64;
        for hash in hashes {
            stored_bytes += archive.entry_stored_len(tag, hash).unwrap_or(0);
            let payload = match archive.read_entry(tag, hash) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("failed to read {tag} entry {hash:016x}: {err:?}");
                    continue;
                }
            };
            raw_bytes += payload.len() as u64;

            if let Err(err) = parser.parse(&mut engine, tag, hash, &payload) {
                if let Some(fatal) = engine.take_fatal() {
                    return Err(fatal);
                }
                warn!("skipping {tag} entry {hash:016x}: {err}");
            }
        }

        info!(
            "decoded {tag} entries in {:.3} s ({raw_bytes} bytes, {stored_bytes} stored)",
            tag_start.elapsed().as_secs_f64()
        );

        match tag {
            // Pipelines read module handles next; make them final.
            ResourceTag::RenderPass => engine.sync_threads(),
            ResourceTag::GraphicsPipeline => engine.resolve_derived_graphics_pipelines()?,
            ResourceTag::ComputePipeline => engine.resolve_derived_compute_pipelines()?,
            _ => {}
        }
    }

    engine.sync_threads();
    let summary = engine.finish();
    log_summary(&summary, replay_start.elapsed().as_secs_f64());
    Ok(summary)
}

/// Per-kind totals in the internal stats, mirrored to the shared block when
/// this process owns the accounting.
fn publish_tag_totals(engine: &ReplayEngine, tag: ResourceTag, count: u32) {
    let stats = engine.stats();
    let owner = !engine.options().slave;
    match tag {
        ResourceTag::GraphicsPipeline => {
            stats.graphics.total.store(count, Ordering::Relaxed);
            if owner {
                if let Some(control) = engine.control() {
                    control
                        .block()
                        .kind(PipelineKind::Graphics)
                        .total
                        .store(count, Ordering::Relaxed);
                }
            }
        }
        ResourceTag::ComputePipeline => {
            stats.compute.total.store(count, Ordering::Relaxed);
            if owner {
                if let Some(control) = engine.control() {
                    control
                        .block()
                        .kind(PipelineKind::Compute)
                        .total
                        .store(count, Ordering::Relaxed);
                }
            }
        }
        ResourceTag::ShaderModule => {
            if owner {
                if let Some(control) = engine.control() {
                    control
                        .block()
                        .total_modules
                        .store(count, Ordering::Relaxed);
                }
            }
        }
        _ => {}
    }
}

fn log_summary(summary: &ReplaySummary, elapsed_s: f64) {
    let stats = &summary.stats;
    info!(
        "played back {} shader modules in {:.3} s (accumulated)",
        stats.shader_module_count,
        stats.shader_module_ns as f64 * 1e-9
    );
    info!(
        "played back {} graphics pipelines in {:.3} s (accumulated)",
        stats.graphics.completed,
        stats.graphics_pipeline_ns as f64 * 1e-9
    );
    info!(
        "played back {} compute pipelines in {:.3} s (accumulated)",
        stats.compute.completed,
        stats.compute_pipeline_ns as f64 * 1e-9
    );
    info!(
        "workers idled {:.3} s of {:.3} s total (accumulated)",
        summary.worker_idle_ns as f64 * 1e-9,
        summary.worker_total_ns as f64 * 1e-9
    );
    info!(
        "replayed {} objects in {elapsed_s:.3} s: \
         {} samplers, {} descriptor set layouts, {} pipeline layouts, \
         {} shader modules, {} render passes, {} graphics pipelines, \
         {} compute pipelines",
        summary.total_objects(),
        summary.samplers,
        summary.descriptor_set_layouts,
        summary.pipeline_layouts,
        summary.shader_modules,
        summary.render_passes,
        summary.graphics_pipelines,
        summary.compute_pipelines,
    );
}

//! Crash-isolated replay: master and progress roles.
//!
//! The master partitions the pipeline index space into single-kind shards
//! and runs each in a one-threaded slave process, so a driver fault is
//! attributable to exactly one pipeline index. Recovery is termination
//! based: the master learns where a slave died from the shared control
//! block, bans the implicated shader modules, and resubmits the residual
//! range. No in-process isolation is attempted; a faulty driver can corrupt
//! arbitrary process memory, so the process boundary is the mechanism.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use kiln_archive::{ArchiveReader, Hash, ResourceTag};

use crate::control::{shm, ControlBlock, ControlHandle, SLAVE_SLOTS};
use crate::engine::{IndexRange, PipelineKind, ReplayOptions};
use crate::error::{ReplayError, Result};

pub const DEFAULT_SHARD_STRIDE: u32 = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub archive_path: PathBuf,
    /// Maximum concurrently running slaves.
    pub max_slaves: usize,
    /// Shard size in pipeline indices.
    pub shard_stride: u32,
    /// Wall-clock budget per slave; exceeding it is a dirty crash.
    pub timeout: Option<Duration>,
    pub quiet_slave: bool,
    /// Shader modules banned before the first slave runs.
    pub masked_modules: Vec<Hash>,
    /// Device/cache/loop options forwarded to every slave; the ranges bound
    /// the index domain the master shards.
    pub replay: ReplayOptions,
}

#[derive(Clone, Copy, Debug)]
struct Shard {
    kind: PipelineKind,
    range: IndexRange,
}

struct RunningSlave {
    child: Child,
    shard: Shard,
    slot: usize,
    spawned_at: Instant,
}

enum SlaveOutcome {
    Completed,
    CleanExit(i32),
    DirtyCrash,
}

fn classify_exit(status: ExitStatus, timed_out: bool) -> SlaveOutcome {
    match status.code() {
        // A slave that finished just as its deadline fired still finished.
        Some(0) => SlaveOutcome::Completed,
        Some(_) if timed_out => SlaveOutcome::DirtyCrash,
        Some(code) => SlaveOutcome::CleanExit(code),
        // Killed by a signal: the driver (or our fault injection) took the
        // process down.
        None => SlaveOutcome::DirtyCrash,
    }
}

/// Attach to the control block a master mapped before spawning us.
pub fn attach_slave_control(fd: RawFd, slot: usize) -> Result<ControlHandle> {
    let mapping = shm::SharedMapping::from_inherited_fd(fd)?;
    Ok(ControlHandle::new(mapping.into_region(), slot))
}

/// Run the master role. `inherited_fd` is set when a progress process
/// created the control block for us.
pub fn run_master(opts: &SupervisorOptions, inherited_fd: Option<RawFd>) -> Result<i32> {
    let mapping = match inherited_fd {
        Some(fd) => shm::SharedMapping::from_inherited_fd(fd)?,
        None => shm::SharedMapping::create()?,
    };

    let (graphics_count, compute_count, modules) = count_archive_entries(&opts.archive_path)?;
    let block = mapping.block();
    block
        .total_modules
        .store(modules, Ordering::Relaxed);

    let mut queue = VecDeque::new();
    seed_shards(
        &mut queue,
        block,
        PipelineKind::Graphics,
        graphics_count,
        opts.replay.graphics_range,
        opts.shard_stride.max(1),
    );
    seed_shards(
        &mut queue,
        block,
        PipelineKind::Compute,
        compute_count,
        opts.replay.compute_range,
        opts.shard_stride.max(1),
    );

    let mut banned: HashSet<Hash> = opts.masked_modules.iter().copied().collect();
    block
        .banned_modules
        .store(banned.len() as u32, Ordering::Relaxed);

    let max_slaves = opts.max_slaves.clamp(1, SLAVE_SLOTS);
    let mut free_slots: Vec<usize> = (0..max_slaves).rev().collect();
    let mut running: Vec<RunningSlave> = Vec::new();
    let mut failures = 0u32;

    loop {
        while running.len() < max_slaves && !queue.is_empty() {
            let shard = queue.pop_front().expect("queue was checked non-empty");
            let slot = free_slots.pop().expect("a slot is free per max_slaves");
            block.reset_slot(slot);
            match spawn_slave(opts, &mapping, shard, slot, &banned) {
                Ok(child) => running.push(RunningSlave {
                    child,
                    shard,
                    slot,
                    spawned_at: Instant::now(),
                }),
                Err(err) => {
                    error!("failed to spawn slave process: {err}");
                    free_slots.push(slot);
                    abandon_shard(block, shard);
                    failures += 1;
                }
            }
        }

        if running.is_empty() {
            break;
        }

        let mut progressed = false;
        let mut index = 0;
        while index < running.len() {
            let slave = &mut running[index];

            let mut timed_out = false;
            if let Some(timeout) = opts.timeout {
                if slave.spawned_at.elapsed() >= timeout {
                    warn!(
                        "slave for {} [{}, {}) exceeded {}s; killing it",
                        slave.shard.kind,
                        slave.shard.range.start,
                        slave.shard.range.end,
                        timeout.as_secs()
                    );
                    let _ = slave.child.kill();
                    timed_out = true;
                }
            }

            let status = if timed_out {
                Some(slave.child.wait()?)
            } else {
                slave.child.try_wait()?
            };

            let Some(status) = status else {
                index += 1;
                continue;
            };

            let slave = running.swap_remove(index);
            free_slots.push(slave.slot);
            progressed = true;

            match classify_exit(status, timed_out) {
                SlaveOutcome::Completed => {}
                SlaveOutcome::CleanExit(code) => {
                    error!(
                        "slave for {} [{}, {}) failed gracefully with exit code {code}",
                        slave.shard.kind, slave.shard.range.start, slave.shard.range.end
                    );
                    block
                        .clean_crashes
                        .fetch_add(1, Ordering::Relaxed);
                    failures += 1;
                }
                SlaveOutcome::DirtyCrash => {
                    if let Some(signal) = status.signal() {
                        warn!(
                            "slave for {} [{}, {}) died on signal {signal}",
                            slave.shard.kind, slave.shard.range.start, slave.shard.range.end
                        );
                    }
                    handle_dirty_crash(
                        block,
                        &mut banned,
                        &mut queue,
                        slave.shard,
                        slave.slot,
                        &mut failures,
                    );
                }
            }
        }

        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    log_progress(block);
    log_faulty_modules(block);

    Ok(if failures > 0 { 1 } else { 0 })
}

fn handle_dirty_crash(
    block: &ControlBlock,
    banned: &mut HashSet<Hash>,
    queue: &mut VecDeque<Shard>,
    shard: Shard,
    slot: usize,
    failures: &mut u32,
) {
    block
        .dirty_crashes
        .fetch_add(1, Ordering::Relaxed);

    let snapshot = block.read_slot(slot);
    let mut newly_banned = false;
    for hash in &snapshot.attempt_modules {
        if banned.insert(*hash) {
            info!("banning faulty shader module {hash:016x}");
            block.push_faulty_module(*hash);
            newly_banned = true;
        }
    }
    block
        .banned_modules
        .store(banned.len() as u32, Ordering::Relaxed);

    if snapshot.pipeline_attempted {
        let crashed = match shard.kind {
            PipelineKind::Graphics => snapshot.current_graphics_index,
            PipelineKind::Compute => snapshot.current_compute_index,
        };
        warn!(
            "slave crashed compiling {} pipeline index {crashed}; resuming past it",
            shard.kind
        );
        // The crashed pipeline will never get a table entry anywhere.
        block
            .kind(shard.kind)
            .skipped
            .fetch_add(1, Ordering::Relaxed);
        let residual = IndexRange::new(crashed.saturating_add(1), shard.range.end);
        if !residual.is_empty() {
            queue.push_front(Shard {
                kind: shard.kind,
                range: residual,
            });
        }
    } else if newly_banned {
        // Crash before any pipeline attempt (module creation); the banned
        // module is masked on retry, so the same range can make progress.
        queue.push_front(shard);
    } else {
        error!(
            "slave for {} [{}, {}) crashed with nothing to blame; abandoning the shard",
            shard.kind, shard.range.start, shard.range.end
        );
        abandon_shard(block, shard);
        *failures += 1;
    }
}

fn abandon_shard(block: &ControlBlock, shard: Shard) {
    block
        .kind(shard.kind)
        .skipped
        .fetch_add(shard.range.len(), Ordering::Relaxed);
}

fn seed_shards(
    queue: &mut VecDeque<Shard>,
    block: &ControlBlock,
    kind: PipelineKind,
    archive_count: u32,
    outer: IndexRange,
    stride: u32,
) {
    let progress = block.kind(kind);
    progress
        .total
        .store(archive_count, Ordering::Relaxed);

    let domain = IndexRange::new(outer.start.min(archive_count), outer.end.min(archive_count));
    // Indices outside the requested domain are nobody's shard; account for
    // them up front so totals still balance.
    let out_of_domain = archive_count - domain.len();
    if out_of_domain > 0 {
        progress
            .skipped
            .fetch_add(out_of_domain, Ordering::Relaxed);
    }

    let mut start = domain.start;
    while start < domain.end {
        let end = domain.end.min(start.saturating_add(stride));
        queue.push_back(Shard {
            kind,
            range: IndexRange::new(start, end),
        });
        start = end;
    }
}

fn spawn_slave(
    opts: &SupervisorOptions,
    mapping: &shm::SharedMapping,
    shard: Shard,
    slot: usize,
    banned: &HashSet<Hash>,
) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--slave-process");
    cmd.arg("--shmem-fd").arg(mapping.fd().to_string());
    cmd.arg("--control-slot").arg(slot.to_string());
    cmd.arg("--num-threads").arg("1");

    let (graphics, compute) = match shard.kind {
        PipelineKind::Graphics => (shard.range, IndexRange::EMPTY),
        PipelineKind::Compute => (IndexRange::EMPTY, shard.range),
    };
    cmd.arg("--graphics-pipeline-range")
        .arg(graphics.start.to_string())
        .arg(graphics.end.to_string());
    cmd.arg("--compute-pipeline-range")
        .arg(compute.start.to_string())
        .arg(compute.end.to_string());

    append_replay_flags(&mut cmd, &opts.replay);
    if opts.quiet_slave {
        cmd.arg("--quiet-slave");
    }
    for hash in banned {
        cmd.arg("--mask-shader-module").arg(format!("{hash:016x}"));
    }
    cmd.arg(&opts.archive_path);
    cmd.spawn()
}

fn append_replay_flags(cmd: &mut Command, replay: &ReplayOptions) {
    if replay.device.device_index != 0 {
        cmd.arg("--device-index")
            .arg(replay.device.device_index.to_string());
    }
    if replay.device.enable_validation {
        cmd.arg("--enable-validation");
    }
    if let Some(path) = &replay.on_disk_pipeline_cache_path {
        cmd.arg("--on-disk-pipeline-cache").arg(path);
    } else if replay.pipeline_cache {
        cmd.arg("--pipeline-cache");
    }
    if replay.loop_count > 1 {
        cmd.arg("--loop").arg(replay.loop_count.to_string());
    }
}

/// Run the progress role: create the control block, run a master as a child
/// process, and report progress every half second until it exits.
pub fn run_progress(opts: &SupervisorOptions) -> Result<i32> {
    let mapping = shm::SharedMapping::create()?;

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("--master-process");
    cmd.arg("--shmem-fd").arg(mapping.fd().to_string());
    cmd.arg("--num-threads").arg(opts.max_slaves.to_string());
    cmd.arg("--shard-stride").arg(opts.shard_stride.to_string());
    if let Some(timeout) = opts.timeout {
        cmd.arg("--timeout").arg(timeout.as_secs().to_string());
    }
    if opts.quiet_slave {
        cmd.arg("--quiet-slave");
    }
    for hash in &opts.masked_modules {
        cmd.arg("--mask-shader-module").arg(format!("{hash:016x}"));
    }
    append_replay_flags(&mut cmd, &opts.replay);
    cmd.arg("--graphics-pipeline-range")
        .arg(opts.replay.graphics_range.start.to_string())
        .arg(opts.replay.graphics_range.end.to_string());
    cmd.arg("--compute-pipeline-range")
        .arg(opts.replay.compute_range.start.to_string())
        .arg(opts.replay.compute_range.end.to_string());
    cmd.arg(&opts.archive_path);

    let mut child = cmd
        .spawn()
        .map_err(|err| ReplayError::Supervision(format!("failed to spawn master: {err}")))?;

    let block = mapping.block();
    loop {
        std::thread::sleep(PROGRESS_INTERVAL);
        log_progress(block);
        if let Some(status) = child.try_wait()? {
            log_progress(block);
            log_faulty_modules(block);
            return Ok(match status.code() {
                Some(code) => code,
                None => {
                    error!("master process died on a signal");
                    1
                }
            });
        }
    }
}

pub fn log_progress(block: &ControlBlock) {
    let graphics = block.graphics.snapshot();
    let compute = block.compute.snapshot();
    info!("=================");
    info!(" Progress report:");
    info!(
        "   Graphics {} / {}, skipped {}",
        graphics.completed, graphics.total, graphics.skipped
    );
    info!(
        "   Compute {} / {}, skipped {}",
        compute.completed, compute.total, compute.skipped
    );
    info!(
        "   Modules {}, banned {}",
        block
            .total_modules
            .load(Ordering::Relaxed),
        block
            .banned_modules
            .load(Ordering::Relaxed)
    );
    info!(
        "   Clean crashes {}",
        block
            .clean_crashes
            .load(Ordering::Relaxed)
    );
    info!(
        "   Dirty crashes {}",
        block
            .dirty_crashes
            .load(Ordering::Relaxed)
    );
    info!("=================");
}

pub fn log_faulty_modules(block: &ControlBlock) {
    for hash in block.faulty_modules() {
        info!("detected faulty shader module {hash:016x}");
    }
}

/// (graphics, compute, shader module) entry counts from the archive TOC.
fn count_archive_entries(path: &PathBuf) -> Result<(u32, u32, u32)> {
    let reader = ArchiveReader::open(BufReader::new(File::open(path)?))?;
    Ok((
        reader.hash_list(ResourceTag::GraphicsPipeline).len() as u32,
        reader.hash_list(ResourceTag::ComputePipeline).len() as u32,
        reader.hash_list(ResourceTag::ShaderModule).len() as u32,
    ))
}

//! `kiln-replay`: replay a captured pipeline-state archive against a driver.
//!
//! Four roles share this binary: the plain single-process replay, the
//! supervising master, the supervised single-threaded slave, and a progress
//! reporter that runs a master and polls the shared control block.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use kiln_archive::{ArchiveReader, Hash};
use kiln_driver::{DeviceOptions, SoftBackend};
use kiln_replay::engine::IndexRange;
use kiln_replay::{run_replay, ReplayEngine, ReplayOptions};

#[derive(Debug, Parser)]
#[command(
    name = "kiln-replay",
    about = "Replay a captured pipeline-state archive to pre-warm driver caches, \
             surface driver bugs, and measure compile throughput"
)]
struct Args {
    /// Physical device index to replay on.
    #[arg(long, default_value_t = 0)]
    device_index: u32,

    /// Enable driver validation.
    #[arg(long)]
    enable_validation: bool,

    /// Compile through a driver pipeline cache.
    #[arg(long)]
    pipeline_cache: bool,

    /// Persist the driver pipeline cache at this path (implies
    /// --pipeline-cache).
    #[arg(long)]
    on_disk_pipeline_cache: Option<PathBuf>,

    /// Worker thread count; 0 means hardware parallelism. Forced to 1 in
    /// slave mode. In master mode this bounds concurrent slaves.
    #[arg(long, default_value_t = 0)]
    num_threads: usize,

    /// Compile every module and pipeline N times, for benchmarking.
    #[arg(long = "loop", value_name = "N", default_value_t = 1)]
    loop_count: u32,

    /// Replay only graphics pipelines with index in [START, END).
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    graphics_pipeline_range: Option<Vec<u32>>,

    /// Replay only compute pipelines with index in [START, END).
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    compute_pipeline_range: Option<Vec<u32>>,

    /// Supervise single-threaded slave processes and recover from driver
    /// crashes and hangs.
    #[arg(long)]
    master_process: bool,

    /// Run as a supervised slave (spawned by a master).
    #[arg(long)]
    slave_process: bool,

    /// Spawn a master process and log progress reports until it finishes.
    #[arg(long)]
    progress: bool,

    /// Wall-clock budget per slave in seconds; exceeding it kills the slave
    /// and counts as a dirty crash.
    #[arg(long, value_name = "SEC")]
    timeout: Option<u64>,

    /// Log only errors from slave processes.
    #[arg(long)]
    quiet_slave: bool,

    /// Inherited file descriptor of the shared control block.
    #[arg(long, value_name = "FD")]
    shmem_fd: Option<i32>,

    /// Attempt-slot index inside the shared control block.
    #[arg(long, value_name = "SLOT", default_value_t = 0)]
    control_slot: usize,

    /// Pipeline indices per shard in master mode.
    #[arg(long, value_name = "N", default_value_t = 1024)]
    shard_stride: u32,

    /// Skip this shader module (hex hash) and every pipeline referencing
    /// it. May be repeated.
    #[arg(long = "mask-shader-module", value_name = "HASH")]
    masked_modules: Vec<String>,

    /// Archive to replay.
    archive: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) {
    let default_filter = if args.quiet_slave && args.slave_process {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .init();
}

fn run(mut args: Args) -> Result<u8> {
    if args.master_process as u8 + args.slave_process as u8 + args.progress as u8 > 1 {
        bail!("--master-process, --slave-process and --progress are mutually exclusive");
    }
    if args.slave_process && args.num_threads > 1 {
        warn!("slave processes are single threaded; forcing --num-threads 1");
    }
    if args.slave_process {
        args.num_threads = 1;
    }
    if args.on_disk_pipeline_cache.is_some() {
        args.pipeline_cache = true;
    }

    let masked_modules = parse_masked_modules(&args.masked_modules)?;
    let replay_opts = replay_options(&args);

    if args.master_process || args.progress {
        return run_supervised(&args, replay_opts, masked_modules);
    }

    let mut engine = build_engine(&args, replay_opts)?;
    for hash in masked_modules {
        engine.mask_shader_module(hash);
    }

    let mut archive = open_archive(&args.archive)?;
    run_replay(&mut archive, engine)
        .with_context(|| format!("replaying {}", args.archive.display()))?;
    Ok(0)
}

fn replay_options(args: &Args) -> ReplayOptions {
    ReplayOptions {
        device: DeviceOptions {
            device_index: args.device_index,
            enable_validation: args.enable_validation,
        },
        pipeline_cache: args.pipeline_cache,
        on_disk_pipeline_cache_path: args.on_disk_pipeline_cache.clone(),
        num_threads: args.num_threads,
        loop_count: args.loop_count,
        graphics_range: parse_range(&args.graphics_pipeline_range),
        compute_range: parse_range(&args.compute_pipeline_range),
        slave: args.slave_process,
    }
}

fn parse_range(raw: &Option<Vec<u32>>) -> IndexRange {
    match raw.as_deref() {
        Some([start, end]) => IndexRange::new(*start, *end),
        _ => IndexRange::ALL,
    }
}

fn parse_masked_modules(raw: &[String]) -> Result<Vec<Hash>> {
    raw.iter()
        .map(|text| {
            let digits = text.strip_prefix("0x").unwrap_or(text);
            Hash::from_str_radix(digits, 16)
                .with_context(|| format!("invalid shader module hash {text:?}"))
        })
        .collect()
}

fn open_archive(path: &PathBuf) -> Result<ArchiveReader<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("opening archive {}", path.display()))?;
    ArchiveReader::open(BufReader::new(file))
        .map_err(|err| anyhow::anyhow!("preparing archive {}: {err:?}", path.display()))
}

fn build_engine(args: &Args, opts: ReplayOptions) -> Result<ReplayEngine> {
    let backend = Arc::new(SoftBackend::from_env());

    #[cfg(unix)]
    if args.slave_process {
        let fd = args
            .shmem_fd
            .context("--slave-process requires --shmem-fd")?;
        let control = kiln_replay::supervisor::attach_slave_control(fd, args.control_slot)
            .context("attaching shared control block")?;
        return Ok(ReplayEngine::with_control(backend, opts, Some(control)));
    }

    #[cfg(not(unix))]
    if args.slave_process {
        bail!("slave mode requires a unix platform");
    }
    Ok(ReplayEngine::new(backend, opts))
}

#[cfg(unix)]
fn run_supervised(
    args: &Args,
    replay_opts: ReplayOptions,
    masked_modules: Vec<Hash>,
) -> Result<u8> {
    use kiln_replay::supervisor::{self, SupervisorOptions};

    let max_slaves = if args.num_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        args.num_threads
    };
    let opts = SupervisorOptions {
        archive_path: args.archive.clone(),
        max_slaves,
        shard_stride: args.shard_stride,
        timeout: args.timeout.map(Duration::from_secs),
        quiet_slave: args.quiet_slave,
        masked_modules,
        replay: replay_opts,
    };

    let code = if args.progress {
        supervisor::run_progress(&opts).context("progress process failed")?
    } else {
        supervisor::run_master(&opts, args.shmem_fd).context("master process failed")?
    };
    Ok(u8::try_from(code.clamp(0, 255)).expect("clamped to u8 range"))
}

#[cfg(not(unix))]
fn run_supervised(_args: &Args, _replay_opts: ReplayOptions, _masked: Vec<Hash>) -> Result<u8> {
    bail!("--master-process and --progress require a unix platform");
}

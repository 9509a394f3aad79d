//! End-to-end tests driving the built binary over real archive files.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use kiln_archive::{ArchiveBuilder, Hash, ResourceTag};
use kiln_state::{
    to_entry_json, ApplicationState, ComputePipelineCreateInfo, PipelineLayoutCreateInfo,
    PipelineShaderStage, RenderPassCreateInfo, ShaderModuleCreateInfo,
};

const PIPELINE_LAYOUT_HASH: Hash = 0x30;
const RENDER_PASS_HASH: Hash = 0x40;

fn module_hash(index: u64) -> Hash {
    0x500 + index
}

fn pipeline_hash(index: u64) -> Hash {
    0x1000 + index
}

fn spirv_code() -> Vec<u8> {
    let words: [u32; 5] = [0x0723_0203, 0x0001_0600, 0, 4, 0];
    let mut code = Vec::with_capacity(words.len() * 4);
    for word in words {
        code.extend_from_slice(&word.to_le_bytes());
    }
    code
}

/// Archive with `count` compute pipelines, each using its own shader module.
fn write_archive(path: &Path, count: u64) {
    let file = std::fs::File::create(path).expect("create archive file");
    let mut builder = ArchiveBuilder::new(file).expect("builder");

    let mut add = |tag: ResourceTag, hash: Hash, payload: Vec<u8>| {
        builder.add_entry(tag, hash, &payload, true).expect("add entry");
    };

    add(
        ResourceTag::AppInfo,
        1,
        to_entry_json(&ApplicationState::default()).expect("json"),
    );
    add(
        ResourceTag::PipelineLayout,
        PIPELINE_LAYOUT_HASH,
        to_entry_json(&PipelineLayoutCreateInfo::default()).expect("json"),
    );
    add(
        ResourceTag::RenderPass,
        RENDER_PASS_HASH,
        to_entry_json(&RenderPassCreateInfo::default()).expect("json"),
    );
    for i in 0..count {
        add(
            ResourceTag::ShaderModule,
            module_hash(i),
            to_entry_json(&ShaderModuleCreateInfo {
                flags: 0,
                code: spirv_code(),
            })
            .expect("json"),
        );
    }
    for i in 0..count {
        add(
            ResourceTag::ComputePipeline,
            pipeline_hash(i),
            to_entry_json(&ComputePipelineCreateInfo {
                flags: 0,
                stage: PipelineShaderStage {
                    stage: 0x20,
                    module: module_hash(i),
                    name: "main".to_owned(),
                },
                layout: PIPELINE_LAYOUT_HASH,
                base_pipeline: 0,
            })
            .expect("json"),
        );
    }

    builder.finish().expect("finish archive");
}

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kiln-replay"))
}

fn run_ok(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let output = Command::new(binary())
        .args(args)
        .envs(envs.iter().copied())
        .output()
        .expect("run kiln-replay");
    assert!(
        output.status.success(),
        "kiln-replay {args:?} exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn replays_an_archive_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 4);

    let output = run_ok(&[archive.to_str().expect("utf8 path")], &[]);
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("4 compute pipelines"),
        "summary missing from logs:\n{stderr}"
    );
}

#[test]
fn shard_range_limits_what_compiles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 10);

    let output = run_ok(
        &[
            "--compute-pipeline-range",
            "3",
            "7",
            archive.to_str().expect("utf8 path"),
        ],
        &[],
    );
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("4 compute pipelines"),
        "expected 4 compiled pipelines:\n{stderr}"
    );
}

#[test]
fn masked_module_skips_its_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 1);

    let output = run_ok(
        &[
            "--mask-shader-module",
            "0000000000000500",
            archive.to_str().expect("utf8 path"),
        ],
        &[],
    );
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("0 compute pipelines"),
        "masked pipeline still compiled:\n{stderr}"
    );
}

#[test]
fn on_disk_cache_survives_across_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    let cache = dir.path().join("pipeline-cache.bin");
    write_archive(&archive, 2);

    let cache_arg = cache.to_str().expect("utf8 path");
    let archive_arg = archive.to_str().expect("utf8 path");
    run_ok(&["--on-disk-pipeline-cache", cache_arg, archive_arg], &[]);
    assert!(cache.exists(), "cache file was not written");

    // Second run accepts the written blob; a corrupted blob falls back to an
    // empty cache without failing the replay.
    run_ok(&["--on-disk-pipeline-cache", cache_arg, archive_arg], &[]);
    std::fs::write(&cache, b"garbage").expect("corrupt cache");
    run_ok(&["--on-disk-pipeline-cache", cache_arg, archive_arg], &[]);
}

#[test]
fn missing_archive_is_a_config_error() {
    let output = Command::new(binary())
        .arg("/nonexistent/archive.kiln")
        .output()
        .expect("run kiln-replay");
    assert!(!output.status.success());
}

#[cfg(unix)]
#[test]
fn master_recovers_past_a_crashing_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 10);

    // Pipeline index 4 takes the driver down; the master must ban its
    // module, skip the pipeline, and replay the rest in a fresh slave.
    let crash_hash = format!("{:x}", pipeline_hash(4));
    let output = run_ok(
        &[
            "--master-process",
            "--num-threads",
            "1",
            archive.to_str().expect("utf8 path"),
        ],
        &[("KILN_SOFT_CRASH_HASHES", crash_hash.as_str())],
    );
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("Compute 9 / 10, skipped 1"),
        "unexpected final progress:\n{stderr}"
    );
    assert!(
        stderr.contains("Dirty crashes 1"),
        "dirty crash not counted:\n{stderr}"
    );
    assert!(
        stderr.contains("detected faulty shader module 0000000000000504"),
        "faulty module not reported:\n{stderr}"
    );
}

#[cfg(unix)]
#[test]
fn progress_role_reports_and_propagates_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 3);

    let output = run_ok(
        &[
            "--progress",
            "--num-threads",
            "1",
            archive.to_str().expect("utf8 path"),
        ],
        &[],
    );
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("Progress report:"),
        "no progress report logged:\n{stderr}"
    );
    assert!(
        stderr.contains("Compute 3 / 3, skipped 0"),
        "unexpected final progress:\n{stderr}"
    );
}

#[cfg(unix)]
#[test]
fn hung_slave_is_killed_and_counted_as_dirty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let archive = dir.path().join("state.kiln");
    write_archive(&archive, 1);

    // Every compile sleeps longer than the slave budget, so the first slave
    // is killed mid-module; its module gets banned and the retry completes
    // with the pipeline skipped.
    let output = run_ok(
        &[
            "--master-process",
            "--num-threads",
            "1",
            "--timeout",
            "1",
            archive.to_str().expect("utf8 path"),
        ],
        &[("KILN_SOFT_COMPILE_DELAY_MS", "5000")],
    );
    let stderr = stderr_of(&output);
    assert!(
        stderr.contains("Dirty crashes 1"),
        "timeout not counted as dirty crash:\n{stderr}"
    );
    assert!(
        stderr.contains("Compute 0 / 1, skipped 1"),
        "unexpected final progress:\n{stderr}"
    );
}

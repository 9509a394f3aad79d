//! On-disk driver pipeline-cache lifecycle.
//!
//! Load/validate on device init, extract and persist on teardown. Everything
//! here is best-effort: a bad blob starts an empty cache, a failed write is
//! logged and the replay result stands. The teardown write can run on paths
//! that are not async-signal-safe; it stays best-effort on purpose.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::{error, info, warn};

use kiln_driver::pipeline_cache::validate_blob_header;
use kiln_driver::{Device, PipelineCacheHandle};

/// Create the driver pipeline cache, seeded from `path` when the on-disk
/// blob matches the current device.
pub fn create_pipeline_cache(device: &dyn Device, path: Option<&Path>) -> PipelineCacheHandle {
    let mut initial = Vec::new();
    if let Some(path) = path {
        match fs::read(path) {
            Ok(blob) if blob.is_empty() => {}
            Ok(blob) => match validate_blob_header(&blob, device.properties()) {
                Ok(()) => initial = blob,
                Err(reason) => {
                    info!(
                        "ignoring on-disk pipeline cache {}: {reason}; creating a blank one",
                        path.display()
                    );
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!("failed to read pipeline cache {}: {err}", path.display());
            }
        }
    }

    match device.create_pipeline_cache(&initial) {
        Ok(handle) => handle,
        Err(err) => {
            error!("failed to create pipeline cache: {err}; trying a blank one");
            match device.create_pipeline_cache(&[]) {
                Ok(handle) => handle,
                Err(err) => {
                    error!("failed to create blank pipeline cache: {err}");
                    PipelineCacheHandle::NULL
                }
            }
        }
    }
}

/// Extract the cache blob, persist it over `path`, and destroy the cache.
pub fn flush_pipeline_cache(device: &dyn Device, cache: PipelineCacheHandle, path: Option<&Path>) {
    if cache.is_null() {
        return;
    }
    if let Some(path) = path {
        match device.pipeline_cache_data(cache) {
            Ok(blob) => {
                if let Err(err) = write_atomically(path, &blob) {
                    error!(
                        "failed to write pipeline cache data to {}: {err}",
                        path.display()
                    );
                }
            }
            Err(err) => error!("failed to extract pipeline cache data: {err}"),
        }
    }
    device.destroy_pipeline_cache(cache);
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_driver::{DeviceOptions, DriverBackend, SoftBackend};

    #[test]
    fn cache_written_by_one_run_is_accepted_by_the_next() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.bin");
        let backend = SoftBackend::new();

        let device = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        let cache = create_pipeline_cache(device.as_ref(), Some(&path));
        assert!(!cache.is_null());
        flush_pipeline_cache(device.as_ref(), cache, Some(&path));
        let blob = fs::read(&path).expect("cache file written");
        assert!(validate_blob_header(&blob, device.properties()).is_ok());

        // Second run on the same device accepts the blob.
        let device = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        let cache = create_pipeline_cache(device.as_ref(), Some(&path));
        assert!(!cache.is_null());
        flush_pipeline_cache(device.as_ref(), cache, Some(&path));
    }

    #[test]
    fn mismatched_device_identity_falls_back_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.bin");
        let backend = SoftBackend::new();

        let device = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        let cache = create_pipeline_cache(device.as_ref(), Some(&path));
        flush_pipeline_cache(device.as_ref(), cache, Some(&path));

        // A different device index changes the cache UUID; the blob must be
        // rejected without failing cache creation.
        let other = backend
            .create_device(
                &DeviceOptions {
                    device_index: 3,
                    enable_validation: false,
                },
                None,
                None,
            )
            .expect("device");
        let blob = fs::read(&path).expect("cache file");
        assert!(validate_blob_header(&blob, other.properties()).is_err());
        let cache = create_pipeline_cache(other.as_ref(), Some(&path));
        assert!(!cache.is_null());
    }

    #[test]
    fn corrupt_cache_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.bin");
        fs::write(&path, b"not a cache").expect("write");

        let backend = SoftBackend::new();
        let device = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        let cache = create_pipeline_cache(device.as_ref(), Some(&path));
        assert!(!cache.is_null());
    }
}

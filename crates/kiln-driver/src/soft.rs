//! Software driver backend.
//!
//! Compiles nothing: validates the structural invariants a real driver would
//! reject (SPIR-V framing, null referenced handles, handle liveness) and
//! mints opaque handles. The fault hooks exist to exercise the supervision
//! protocol: a "crash" aborts the process mid-compile the way a faulty
//! driver would take the process down, a "fail" returns a creation error,
//! and a compile delay simulates slow compilation for timeout handling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use kiln_archive::Hash;
use kiln_state::{
    ApplicationInfo, ComputePipelineCreateInfo, DescriptorSetLayoutCreateInfo, DeviceFeatures,
    GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo, RenderPassCreateInfo, SamplerCreateInfo,
    ShaderModuleCreateInfo, MAX_PIPELINE_STAGES,
};

use crate::device::{
    ComputePipelineRefs, Device, DeviceOptions, DeviceProperties, DriverBackend, DriverError,
    DriverResult, GraphicsPipelineRefs,
};
use crate::handles::{
    DescriptorSetLayoutHandle, PipelineCacheHandle, PipelineHandle, PipelineLayoutHandle,
    RenderPassHandle, SamplerHandle, ShaderModuleHandle,
};
use crate::pipeline_cache::{
    validate_blob_header, PipelineCacheHeader, PIPELINE_CACHE_HEADER_SIZE,
    PIPELINE_CACHE_UUID_SIZE,
};

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const CRASH_HASHES_ENV: &str = "KILN_SOFT_CRASH_HASHES";
pub const FAIL_HASHES_ENV: &str = "KILN_SOFT_FAIL_HASHES";
pub const COMPILE_DELAY_ENV: &str = "KILN_SOFT_COMPILE_DELAY_MS";

/// Fault injection configuration for the software device.
#[derive(Clone, Debug, Default)]
pub struct SoftFaults {
    /// Abort the process when asked to create an object with one of these
    /// hashes.
    pub crash_hashes: HashSet<Hash>,
    /// Return a creation error for these hashes.
    pub fail_hashes: HashSet<Hash>,
    /// Sleep this long in every module/pipeline creation.
    pub compile_delay: Option<Duration>,
}

impl SoftFaults {
    /// Read fault configuration from the environment. Unparseable values are
    /// warned about and ignored so a typo cannot change replay results
    /// silently.
    pub fn from_env() -> Self {
        let mut faults = Self::default();
        if let Some(hashes) = parse_env_hash_list(CRASH_HASHES_ENV) {
            faults.crash_hashes = hashes;
        }
        if let Some(hashes) = parse_env_hash_list(FAIL_HASHES_ENV) {
            faults.fail_hashes = hashes;
        }
        faults.compile_delay = parse_env_delay(COMPILE_DELAY_ENV);
        faults
    }
}

fn parse_env_hash_list(var: &'static str) -> Option<HashSet<Hash>> {
    let raw = std::env::var(var).ok()?;
    let mut out = HashSet::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let digits = part.strip_prefix("0x").unwrap_or(part);
        match Hash::from_str_radix(digits, 16) {
            Ok(hash) => {
                out.insert(hash);
            }
            Err(err) => {
                warn!(env_var = var, value = part, error = %err, "Ignoring unparseable hash");
            }
        }
    }
    Some(out)
}

fn parse_env_delay(var: &'static str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(err) => {
            warn!(env_var = var, value = %raw, error = %err, "Ignoring unparseable delay");
            None
        }
    }
}

pub struct SoftBackend {
    faults: SoftFaults,
}

impl SoftBackend {
    pub fn new() -> Self {
        Self {
            faults: SoftFaults::default(),
        }
    }

    pub fn from_env() -> Self {
        Self {
            faults: SoftFaults::from_env(),
        }
    }

    pub fn with_faults(faults: SoftFaults) -> Self {
        Self { faults }
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverBackend for SoftBackend {
    fn create_device(
        &self,
        opts: &DeviceOptions,
        _app: Option<&ApplicationInfo>,
        _features: Option<&DeviceFeatures>,
    ) -> DriverResult<Arc<dyn Device>> {
        Ok(Arc::new(SoftDevice::new(opts, self.faults.clone())))
    }
}

pub struct SoftDevice {
    props: DeviceProperties,
    validation: bool,
    faults: SoftFaults,
    next_handle: AtomicU64,
    live: Mutex<HashSet<u64>>,
    caches: Mutex<HashMap<u64, u64>>,
}

impl SoftDevice {
    const VENDOR_ID: u32 = 0x4b4c;

    fn new(opts: &DeviceOptions, faults: SoftFaults) -> Self {
        let device_id = 0x4e00 + opts.device_index;
        Self {
            props: DeviceProperties {
                device_name: format!("kiln soft device {}", opts.device_index),
                vendor_id: Self::VENDOR_ID,
                device_id,
                cache_uuid: derive_cache_uuid(Self::VENDOR_ID, device_id),
            },
            validation: opts.enable_validation,
            faults,
            next_handle: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            caches: Mutex::new(HashMap::new()),
        }
    }

    fn alloc(&self) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.live).insert(handle);
        handle
    }

    fn release(&self, kind: &'static str, handle: u64) {
        if handle == 0 {
            return;
        }
        if !lock(&self.live).remove(&handle) {
            warn!("destroy of unknown {kind} handle 0x{handle:x}");
        }
    }

    fn inject(&self, kind: &'static str, hash: Hash) -> DriverResult<()> {
        if self.faults.crash_hashes.contains(&hash) {
            // Mimic a driver fault: take the whole process down, bypassing
            // unwinding, so the supervisor sees a dirty crash.
            eprintln!("kiln-soft: simulated driver crash compiling {kind} {hash:016x}");
            std::process::abort();
        }
        if self.faults.fail_hashes.contains(&hash) {
            return Err(DriverError::CreationFailed {
                kind,
                hash,
                reason: "injected creation failure",
            });
        }
        Ok(())
    }

    fn compile_pause(&self) {
        if let Some(delay) = self.faults.compile_delay {
            std::thread::sleep(delay);
        }
    }

    fn check_live(&self, kind: &'static str, handle: u64) -> DriverResult<()> {
        if self.validation && !lock(&self.live).contains(&handle) {
            return Err(DriverError::InvalidHandle { kind, handle });
        }
        Ok(())
    }

    fn record_cache_use(&self, cache: PipelineCacheHandle) {
        if !cache.is_null() {
            if let Some(count) = lock(&self.caches).get_mut(&cache.0) {
                *count += 1;
            }
        }
    }
}

impl Device for SoftDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    fn create_sampler(&self, hash: Hash, _info: &SamplerCreateInfo) -> DriverResult<SamplerHandle> {
        self.inject("sampler", hash)?;
        Ok(SamplerHandle(self.alloc()))
    }

    fn create_descriptor_set_layout(
        &self,
        hash: Hash,
        info: &DescriptorSetLayoutCreateInfo,
        immutable_samplers: &[Vec<SamplerHandle>],
    ) -> DriverResult<DescriptorSetLayoutHandle> {
        self.inject("descriptor set layout", hash)?;
        if immutable_samplers.len() != info.bindings.len() {
            return Err(DriverError::CreationFailed {
                kind: "descriptor set layout",
                hash,
                reason: "immutable sampler table does not match bindings",
            });
        }
        for samplers in immutable_samplers {
            for sampler in samplers {
                self.check_live("sampler", sampler.0)?;
            }
        }
        Ok(DescriptorSetLayoutHandle(self.alloc()))
    }

    fn create_pipeline_layout(
        &self,
        hash: Hash,
        info: &PipelineLayoutCreateInfo,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> DriverResult<PipelineLayoutHandle> {
        self.inject("pipeline layout", hash)?;
        if set_layouts.len() != info.set_layouts.len() {
            return Err(DriverError::CreationFailed {
                kind: "pipeline layout",
                hash,
                reason: "set layout handles do not match create info",
            });
        }
        for layout in set_layouts {
            if layout.is_null() {
                return Err(DriverError::CreationFailed {
                    kind: "pipeline layout",
                    hash,
                    reason: "null descriptor set layout",
                });
            }
            self.check_live("descriptor set layout", layout.0)?;
        }
        Ok(PipelineLayoutHandle(self.alloc()))
    }

    fn create_render_pass(
        &self,
        hash: Hash,
        info: &RenderPassCreateInfo,
    ) -> DriverResult<RenderPassHandle> {
        self.inject("render pass", hash)?;
        for subpass in &info.subpasses {
            for reference in subpass
                .color_attachments
                .iter()
                .chain(&subpass.input_attachments)
                .chain(&subpass.resolve_attachments)
            {
                // ATTACHMENT_UNUSED is encoded as u32::MAX.
                if reference.attachment != u32::MAX
                    && reference.attachment as usize >= info.attachments.len()
                {
                    return Err(DriverError::CreationFailed {
                        kind: "render pass",
                        hash,
                        reason: "attachment reference out of bounds",
                    });
                }
            }
        }
        Ok(RenderPassHandle(self.alloc()))
    }

    fn create_shader_module(
        &self,
        hash: Hash,
        info: &ShaderModuleCreateInfo,
    ) -> DriverResult<ShaderModuleHandle> {
        self.inject("shader module", hash)?;
        self.compile_pause();
        if info.code.len() < 4 || info.code.len() % 4 != 0 {
            return Err(DriverError::CreationFailed {
                kind: "shader module",
                hash,
                reason: "code size is not a positive multiple of 4",
            });
        }
        let magic = u32::from_le_bytes(info.code[0..4].try_into().expect("4-byte slice"));
        if magic != SPIRV_MAGIC {
            return Err(DriverError::CreationFailed {
                kind: "shader module",
                hash,
                reason: "bad SPIR-V magic",
            });
        }
        Ok(ShaderModuleHandle(self.alloc()))
    }

    fn create_graphics_pipeline(
        &self,
        hash: Hash,
        cache: PipelineCacheHandle,
        info: &GraphicsPipelineCreateInfo,
        refs: &GraphicsPipelineRefs,
    ) -> DriverResult<PipelineHandle> {
        self.inject("graphics pipeline", hash)?;
        self.compile_pause();
        if info.stages.is_empty() || info.stages.len() > MAX_PIPELINE_STAGES {
            return Err(DriverError::CreationFailed {
                kind: "graphics pipeline",
                hash,
                reason: "invalid stage count",
            });
        }
        if refs.stages.len() != info.stages.len() {
            return Err(DriverError::CreationFailed {
                kind: "graphics pipeline",
                hash,
                reason: "stage handles do not match create info",
            });
        }
        for stage in &refs.stages {
            if stage.is_null() {
                return Err(DriverError::CreationFailed {
                    kind: "graphics pipeline",
                    hash,
                    reason: "null shader module",
                });
            }
            self.check_live("shader module", stage.0)?;
        }
        if refs.layout.is_null() || refs.render_pass.is_null() {
            return Err(DriverError::CreationFailed {
                kind: "graphics pipeline",
                hash,
                reason: "null pipeline layout or render pass",
            });
        }
        if info.is_derivative() && refs.base_pipeline.is_null() {
            return Err(DriverError::CreationFailed {
                kind: "graphics pipeline",
                hash,
                reason: "derivative pipeline with null base",
            });
        }
        self.record_cache_use(cache);
        Ok(PipelineHandle(self.alloc()))
    }

    fn create_compute_pipeline(
        &self,
        hash: Hash,
        cache: PipelineCacheHandle,
        info: &ComputePipelineCreateInfo,
        refs: &ComputePipelineRefs,
    ) -> DriverResult<PipelineHandle> {
        self.inject("compute pipeline", hash)?;
        self.compile_pause();
        if refs.stage.is_null() {
            return Err(DriverError::CreationFailed {
                kind: "compute pipeline",
                hash,
                reason: "null shader module",
            });
        }
        self.check_live("shader module", refs.stage.0)?;
        if refs.layout.is_null() {
            return Err(DriverError::CreationFailed {
                kind: "compute pipeline",
                hash,
                reason: "null pipeline layout",
            });
        }
        if info.is_derivative() && refs.base_pipeline.is_null() {
            return Err(DriverError::CreationFailed {
                kind: "compute pipeline",
                hash,
                reason: "derivative pipeline with null base",
            });
        }
        self.record_cache_use(cache);
        Ok(PipelineHandle(self.alloc()))
    }

    fn destroy_sampler(&self, handle: SamplerHandle) {
        self.release("sampler", handle.0);
    }

    fn destroy_descriptor_set_layout(&self, handle: DescriptorSetLayoutHandle) {
        self.release("descriptor set layout", handle.0);
    }

    fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        self.release("pipeline layout", handle.0);
    }

    fn destroy_render_pass(&self, handle: RenderPassHandle) {
        self.release("render pass", handle.0);
    }

    fn destroy_shader_module(&self, handle: ShaderModuleHandle) {
        self.release("shader module", handle.0);
    }

    fn destroy_pipeline(&self, handle: PipelineHandle) {
        self.release("pipeline", handle.0);
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> DriverResult<PipelineCacheHandle> {
        // Seed the compile counter from a blob we produced earlier; anything
        // unrecognizable starts an empty cache, as a driver would.
        let mut seed = 0u64;
        if validate_blob_header(initial_data, &self.props).is_ok()
            && initial_data.len() >= PIPELINE_CACHE_HEADER_SIZE + 8
        {
            seed = u64::from_le_bytes(
                initial_data[PIPELINE_CACHE_HEADER_SIZE..PIPELINE_CACHE_HEADER_SIZE + 8]
                    .try_into()
                    .expect("8-byte slice"),
            );
        }
        let handle = self.alloc();
        lock(&self.caches).insert(handle, seed);
        Ok(PipelineCacheHandle(handle))
    }

    fn pipeline_cache_data(&self, cache: PipelineCacheHandle) -> DriverResult<Vec<u8>> {
        let caches = lock(&self.caches);
        let count = caches
            .get(&cache.0)
            .ok_or(DriverError::InvalidHandle {
                kind: "pipeline cache",
                handle: cache.0,
            })?;
        let mut blob = Vec::with_capacity(PIPELINE_CACHE_HEADER_SIZE + 8);
        PipelineCacheHeader::for_device(&self.props).write_to(&mut blob);
        blob.extend_from_slice(&count.to_le_bytes());
        Ok(blob)
    }

    fn destroy_pipeline_cache(&self, cache: PipelineCacheHandle) {
        lock(&self.caches).remove(&cache.0);
        self.release("pipeline cache", cache.0);
    }
}

fn derive_cache_uuid(vendor_id: u32, device_id: u32) -> [u8; PIPELINE_CACHE_UUID_SIZE] {
    let mut uuid = [0u8; PIPELINE_CACHE_UUID_SIZE];
    let mut state = ((vendor_id as u64) << 32) | device_id as u64;
    for chunk in uuid.chunks_mut(8) {
        state = splitmix64(state);
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    uuid
}

fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SoftDevice {
        SoftDevice::new(&DeviceOptions::default(), SoftFaults::default())
    }

    fn spirv(words: &[u32]) -> Vec<u8> {
        let mut code = SPIRV_MAGIC.to_le_bytes().to_vec();
        for word in words {
            code.extend_from_slice(&word.to_le_bytes());
        }
        code
    }

    #[test]
    fn shader_module_requires_spirv_framing() {
        let dev = device();
        let ok = dev.create_shader_module(
            1,
            &ShaderModuleCreateInfo {
                flags: 0,
                code: spirv(&[1, 2, 3]),
            },
        );
        assert!(ok.is_ok());

        let bad_magic = dev.create_shader_module(
            2,
            &ShaderModuleCreateInfo {
                flags: 0,
                code: vec![1, 2, 3, 4],
            },
        );
        assert!(bad_magic.is_err());

        let bad_len = dev.create_shader_module(
            3,
            &ShaderModuleCreateInfo {
                flags: 0,
                code: spirv(&[])[..3].to_vec(),
            },
        );
        assert!(bad_len.is_err());
    }

    #[test]
    fn device_identity_is_deterministic_per_index() {
        let backend = SoftBackend::new();
        let a = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        let b = backend
            .create_device(&DeviceOptions::default(), None, None)
            .expect("device");
        assert_eq!(a.properties(), b.properties());

        let other = backend
            .create_device(
                &DeviceOptions {
                    device_index: 1,
                    enable_validation: false,
                },
                None,
                None,
            )
            .expect("device");
        assert_ne!(a.properties().cache_uuid, other.properties().cache_uuid);
        assert_ne!(a.properties().device_id, other.properties().device_id);
    }

    #[test]
    fn cache_blob_round_trips_compile_count() {
        let dev = device();
        let cache = dev.create_pipeline_cache(&[]).expect("cache");
        let module = dev
            .create_shader_module(
                1,
                &ShaderModuleCreateInfo {
                    flags: 0,
                    code: spirv(&[0]),
                },
            )
            .expect("module");
        let layout = dev
            .create_pipeline_layout(2, &PipelineLayoutCreateInfo::default(), &[])
            .expect("layout");
        dev.create_compute_pipeline(
            3,
            cache,
            &ComputePipelineCreateInfo::default(),
            &ComputePipelineRefs {
                stage: module,
                layout,
                base_pipeline: PipelineHandle::NULL,
            },
        )
        .expect("pipeline");

        let blob = dev.pipeline_cache_data(cache).expect("blob");
        assert_eq!(validate_blob_header(&blob, dev.properties()), Ok(()));

        let reloaded = dev.create_pipeline_cache(&blob).expect("cache");
        let blob2 = dev.pipeline_cache_data(reloaded).expect("blob");
        assert_eq!(blob, blob2);
    }

    #[test]
    fn injected_failure_is_reported() {
        let mut faults = SoftFaults::default();
        faults.fail_hashes.insert(0xbad);
        let dev = SoftDevice::new(&DeviceOptions::default(), faults);
        let result = dev.create_shader_module(
            0xbad,
            &ShaderModuleCreateInfo {
                flags: 0,
                code: spirv(&[0]),
            },
        );
        assert!(matches!(
            result,
            Err(DriverError::CreationFailed { hash: 0xbad, .. })
        ));
    }

    #[test]
    fn null_base_derivative_is_rejected() {
        let dev = device();
        let module = dev
            .create_shader_module(
                1,
                &ShaderModuleCreateInfo {
                    flags: 0,
                    code: spirv(&[0]),
                },
            )
            .expect("module");
        let layout = dev
            .create_pipeline_layout(2, &PipelineLayoutCreateInfo::default(), &[])
            .expect("layout");
        let info = ComputePipelineCreateInfo {
            flags: kiln_state::PIPELINE_CREATE_DERIVATIVE,
            ..ComputePipelineCreateInfo::default()
        };
        let result = dev.create_compute_pipeline(
            3,
            PipelineCacheHandle::NULL,
            &info,
            &ComputePipelineRefs {
                stage: module,
                layout,
                base_pipeline: PipelineHandle::NULL,
            },
        );
        assert!(result.is_err());
    }
}

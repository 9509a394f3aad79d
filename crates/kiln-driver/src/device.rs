use std::sync::Arc;

use thiserror::Error;

use kiln_archive::Hash;
use kiln_state::{
    ApplicationInfo, ComputePipelineCreateInfo, DescriptorSetLayoutCreateInfo, DeviceFeatures,
    GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo, RenderPassCreateInfo, SamplerCreateInfo,
    ShaderModuleCreateInfo,
};

use crate::handles::{
    DescriptorSetLayoutHandle, PipelineCacheHandle, PipelineHandle, PipelineLayoutHandle,
    RenderPassHandle, SamplerHandle, ShaderModuleHandle,
};
use crate::pipeline_cache::PIPELINE_CACHE_UUID_SIZE;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    #[error("failed to create {kind} {hash:016x}: {reason}")]
    CreationFailed {
        kind: &'static str,
        hash: Hash,
        reason: &'static str,
    },

    #[error("invalid {kind} handle {handle:#x}")]
    InvalidHandle { kind: &'static str, handle: u64 },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    pub device_name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub cache_uuid: [u8; PIPELINE_CACHE_UUID_SIZE],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceOptions {
    pub device_index: u32,
    pub enable_validation: bool,
}

/// Referenced handles for a graphics pipeline, pre-resolved by the caller
/// from the captured hashes. `stages` is parallel to the create-info's
/// `stages` list.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineRefs {
    pub stages: Vec<ShaderModuleHandle>,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub base_pipeline: PipelineHandle,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ComputePipelineRefs {
    pub stage: ShaderModuleHandle,
    pub layout: PipelineLayoutHandle,
    pub base_pipeline: PipelineHandle,
}

/// A live driver device.
///
/// Creation primitives are thread-safe (`&self`, `Send + Sync`) the way the
/// underlying driver entry points are documented to be when given distinct
/// out-parameters. The capture hash accompanies every creation call as an
/// opaque debug label; drivers may ignore it.
pub trait Device: Send + Sync {
    fn properties(&self) -> &DeviceProperties;

    fn create_sampler(&self, hash: Hash, info: &SamplerCreateInfo) -> DriverResult<SamplerHandle>;
    fn create_descriptor_set_layout(
        &self,
        hash: Hash,
        info: &DescriptorSetLayoutCreateInfo,
        immutable_samplers: &[Vec<SamplerHandle>],
    ) -> DriverResult<DescriptorSetLayoutHandle>;
    fn create_pipeline_layout(
        &self,
        hash: Hash,
        info: &PipelineLayoutCreateInfo,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> DriverResult<PipelineLayoutHandle>;
    fn create_render_pass(
        &self,
        hash: Hash,
        info: &RenderPassCreateInfo,
    ) -> DriverResult<RenderPassHandle>;
    fn create_shader_module(
        &self,
        hash: Hash,
        info: &ShaderModuleCreateInfo,
    ) -> DriverResult<ShaderModuleHandle>;
    fn create_graphics_pipeline(
        &self,
        hash: Hash,
        cache: PipelineCacheHandle,
        info: &GraphicsPipelineCreateInfo,
        refs: &GraphicsPipelineRefs,
    ) -> DriverResult<PipelineHandle>;
    fn create_compute_pipeline(
        &self,
        hash: Hash,
        cache: PipelineCacheHandle,
        info: &ComputePipelineCreateInfo,
        refs: &ComputePipelineRefs,
    ) -> DriverResult<PipelineHandle>;

    fn destroy_sampler(&self, handle: SamplerHandle);
    fn destroy_descriptor_set_layout(&self, handle: DescriptorSetLayoutHandle);
    fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle);
    fn destroy_render_pass(&self, handle: RenderPassHandle);
    fn destroy_shader_module(&self, handle: ShaderModuleHandle);
    fn destroy_pipeline(&self, handle: PipelineHandle);

    /// Create a pipeline cache, optionally seeded with a previously extracted
    /// blob. A blob the driver does not recognize starts an empty cache.
    fn create_pipeline_cache(&self, initial_data: &[u8]) -> DriverResult<PipelineCacheHandle>;
    fn pipeline_cache_data(&self, cache: PipelineCacheHandle) -> DriverResult<Vec<u8>>;
    fn destroy_pipeline_cache(&self, cache: PipelineCacheHandle);
}

/// Entry point into a driver implementation.
pub trait DriverBackend: Send + Sync {
    fn create_device(
        &self,
        opts: &DeviceOptions,
        app: Option<&ApplicationInfo>,
        features: Option<&DeviceFeatures>,
    ) -> DriverResult<Arc<dyn Device>>;
}

use serde::Serialize;
use thiserror::Error;

use kiln_archive::{Hash, ResourceTag};

use crate::model::{
    ApplicationInfo, ApplicationState, ComputePipelineCreateInfo, DescriptorSetLayoutCreateInfo,
    DeviceFeatures, GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo, RenderPassCreateInfo,
    SamplerCreateInfo, ShaderModuleCreateInfo,
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("malformed state JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("creator rejected {tag} entry {hash:016x}")]
    Rejected { tag: ResourceTag, hash: Hash },
}

/// Callback surface the deserializer drives, one entry point per resource
/// tag, invoked in the archive's published playback order.
///
/// Returning `false` rejects the entry; the caller logs and continues, it is
/// never fatal to the replay.
pub trait StateCreator {
    fn set_application_info(
        &mut self,
        hash: Hash,
        app: &ApplicationInfo,
        features: &DeviceFeatures,
    ) -> bool;
    fn create_sampler(&mut self, hash: Hash, info: SamplerCreateInfo) -> bool;
    fn create_descriptor_set_layout(
        &mut self,
        hash: Hash,
        info: DescriptorSetLayoutCreateInfo,
    ) -> bool;
    fn create_pipeline_layout(&mut self, hash: Hash, info: PipelineLayoutCreateInfo) -> bool;
    fn create_render_pass(&mut self, hash: Hash, info: RenderPassCreateInfo) -> bool;
    fn create_shader_module(&mut self, hash: Hash, info: ShaderModuleCreateInfo) -> bool;
    fn create_graphics_pipeline(&mut self, hash: Hash, info: GraphicsPipelineCreateInfo) -> bool;
    fn create_compute_pipeline(&mut self, hash: Hash, info: ComputePipelineCreateInfo) -> bool;

    /// Barrier between resource tags; implementations that overlap parsing
    /// with compilation block here until queued work has completed.
    fn sync_threads(&mut self) {}

    /// Live-handle lookup, consulted only when derivative-handle resolution
    /// is enabled on the replayer.
    fn resolve_base_pipeline(&self, tag: ResourceTag, hash: Hash) -> Option<u64> {
        let _ = (tag, hash);
        None
    }
}

/// Decodes archive entry payloads and drives a [`StateCreator`].
pub struct StateReplayer {
    resolve_derivative_pipeline_handles: bool,
}

impl Default for StateReplayer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReplayer {
    pub fn new() -> Self {
        Self {
            resolve_derivative_pipeline_handles: true,
        }
    }

    /// When disabled, `base_pipeline` fields reach the creator as the
    /// captured hashes rather than pre-resolved live handles. The replay
    /// core disables resolution and performs its own two-phase lookup.
    pub fn set_resolve_derivative_pipeline_handles(&mut self, enable: bool) {
        self.resolve_derivative_pipeline_handles = enable;
    }

    pub fn parse(
        &self,
        creator: &mut dyn StateCreator,
        tag: ResourceTag,
        hash: Hash,
        payload: &[u8],
    ) -> Result<(), StateError> {
        let accepted = match tag {
            ResourceTag::AppInfo => {
                let state: ApplicationState = serde_json::from_slice(payload)?;
                creator.set_application_info(hash, &state.application_info, &state.features)
            }
            ResourceTag::Sampler => {
                creator.create_sampler(hash, serde_json::from_slice(payload)?)
            }
            ResourceTag::DescriptorSetLayout => {
                creator.create_descriptor_set_layout(hash, serde_json::from_slice(payload)?)
            }
            ResourceTag::PipelineLayout => {
                creator.create_pipeline_layout(hash, serde_json::from_slice(payload)?)
            }
            ResourceTag::RenderPass => {
                creator.create_render_pass(hash, serde_json::from_slice(payload)?)
            }
            ResourceTag::ShaderModule => {
                creator.create_shader_module(hash, serde_json::from_slice(payload)?)
            }
            ResourceTag::GraphicsPipeline => {
                let mut info: GraphicsPipelineCreateInfo = serde_json::from_slice(payload)?;
                if self.resolve_derivative_pipeline_handles && info.is_derivative() {
                    info.base_pipeline = creator
                        .resolve_base_pipeline(tag, info.base_pipeline)
                        .unwrap_or(0);
                }
                creator.create_graphics_pipeline(hash, info)
            }
            ResourceTag::ComputePipeline => {
                let mut info: ComputePipelineCreateInfo = serde_json::from_slice(payload)?;
                if self.resolve_derivative_pipeline_handles && info.is_derivative() {
                    info.base_pipeline = creator
                        .resolve_base_pipeline(tag, info.base_pipeline)
                        .unwrap_or(0);
                }
                creator.create_compute_pipeline(hash, info)
            }
        };

        if accepted {
            Ok(())
        } else {
            Err(StateError::Rejected { tag, hash })
        }
    }
}

/// Serialize a create-info into an archive entry payload.
pub fn to_entry_json<T: Serialize>(info: &T) -> Result<Vec<u8>, StateError> {
    Ok(serde_json::to_vec(info)?)
}

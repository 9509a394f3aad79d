//! Shared fixtures: in-memory archives with enough real state to drive the
//! full playback path.

use std::io::Cursor;

use serde::Serialize;

use kiln_archive::{ArchiveBuilder, ArchiveReader, Hash, ResourceTag};
use kiln_state::{
    to_entry_json, ApplicationState, ComputePipelineCreateInfo, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, GraphicsPipelineCreateInfo, PipelineLayoutCreateInfo,
    PipelineShaderStage, RenderPassCreateInfo, SamplerCreateInfo, ShaderModuleCreateInfo,
};

pub const APP_HASH: Hash = 0x01;
pub const SAMPLER_HASH: Hash = 0x10;
pub const SET_LAYOUT_HASH: Hash = 0x20;
pub const PIPELINE_LAYOUT_HASH: Hash = 0x30;
pub const RENDER_PASS_HASH: Hash = 0x40;
pub const MODULE_HASH: Hash = 0x50;

pub struct ArchiveFixture {
    entries: Vec<(ResourceTag, Hash, Vec<u8>)>,
}

impl Default for ArchiveFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveFixture {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// App info plus the trivial objects every pipeline fixture needs:
    /// a sampler, a descriptor set layout using it, a pipeline layout, a
    /// render pass, and one shader module.
    pub fn with_base_objects() -> Self {
        let mut fixture = Self::new();
        fixture.add(ResourceTag::AppInfo, APP_HASH, &ApplicationState::default());
        fixture.add(
            ResourceTag::Sampler,
            SAMPLER_HASH,
            &SamplerCreateInfo::default(),
        );
        fixture.add(
            ResourceTag::DescriptorSetLayout,
            SET_LAYOUT_HASH,
            &DescriptorSetLayoutCreateInfo {
                flags: 0,
                bindings: vec![DescriptorSetLayoutBinding {
                    binding: 0,
                    descriptor_type: 1,
                    descriptor_count: 1,
                    stage_flags: 0x20,
                    immutable_samplers: vec![SAMPLER_HASH],
                }],
            },
        );
        fixture.add(
            ResourceTag::PipelineLayout,
            PIPELINE_LAYOUT_HASH,
            &PipelineLayoutCreateInfo {
                flags: 0,
                set_layouts: vec![SET_LAYOUT_HASH],
                push_constant_ranges: Vec::new(),
            },
        );
        fixture.add(
            ResourceTag::RenderPass,
            RENDER_PASS_HASH,
            &RenderPassCreateInfo::default(),
        );
        fixture.add_shader_module(MODULE_HASH);
        fixture
    }

    pub fn add<T: Serialize>(&mut self, tag: ResourceTag, hash: Hash, info: &T) {
        let payload = to_entry_json(info).expect("serialize entry");
        self.entries.push((tag, hash, payload));
    }

    pub fn add_shader_module(&mut self, hash: Hash) {
        self.add(
            ResourceTag::ShaderModule,
            hash,
            &ShaderModuleCreateInfo {
                flags: 0,
                code: spirv_code(),
            },
        );
    }

    pub fn add_graphics_pipeline(&mut self, hash: Hash, flags: u32, base: Hash) {
        self.add(
            ResourceTag::GraphicsPipeline,
            hash,
            &graphics_pipeline(flags, MODULE_HASH, base),
        );
    }

    pub fn add_compute_pipeline(&mut self, hash: Hash, flags: u32, base: Hash) {
        self.add(
            ResourceTag::ComputePipeline,
            hash,
            &compute_pipeline(flags, MODULE_HASH, base),
        );
    }

    pub fn build(&self) -> ArchiveReader<Cursor<Vec<u8>>> {
        let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new())).expect("builder");
        for (tag, hash, payload) in &self.entries {
            builder
                .add_entry(*tag, *hash, payload, true)
                .expect("add entry");
        }
        let bytes = builder.finish().expect("finish").into_inner();
        ArchiveReader::open(Cursor::new(bytes)).expect("open archive")
    }
}

pub fn spirv_code() -> Vec<u8> {
    let words: [u32; 5] = [0x0723_0203, 0x0001_0600, 0, 4, 0];
    let mut code = Vec::with_capacity(words.len() * 4);
    for word in words {
        code.extend_from_slice(&word.to_le_bytes());
    }
    code
}

pub fn graphics_pipeline(flags: u32, module: Hash, base: Hash) -> GraphicsPipelineCreateInfo {
    GraphicsPipelineCreateInfo {
        flags,
        stages: vec![
            PipelineShaderStage {
                stage: 0x1,
                module,
                name: "main".to_owned(),
            },
            PipelineShaderStage {
                stage: 0x10,
                module,
                name: "main".to_owned(),
            },
        ],
        layout: PIPELINE_LAYOUT_HASH,
        render_pass: RENDER_PASS_HASH,
        subpass: 0,
        base_pipeline: base,
        ..GraphicsPipelineCreateInfo::default()
    }
}

pub fn compute_pipeline(flags: u32, module: Hash, base: Hash) -> ComputePipelineCreateInfo {
    ComputePipelineCreateInfo {
        flags,
        stage: PipelineShaderStage {
            stage: 0x20,
            module,
            name: "main".to_owned(),
        },
        layout: PIPELINE_LAYOUT_HASH,
        base_pipeline: base,
    }
}

//! Captured create-info structures.
//!
//! Field values are the raw API integer codes from the capture, not
//! re-interpreted enums; the replayer hands them to the driver unmodified.
//! Every field is serde-defaulted so sparse captures keep parsing as the
//! capture layer evolves.

use serde::{Deserialize, Serialize};

use kiln_archive::Hash;

/// Pipeline may serve as the base of a derivative pipeline.
pub const PIPELINE_CREATE_ALLOW_DERIVATIVES: u32 = 0x2;
/// Pipeline derives from a base pipeline named by `base_pipeline`.
pub const PIPELINE_CREATE_DERIVATIVE: u32 = 0x4;

/// Upper bound on shader stages per pipeline (graphics stages plus the
/// task/mesh pair).
pub const MAX_PIPELINE_STAGES: usize = 6;

/// Hashes as fixed-width hex strings in JSON.
pub mod hex_hash {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{hash:016x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        u64::from_str_radix(&raw, 16)
            .map_err(|_| D::Error::custom(format!("invalid hash string {raw:?}")))
    }
}

/// `Vec<Hash>` as hex strings.
pub mod hex_hash_vec {
    use serde::de::Error;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hashes: &[u64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&format!("{hash:016x}"))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| {
                u64::from_str_radix(s, 16)
                    .map_err(|_| D::Error::custom(format!("invalid hash string {s:?}")))
            })
            .collect()
    }
}

/// SPIR-V code as standard base64.
pub mod spirv_code {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(code: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(code))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(|err| D::Error::custom(format!("invalid base64 code: {err}")))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationInfo {
    pub application_name: Option<String>,
    pub engine_name: Option<String>,
    pub application_version: u32,
    pub engine_version: u32,
    pub api_version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFeatures {
    pub robust_buffer_access: bool,
    pub full_draw_index_uint32: bool,
    pub geometry_shader: bool,
    pub tessellation_shader: bool,
    pub sampler_anisotropy: bool,
    pub shader_int64: bool,
}

/// Payload of an `AppInfo` archive entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationState {
    pub application_info: ApplicationInfo,
    pub features: DeviceFeatures,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerCreateInfo {
    pub flags: u32,
    pub mag_filter: u32,
    pub min_filter: u32,
    pub mipmap_mode: u32,
    pub address_mode_u: u32,
    pub address_mode_v: u32,
    pub address_mode_w: u32,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: u32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: u32,
    pub unnormalized_coordinates: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: u32,
    pub descriptor_count: u32,
    pub stage_flags: u32,
    #[serde(with = "hex_hash_vec")]
    pub immutable_samplers: Vec<Hash>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorSetLayoutCreateInfo {
    pub flags: u32,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConstantRange {
    pub stage_flags: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineLayoutCreateInfo {
    pub flags: u32,
    #[serde(with = "hex_hash_vec")]
    pub set_layouts: Vec<Hash>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentDescription {
    pub flags: u32,
    pub format: u32,
    pub samples: u32,
    pub load_op: u32,
    pub store_op: u32,
    pub stencil_load_op: u32,
    pub stencil_store_op: u32,
    pub initial_layout: u32,
    pub final_layout: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpassDescription {
    pub flags: u32,
    pub pipeline_bind_point: u32,
    pub input_attachments: Vec<AttachmentReference>,
    pub color_attachments: Vec<AttachmentReference>,
    pub resolve_attachments: Vec<AttachmentReference>,
    pub depth_stencil_attachment: Option<AttachmentReference>,
    pub preserve_attachments: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: u32,
    pub dst_stage_mask: u32,
    pub src_access_mask: u32,
    pub dst_access_mask: u32,
    pub dependency_flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderPassCreateInfo {
    pub flags: u32,
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderModuleCreateInfo {
    pub flags: u32,
    #[serde(with = "spirv_code")]
    pub code: Vec<u8>,
}

fn default_entry_point() -> String {
    "main".to_owned()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineShaderStage {
    pub stage: u32,
    #[serde(with = "hex_hash")]
    pub module: Hash,
    pub name: String,
}

impl Default for PipelineShaderStage {
    fn default() -> Self {
        Self {
            stage: 0,
            module: 0,
            name: default_entry_point(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexInputAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexInputState {
    pub bindings: Vec<VertexInputBinding>,
    pub attributes: Vec<VertexInputAttribute>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputAssemblyState {
    pub topology: u32,
    pub primitive_restart_enable: bool,
}

fn default_line_width() -> f32 {
    1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterizationState {
    pub depth_clamp_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub polygon_mode: u32,
    pub cull_mode: u32,
    pub front_face: u32,
    pub depth_bias_enable: bool,
    pub line_width: f32,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            depth_clamp_enable: false,
            rasterizer_discard_enable: false,
            polygon_mode: 0,
            cull_mode: 0,
            front_face: 0,
            depth_bias_enable: false,
            line_width: default_line_width(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: u32,
    pub stencil_test_enable: bool,
}

fn default_sample_count() -> u32 {
    1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultisampleState {
    pub rasterization_samples: u32,
    pub sample_shading_enable: bool,
    pub alpha_to_coverage_enable: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            rasterization_samples: default_sample_count(),
            sample_shading_enable: false,
            alpha_to_coverage_enable: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: u32,
    pub dst_color_blend_factor: u32,
    pub color_blend_op: u32,
    pub src_alpha_blend_factor: u32,
    pub dst_alpha_blend_factor: u32,
    pub alpha_blend_op: u32,
    pub color_write_mask: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorBlendState {
    pub logic_op_enable: bool,
    pub logic_op: u32,
    pub attachments: Vec<ColorBlendAttachment>,
    pub blend_constants: [f32; 4],
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicStateInfo {
    pub dynamic_states: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsPipelineCreateInfo {
    pub flags: u32,
    pub stages: Vec<PipelineShaderStage>,
    pub vertex_input: VertexInputState,
    pub input_assembly: InputAssemblyState,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub multisample: MultisampleState,
    pub color_blend: ColorBlendState,
    pub dynamic_state: DynamicStateInfo,
    #[serde(with = "hex_hash")]
    pub layout: Hash,
    #[serde(with = "hex_hash")]
    pub render_pass: Hash,
    pub subpass: u32,
    /// Hash of the base pipeline as captured. Only meaningful when the
    /// `DERIVATIVE` flag is set; rewritten to a live handle only when the
    /// replayer is configured to resolve derivative handles.
    #[serde(with = "hex_hash")]
    pub base_pipeline: Hash,
}

impl GraphicsPipelineCreateInfo {
    pub fn is_derivative(&self) -> bool {
        self.flags & PIPELINE_CREATE_DERIVATIVE != 0
    }

    pub fn allows_derivatives(&self) -> bool {
        self.flags & PIPELINE_CREATE_ALLOW_DERIVATIVES != 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputePipelineCreateInfo {
    pub flags: u32,
    pub stage: PipelineShaderStage,
    #[serde(with = "hex_hash")]
    pub layout: Hash,
    #[serde(with = "hex_hash")]
    pub base_pipeline: Hash,
}

impl ComputePipelineCreateInfo {
    pub fn is_derivative(&self) -> bool {
        self.flags & PIPELINE_CREATE_DERIVATIVE != 0
    }

    pub fn allows_derivatives(&self) -> bool {
        self.flags & PIPELINE_CREATE_ALLOW_DERIVATIVES != 0
    }
}

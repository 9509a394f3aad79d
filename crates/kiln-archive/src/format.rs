use std::fmt;

pub const ARCHIVE_MAGIC: [u8; 8] = *b"KILNARC\0";
pub const TOC_MAGIC: [u8; 8] = *b"KILNTOC\0";
pub const FOOTER_MAGIC: [u8; 8] = *b"KILNFIN\0";

pub const ARCHIVE_HEADER_SIZE: u32 = 24;
pub const ARCHIVE_FOOTER_SIZE: u32 = 32;
pub const ENTRY_HEADER_SIZE: u32 = 20;
pub const TOC_HEADER_SIZE: u32 = 16;
pub const TOC_ENTRY_SIZE: u32 = 32;

pub const FORMAT_VERSION_V1: u32 = 1;
pub const FORMAT_VERSION: u32 = 1;
pub const TOC_VERSION: u32 = 1;

/// 64-bit content hash addressing every replayable object in an archive.
pub type Hash = u64;

/// Entry payload is LZ4 block-compressed; `raw_len` is the decompressed size.
pub const ENTRY_FLAG_LZ4: u8 = 1 << 0;

/// Closed set of object kinds an archive can carry.
///
/// Wire values are stable; new kinds require a format version bump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourceTag {
    AppInfo = 0,
    Sampler = 1,
    DescriptorSetLayout = 2,
    PipelineLayout = 3,
    ShaderModule = 4,
    RenderPass = 5,
    GraphicsPipeline = 6,
    ComputePipeline = 7,
}

impl ResourceTag {
    pub const COUNT: usize = 8;

    pub const ALL: [ResourceTag; Self::COUNT] = [
        ResourceTag::AppInfo,
        ResourceTag::Sampler,
        ResourceTag::DescriptorSetLayout,
        ResourceTag::PipelineLayout,
        ResourceTag::ShaderModule,
        ResourceTag::RenderPass,
        ResourceTag::GraphicsPipeline,
        ResourceTag::ComputePipeline,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AppInfo),
            1 => Some(Self::Sampler),
            2 => Some(Self::DescriptorSetLayout),
            3 => Some(Self::PipelineLayout),
            4 => Some(Self::ShaderModule),
            5 => Some(Self::RenderPass),
            6 => Some(Self::GraphicsPipeline),
            7 => Some(Self::ComputePipeline),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AppInfo => "application info",
            Self::Sampler => "sampler",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::PipelineLayout => "pipeline layout",
            Self::ShaderModule => "shader module",
            Self::RenderPass => "render pass",
            Self::GraphicsPipeline => "graphics pipeline",
            Self::ComputePipeline => "compute pipeline",
        }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub format_version: u32,
    pub flags: u32,
}

impl fmt::Debug for ArchiveHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHeader")
            .field("format_version", &self.format_version)
            .field("flags", &format_args!("0x{:08x}", self.flags))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiveFooter {
    pub format_version: u32,
    pub toc_offset: u64,
    pub toc_len: u64,
}

/// One TOC record. `offset` points at the entry's payload bytes (past the
/// per-entry header), so readers can fetch payloads without re-parsing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TocEntry {
    pub tag: ResourceTag,
    pub flags: u8,
    pub hash: Hash,
    pub offset: u64,
    pub stored_len: u32,
    pub raw_len: u32,
}

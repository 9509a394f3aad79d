//! Driver seam for pipeline replay.
//!
//! The replay core talks to the driver exclusively through [`DriverBackend`]
//! and [`Device`]; handles are opaque 64-bit values. The in-tree
//! [`soft::SoftBackend`] validates structure, mints handles, and can inject
//! faults, which is all the replay engine and supervision protocol need to
//! be exercised end to end.

#![forbid(unsafe_code)]

pub mod device;
pub mod handles;
pub mod pipeline_cache;
pub mod soft;

pub use device::{
    ComputePipelineRefs, Device, DeviceOptions, DeviceProperties, DriverBackend, DriverError,
    DriverResult, GraphicsPipelineRefs,
};
pub use handles::{
    DescriptorSetLayoutHandle, PipelineCacheHandle, PipelineHandle, PipelineLayoutHandle,
    RenderPassHandle, SamplerHandle, ShaderModuleHandle,
};
pub use soft::{SoftBackend, SoftFaults};

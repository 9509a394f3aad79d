//! Opaque driver handles.
//!
//! Handles are 64-bit and `0` is the null handle for every kind, so a handle
//! can round-trip through the shared control block and the object tables
//! without boxing.

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = Self(0);

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

define_handle!(SamplerHandle);
define_handle!(DescriptorSetLayoutHandle);
define_handle!(PipelineLayoutHandle);
define_handle!(RenderPassHandle);
define_handle!(ShaderModuleHandle);
/// Graphics and compute pipelines share one handle space, as drivers do.
define_handle!(PipelineHandle);
define_handle!(PipelineCacheHandle);

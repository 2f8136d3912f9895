#![allow(clippy::missing_safety_doc, clippy::too_many_arguments, clippy::new_without_default)]
// Vulkan hardware ray tracing: acceleration structures and shader binding tables

pub mod vulkan;

pub use vulkan::raytracing::{
    BlasBuilder, BlasHandle, GeometryDescriptor, Instance, MeshBuffers, ShaderBindingTable, TlasBuilder,
};
pub use vulkan::{BuildConfig, RtError, RtResult};

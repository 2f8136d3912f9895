//! Vulkan backend for hardware ray tracing structure builds.
//!
//! The context, memory and command modules provide default implementations of
//! the services the builders in [`raytracing`] depend on.

pub mod error;
pub mod context;
pub mod memory;
pub mod commands;
pub mod descriptors;
pub mod build_config;
pub mod raytracing;

#[cfg(test)]
pub(crate) mod testing;

pub use context::VulkanContext;
pub use error::{RtError, RtResult};
pub use memory::{Buffer, BufferAllocator, MemoryManager};
pub use commands::{CommandExecutor, CommandManager};
pub use descriptors::{RtDescriptorWrite, write_ray_tracing_descriptors, ray_tracing_set_layout_bindings};
pub use build_config::BuildConfig;

use ash::vk;
use std::ffi::CStr;

/// Buffer device address and the KHR ray tracing extensions need Vulkan 1.2.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"vkrt";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"vkrt-accel";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

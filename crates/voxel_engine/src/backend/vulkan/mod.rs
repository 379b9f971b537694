//! Vulkan backend built on `ash` and `vk-mem`
//!
//! [`VulkanInstance`] owns the loader, the instance, the optional debug
//! messenger and the window surface. [`VulkanDevice`] owns the logical device
//! and the memory allocator. The device must be dropped before the instance
//! that created it.

mod commands;
mod device;
mod instance;
mod pipeline;

pub use device::VulkanDevice;
pub use instance::VulkanInstance;

/// Validation layer enabled when validation is requested
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Engine name reported to the driver
pub const ENGINE_NAME: &str = "VoxelEngine";

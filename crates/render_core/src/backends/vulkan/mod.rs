//! # Vulkan Backend
//!
//! Native [`GpuBackend`](crate::render::GpuBackend) built on `ash`, targeting
//! Vulkan 1.3 with dynamic rendering and extended dynamic state.
//!
//! ## Conventions
//!
//! - Every image lives in `GENERAL` layout for its whole lifetime. Encoders are
//!   separated by a full memory barrier, so hazards between passes, copies and
//!   dispatches are covered without per-resource tracking.
//! - The backbuffer is a set of offscreen images sized from the config.
//!   Presenting submits like any other command buffer.
//! - All programs share one descriptor set layout with fixed binding ranges:
//!
//!   | Bindings | Descriptor |
//!   |----------|------------|
//!   | `0..16`  | combined image sampler, one per texture unit |
//!   | `16..32` | uniform texel buffer, `16 + unit` |
//!   | `32..40` | storage buffer, `32 + slot` |
//!   | `40..48` | storage image, `40 + slot` |
//!
//! - Plain uniforms live in one push constant block per program, laid out in
//!   declaration order with std430 packing.
//! - Only SPIR-V stages are accepted; runtime compilation is not available.

mod backend;
mod commands;
mod context;
mod convert;
mod memory;
mod pipeline;
mod sync;

pub use backend::VulkanBackend;
pub use context::VulkanContext;

use ash::vk;
use thiserror::Error;

use crate::render::RenderError;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

impl From<VulkanError> for RenderError {
    fn from(error: VulkanError) -> Self {
        match error {
            VulkanError::Api(vk::Result::ERROR_DEVICE_LOST) => {
                Self::DeviceLost("Vulkan device lost".to_string())
            }
            VulkanError::Api(
                result @ (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            ) => Self::ResourceCreationFailed(format!("{result:?}")),
            VulkanError::OutOfMemory { .. } | VulkanError::NoSuitableMemoryType => {
                Self::ResourceCreationFailed(error.to_string())
            }
            VulkanError::Api(_) | VulkanError::InitializationFailed(_) => {
                Self::BackendError(error.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_maps_to_render_error() {
        let error: RenderError = VulkanError::Api(vk::Result::ERROR_DEVICE_LOST).into();
        assert!(error.is_device_lost());
    }

    #[test]
    fn test_allocation_failures_are_creation_failures() {
        let error: RenderError = VulkanError::OutOfMemory { requested: 64 }.into();
        assert!(matches!(error, RenderError::ResourceCreationFailed(_)));
        let error: RenderError = VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).into();
        assert!(matches!(error, RenderError::ResourceCreationFailed(_)));
    }
}

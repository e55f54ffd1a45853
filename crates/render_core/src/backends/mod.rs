//! Implementations of [`GpuBackend`](crate::render::GpuBackend)

pub mod headless;

#[cfg(feature = "vulkan")]
#[allow(unsafe_code)]
pub mod vulkan;

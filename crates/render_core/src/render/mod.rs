//! # Rendering Core
//!
//! Backend-agnostic GPU command submission and resource lifecycle management.
//!
//! ## Architecture
//!
//! ```text
//! Graphics<B>
//!  ├── CommandStream         one open command buffer, one active encoder
//!  ├── DirtyStateTracker     logical state, applied lazily at draw time
//!  ├── StateObjectCache      deduplicated samplers / depth-stencil objects
//!  ├── Shader                uniform table + texture/buffer binding slots
//!  ├── Buffer / Texture      map, fill, copy, upload via staging
//!  └── DeferredQueue         destruction gated on GPU completion
//!                │
//!                ▼
//!          B: GpuBackend     headless simulation or native Vulkan
//! ```
//!
//! All work is tagged with a monotonically increasing command buffer index.
//! A resource released while the GPU may still read it is queued for cleanup
//! at the index of the command buffer that will be submitted next, and only
//! destroyed once the backend reports that index complete.

pub mod backend;
pub mod commands;
pub mod graphics;
pub mod resources;
pub mod shader;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use backend::{
    AttachmentStoreActions, Backbuffer, BufferId, CommandBufferId, DepthStencilId, EncoderId,
    EncoderKind, GpuBackend, ProgramId, SamplerId, StoreAction, SubmitMode, TextureId,
};
pub use graphics::{ColorTarget, Graphics, GraphicsStats, RenderTargets, ShaderId};
pub use types::*;

use thiserror::Error;

/// Errors surfaced by the rendering core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The device was lost; every resource is invalid and a new instance is required
    ///
    /// Once reported, all pending cleanup has been drained and every further
    /// operation on the same [`Graphics`] fails with this error.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// An operation was refused because of the target resource's state or settings
    ///
    /// Examples: mapping a zero-size range, filling an immutable buffer, reading
    /// back from a buffer that was not created for readback. Recording continues.
    #[error("Invalid resource state: {0}")]
    InvalidResourceState(String),

    /// Shader program failed to link; the program is unusable
    #[error("Shader '{shader}' failed to link: {log}")]
    LinkFailure {
        /// Shader label
        shader: String,
        /// Compiler/linker log
        log: String,
    },

    /// The backend reported an active uniform or block the shader never declared
    #[error("Unknown binding '{0}' reported by shader reflection")]
    UnknownBinding(String),

    /// Resource creation or management failed
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// Backend-specific error occurred
    #[error("Backend error: {0}")]
    BackendError(String),
}

impl RenderError {
    /// Whether this error means the device is gone
    pub const fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;

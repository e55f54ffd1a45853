//! # Render Core
//!
//! Backend-agnostic GPU command submission and resource lifecycle engine.
//!
//! ## Features
//!
//! - **Command Streams**: one open command buffer, lazily switched render/blit/compute encoders
//! - **Lazy State**: dirty-tracked render state applied once per category per draw
//! - **State Object Caching**: samplers and depth/stencil objects deduplicated by content
//! - **Binding Tables**: reflection-driven uniform and resource slots per shader
//! - **Deferred Destruction**: resources freed only after the GPU is done with them
//! - **Backends**: an in-process headless simulation, and Vulkan behind the `vulkan` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GraphicsConfig::new("quick start");
//!     let backend = HeadlessBackend::new(HeadlessOptions::from_config(&config));
//!     let mut graphics = Graphics::new(backend, config)?;
//!
//!     let buffer = graphics.new_buffer(256, BufferSettings::new(BufferUsageFlags::VERTEX), None)?;
//!     graphics.fill_buffer(buffer, 64, &[1, 2, 3, 4])?;
//!     graphics.present()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod backends;
pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for library users
pub mod prelude {
    pub use crate::{
        backends::headless::{CompletionMode, HeadlessBackend, HeadlessOptions},
        config::{Config, ConfigError},
        core::{BackbufferConfig, BackendKind, GraphicsConfig},
        render::{
            resources::{BufferDataUsage, BufferSettings, MapType, ReadbackId, ReadbackStatus, TextureSettings},
            shader::{ShaderReflection, ShaderStage, UniformDecl, UniformValues},
            Color, ColorTarget, GpuBackend, Graphics, GraphicsStats, RenderError, RenderResult,
            RenderTargets, Rect, ShaderId,
        },
        render::types::{BufferUsageFlags, PixelFormat, TextureType},
    };
}

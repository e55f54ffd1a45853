//! Frame demo
//!
//! Drives a few frames through [`Graphics`] on the backend named in the
//! config file: offscreen clears and draws, buffer fills, a texture readback,
//! then a clean shutdown with the collected stats logged.
//!
//! ```text
//! cargo run -p demo_app -- demo_app/frame_demo.toml
//! cargo run -p demo_app --features vulkan -- my_vulkan_config.toml
//! ```

use std::path::Path;

use log::{debug, info, warn};
use nalgebra::{Matrix4, Vector3};
use render_core::foundation::logging;
use render_core::prelude::*;
use render_core::render::backend::{DrawCommand, ShaderCode, ShaderStageSource};
use thiserror::Error;

const FRAMES: u32 = 3;
const TARGET_SIZE: u32 = 64;

#[derive(Error, Debug)]
enum DemoError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend '{0}' is not compiled in")]
    BackendUnavailable(&'static str),
}

fn main() {
    if let Err(e) = run() {
        log::error!("Frame demo failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let path = std::env::args().nth(1).unwrap_or_else(|| "demo_app/frame_demo.toml".to_string());
    let config = GraphicsConfig::load_or_default(&path)?;
    logging::init_with_level(&config.log_level);
    config.validate().map_err(DemoError::InvalidConfig)?;

    info!("Starting frame demo on the {:?} backend", config.backend);
    match config.backend {
        BackendKind::Headless => {
            let backend = HeadlessBackend::new(HeadlessOptions::from_config(&config));
            drive(Graphics::new(backend, config)?)
        }
        BackendKind::Vulkan => run_vulkan(config),
    }
}

#[cfg(feature = "vulkan")]
fn run_vulkan(config: GraphicsConfig) -> Result<(), DemoError> {
    let backend = render_core::backends::vulkan::VulkanBackend::new(&config)?;
    drive(Graphics::new(backend, config)?)
}

#[cfg(not(feature = "vulkan"))]
fn run_vulkan(_config: GraphicsConfig) -> Result<(), DemoError> {
    Err(DemoError::BackendUnavailable("vulkan"))
}

/// SPIR-V from `path` when present, else a source stub for backends that accept text
fn stage_code(path: &str) -> ShaderCode {
    match std::fs::read(Path::new(path)) {
        Ok(bytes) if bytes.len() % 4 == 0 => ShaderCode::Spirv(
            bytes
                .chunks_exact(4)
                .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
                .collect(),
        ),
        _ => ShaderCode::Source("void main() {}".to_string()),
    }
}

fn triangle_shader<B: GpuBackend>(graphics: &mut Graphics<B>) -> Result<Option<ShaderId>, DemoError> {
    let stages = [
        ShaderStageSource::new(ShaderStage::Vertex, stage_code("demo_app/shaders/triangle.vert.spv")),
        ShaderStageSource::new(ShaderStage::Pixel, stage_code("demo_app/shaders/triangle.frag.spv")),
    ];
    let reflection = ShaderReflection::new()
        .with(UniformDecl::matrix("TransformMatrix", 4, 4))
        .with(UniformDecl::float("ConstantColor", 4));

    match graphics.new_shader("triangle", &stages, &reflection) {
        Ok(shader) => Ok(Some(shader)),
        Err(RenderError::LinkFailure { log, .. }) => {
            warn!("Triangle shader unavailable, frames will only clear: {log}");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn drive<B: GpuBackend>(mut graphics: Graphics<B>) -> Result<(), DemoError> {
    let target = graphics.new_texture(
        TextureSettings::new_2d(TARGET_SIZE, TARGET_SIZE, PixelFormat::Rgba8Unorm)
            .render_target(1)
            .with_label("offscreen"),
        None,
    )?;
    let particles = graphics.new_buffer(
        u64::from(FRAMES) * 16,
        BufferSettings::new(BufferUsageFlags::SHADER_STORAGE)
            .with_zero_initialize(true)
            .with_label("particles"),
        None,
    )?;
    let shader = triangle_shader(&mut graphics)?;

    for frame in 0..FRAMES {
        let t = frame as f32 / FRAMES as f32;

        graphics.set_render_targets(RenderTargets {
            colors: vec![ColorTarget::new(target)],
            depth_stencil: None,
        })?;
        graphics.clear(&[Some(Color::new(t, 0.2, 1.0 - t, 1.0))], None, None)?;
        if let Some(shader) = shader {
            graphics.set_shader(shader)?;
            graphics.set_transform(Matrix4::new_rotation(Vector3::new(0.0, 0.0, t)));
            graphics.set_color(Color::WHITE);
            graphics.draw(&DrawCommand {
                vertex_count: 3,
                instance_count: 1,
                ..DrawCommand::default()
            })?;
        }
        graphics.reset_render_targets()?;
        graphics.clear(&[Some(Color::new(0.0, 0.0, 0.0, 1.0))], Some(1.0), Some(0))?;

        graphics.fill_buffer(particles, u64::from(frame) * 16, &[frame as u8; 16])?;

        let index = graphics.present()?;
        let completed = graphics.poll()?;
        debug!("Frame {} submitted as #{}, completed through #{}", frame, index, completed);
    }

    let readback = graphics.readback_texture(target, Rect::new(0, 0, 1, 1), 0, 0)?;
    graphics.flush()?;
    let pixel = loop {
        match graphics.readback_status(readback)? {
            ReadbackStatus::Complete(bytes) => break bytes,
            ReadbackStatus::Pending => {
                graphics.poll()?;
                std::thread::yield_now();
            }
        }
    };
    info!("Offscreen top-left pixel after {} frames: {:?}", FRAMES, pixel);

    if let Some(shader) = shader {
        graphics.release_shader(shader)?;
    }
    graphics.release_buffer(particles)?;
    graphics.release_texture(target)?;

    let stats = graphics.stats();
    info!(
        "{} draws, {} encoders, {} state applications, samplers {}/{} hit/miss, {} cleanups run",
        stats.draw_calls,
        stats.encoder_transitions,
        stats.state_applications,
        stats.sampler_cache.hits,
        stats.sampler_cache.misses,
        stats.executed_cleanups
    );

    graphics.shutdown()?;
    Ok(())
}

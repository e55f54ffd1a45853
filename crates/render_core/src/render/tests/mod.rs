//! Frame-level scenarios driving [`Graphics`] over the headless backend

mod frame_scenarios;
mod resource_lifetimes;

use crate::backends::headless::{CompletionMode, HeadlessBackend, HeadlessOptions};
use crate::core::GraphicsConfig;
use crate::render::backend::{DrawCommand, ShaderCode, ShaderStageSource};
use crate::render::shader::ShaderStage;
use crate::render::Graphics;

/// Graphics over a headless backend, with the default resources uploaded and the call log empty
fn graphics_with(options: HeadlessOptions) -> Graphics<HeadlessBackend> {
    let config = GraphicsConfig::new("scenario");
    let mut graphics = Graphics::new(HeadlessBackend::new(options), config).expect("graphics should initialize");
    graphics.flush().expect("initial uploads should submit");
    graphics.backend_mut().retire_all();
    graphics.poll().expect("poll should succeed");
    graphics.backend_mut().clear_calls();
    graphics
}

fn graphics() -> Graphics<HeadlessBackend> {
    graphics_with(HeadlessOptions::default())
}

/// Command buffers only complete when the test retires them
fn manual_graphics() -> Graphics<HeadlessBackend> {
    graphics_with(HeadlessOptions {
        completion: CompletionMode::Manual,
        ..HeadlessOptions::default()
    })
}

fn render_stages() -> Vec<ShaderStageSource> {
    vec![
        ShaderStageSource::new(ShaderStage::Vertex, ShaderCode::Source("void main() {}".to_string())),
        ShaderStageSource::new(ShaderStage::Pixel, ShaderCode::Source("void main() {}".to_string())),
    ]
}

fn compute_stages() -> Vec<ShaderStageSource> {
    vec![ShaderStageSource::new(
        ShaderStage::Compute,
        ShaderCode::Source("void main() {}".to_string()),
    )]
}

fn triangle() -> DrawCommand {
    DrawCommand {
        vertex_count: 3,
        instance_count: 1,
        ..DrawCommand::default()
    }
}

fn float_words(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}

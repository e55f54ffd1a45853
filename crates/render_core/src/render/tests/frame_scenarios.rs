//! Draws, dispatches, state application, encoders, clears and shader interfaces

use approx::assert_relative_eq;
use nalgebra::Matrix4;

use super::{compute_stages, float_words, graphics, graphics_with, render_stages, triangle};
use crate::backends::headless::{BackendCall, HeadlessOptions};
use crate::core::BackbufferConfig;
use crate::render::backend::{EncoderKind, SamplerDescriptor, ShaderCode, ShaderStageSource};
use crate::render::resources::{BufferSettings, ReadbackStatus, TextureSettings};
use crate::render::shader::{ShaderReflection, ShaderStage, UniformDecl, UniformValues};
use crate::render::types::{
    BlendState, BufferUsageFlags, Color, FilterMode, PixelFormat, Rect, TextureType, Viewport,
};
use crate::render::{ColorTarget, GpuBackend, RenderError, RenderTargets};

#[cfg(test)]
mod tests {
    use super::*;

    fn begins(calls: &[BackendCall], kind: EncoderKind) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, BackendCall::BeginEncoder { kind: k } if *k == kind))
            .count()
    }

    #[test]
    fn test_state_applied_once_per_category() {
        let mut graphics = graphics();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.set_blend_state(BlendState::alpha_premultiplied());

        graphics.draw(&triangle()).unwrap();
        graphics.draw(&triangle()).unwrap();

        let backend = graphics.backend();
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetBlend(_))), 1);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetViewport(_))), 1);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::BindProgram(_))), 1);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::Draw { .. })), 2);

        graphics.set_blend_state(BlendState::replace());
        graphics.draw(&triangle()).unwrap();

        let backend = graphics.backend();
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetBlend(_))), 2);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetViewport(_))), 1);
        assert_eq!(graphics.stats().draw_calls, 3);
    }

    #[test]
    fn test_viewport_starts_at_backbuffer_size() {
        let mut graphics = graphics();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();

        let viewport = graphics.backend().calls().iter().find_map(|c| match c {
            BackendCall::SetViewport(v) => Some(*v),
            _ => None,
        });
        assert_eq!(viewport, Some(Viewport::from_size(64, 64)));
    }

    #[test]
    fn test_new_pass_reapplies_all_state() {
        let mut graphics = graphics();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();
        graphics.present().unwrap();
        graphics.draw(&triangle()).unwrap();

        let backend = graphics.backend();
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetBlend(_))), 2);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::BindProgram(_))), 2);
    }

    #[test]
    fn test_encoder_reused_until_kind_changes() {
        let mut graphics = graphics();
        let a = graphics
            .new_buffer(16, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        let b = graphics
            .new_buffer(16, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.flush().unwrap();
        graphics.backend_mut().clear_calls();

        graphics.fill_buffer(a, 0, &[1; 8]).unwrap();
        graphics.fill_buffer(b, 0, &[2; 8]).unwrap();
        assert_eq!(begins(graphics.backend().calls(), EncoderKind::Blit), 1);

        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();
        graphics.draw(&triangle()).unwrap();
        let calls = graphics.backend().calls();
        assert_eq!(begins(calls, EncoderKind::Render), 1);
        assert!(calls.contains(&BackendCall::EndEncoder {
            kind: EncoderKind::Blit,
            store: None,
        }));

        graphics.fill_buffer(a, 8, &[3; 8]).unwrap();
        assert_eq!(begins(graphics.backend().calls(), EncoderKind::Blit), 2);
    }

    #[test]
    fn test_queued_uniform_applies_on_attach() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new().with(UniformDecl::float("Tint", 4));
        let first = graphics.new_shader("first", &render_stages(), &reflection).unwrap();
        let second = graphics.new_shader("second", &render_stages(), &reflection).unwrap();
        graphics.set_shader(second).unwrap();
        graphics.backend_mut().clear_calls();

        let tint = graphics.uniform_id(first, "Tint").unwrap();
        let values = [1.0, 0.5, 0.25, 1.0];
        graphics.send_uniform(first, tint, UniformValues::Float(&values)).unwrap();

        assert_eq!(
            graphics
                .backend()
                .count_calls(|c| matches!(c, BackendCall::SetUniform { .. })),
            0
        );
        assert_eq!(graphics.shader(first).unwrap().pending_update_count(), 1);

        graphics.set_shader(first).unwrap();

        let shader = graphics.shader(first).unwrap();
        let location = shader.uniform(tint).unwrap().location;
        let expected = float_words(&values);
        assert_eq!(
            graphics.backend().uniform_value(shader.program(), location),
            Some(expected.as_slice())
        );
        assert_eq!(shader.pending_update_count(), 0);
    }

    #[test]
    fn test_current_shader_uniform_uploads_immediately() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new().with(UniformDecl::int("Mode", 1));
        let shader = graphics.new_shader("modes", &render_stages(), &reflection).unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.backend_mut().clear_calls();

        let mode = graphics.uniform_id(shader, "Mode").unwrap();
        graphics.send_uniform(shader, mode, UniformValues::Int(&[3])).unwrap();

        assert_eq!(
            graphics
                .backend()
                .count_calls(|c| matches!(c, BackendCall::SetUniform { .. })),
            1
        );
        let result = graphics.send_uniform(shader, mode, UniformValues::Float(&[1.0]));
        assert!(matches!(result, Err(RenderError::InvalidResourceState(_))));
    }

    #[test]
    fn test_stripped_uniform_is_inactive() {
        let mut graphics = graphics();
        graphics.backend_mut().strip_uniform("Tint");
        let reflection = ShaderReflection::new().with(UniformDecl::float("Tint", 4));
        let shader = graphics.new_shader("stripped", &render_stages(), &reflection).unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.backend_mut().clear_calls();

        let tint = graphics.uniform_id(shader, "Tint").unwrap();
        assert!(!graphics.shader(shader).unwrap().uniform(tint).unwrap().active);
        graphics
            .send_uniform(shader, tint, UniformValues::Float(&[1.0; 4]))
            .unwrap();
        assert!(graphics.backend().calls().is_empty());
    }

    #[test]
    fn test_screen_size_follows_render_target() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new().with(UniformDecl::float("ScreenSize", 4));
        let shader = graphics.new_shader("screen", &render_stages(), &reflection).unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();

        let program = graphics.shader(shader).unwrap().program();
        let id = graphics.uniform_id(shader, "ScreenSize").unwrap();
        let location = graphics.shader(shader).unwrap().uniform(id).unwrap().location;
        let backbuffer = float_words(&[64.0, 64.0, 1.0, 0.0]);
        assert_eq!(graphics.backend().uniform_value(program, location), Some(backbuffer.as_slice()));

        let target = graphics
            .new_texture(TextureSettings::new_2d(32, 16, PixelFormat::Rgba8Unorm).render_target(1), None)
            .unwrap();
        graphics
            .set_render_targets(RenderTargets {
                colors: vec![ColorTarget::new(target)],
                depth_stencil: None,
            })
            .unwrap();
        graphics.draw(&triangle()).unwrap();

        let flipped = float_words(&[32.0, 16.0, -1.0, 16.0]);
        assert_eq!(graphics.backend().uniform_value(program, location), Some(flipped.as_slice()));
    }

    #[test]
    fn test_transform_and_normal_matrix_uploaded() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new()
            .with(UniformDecl::matrix("TransformMatrix", 4, 4))
            .with(UniformDecl::matrix("NormalMatrix", 3, 3));
        let shader = graphics.new_shader("lit", &render_stages(), &reflection).unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.set_transform(Matrix4::new_scaling(2.0));
        graphics.draw(&triangle()).unwrap();

        let compiled = graphics.shader(shader).unwrap();
        let location = |name: &str| {
            let id = compiled.uniform_id(name).unwrap();
            compiled.uniform(id).unwrap().location
        };
        let read = |name: &str| -> Vec<f32> {
            graphics
                .backend()
                .uniform_value(compiled.program(), location(name))
                .unwrap()
                .iter()
                .map(|w| f32::from_bits(*w))
                .collect()
        };

        let transform = read("TransformMatrix");
        assert_relative_eq!(transform[0], 2.0);
        assert_relative_eq!(transform[5], 2.0);
        assert_relative_eq!(transform[15], 1.0);

        let normal = read("NormalMatrix");
        assert_eq!(normal.len(), 9);
        assert_relative_eq!(normal[0], 0.5);
        assert_relative_eq!(normal[4], 0.5);
        assert_relative_eq!(normal[8], 0.5);
        assert_relative_eq!(normal[1], 0.0);
    }

    #[test]
    fn test_draw_refused_without_graphics_shader() {
        let mut graphics = graphics();
        let result = graphics.draw(&triangle());
        assert!(matches!(result, Err(RenderError::InvalidResourceState(_))));

        let compute = graphics
            .new_shader("blur", &compute_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(compute).unwrap();
        let result = graphics.draw(&triangle());
        assert!(matches!(result, Err(RenderError::InvalidResourceState(_))));

        assert_eq!(begins(graphics.backend().calls(), EncoderKind::Render), 0);
    }

    #[test]
    fn test_zero_count_draw_records_nothing() {
        let mut graphics = graphics();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.backend_mut().clear_calls();

        let mut empty = triangle();
        empty.instance_count = 0;
        graphics.draw(&empty).unwrap();

        assert!(graphics.backend().calls().is_empty());
        assert_eq!(graphics.stats().draw_calls, 0);
    }

    #[test]
    fn test_dispatch_binds_program_once_per_encoder() {
        let mut graphics = graphics();
        let compute = graphics
            .new_shader("blur", &compute_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(compute).unwrap();

        graphics.dispatch([0, 4, 1]).unwrap();
        assert_eq!(begins(graphics.backend().calls(), EncoderKind::Compute), 0);

        graphics.dispatch([4, 1, 1]).unwrap();
        graphics.dispatch([2, 2, 1]).unwrap();

        let backend = graphics.backend();
        assert_eq!(begins(backend.calls(), EncoderKind::Compute), 1);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::BindProgram(_))), 1);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::Dispatch(_))), 2);
        assert_eq!(graphics.stats().dispatches, 2);

        let flat = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(flat).unwrap();
        assert!(matches!(
            graphics.dispatch([1, 1, 1]),
            Err(RenderError::InvalidResourceState(_))
        ));
    }

    #[test]
    fn test_clear_reaches_resolved_msaa_backbuffer() {
        let mut graphics = graphics_with(HeadlessOptions {
            backbuffer: BackbufferConfig {
                width: 8,
                height: 8,
                msaa: 4,
                depth_stencil: true,
            },
            ..HeadlessOptions::default()
        });

        graphics
            .clear(&[Some(Color::new(1.0, 0.0, 0.0, 1.0))], Some(1.0), Some(0))
            .unwrap();
        graphics.present().unwrap();

        let backbuffer = graphics.backend().backbuffer();
        assert!(backbuffer.msaa_color.is_some());
        let pixels = graphics.backend().texture_contents(backbuffer.color).unwrap();
        assert_eq!(pixels.len(), 8 * 8 * 4);
        assert!(pixels.chunks_exact(4).all(|p| p == [255, 0, 0, 255]));
        assert!(graphics.backend().hazards().is_empty());
    }

    #[test]
    fn test_clear_inside_pass_records_attachment_clear() {
        let mut graphics = graphics();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();

        graphics.clear(&[Some(Color::WHITE)], None, None).unwrap();

        assert_eq!(
            graphics
                .backend()
                .count_calls(|c| matches!(c, BackendCall::ClearAttachments)),
            1
        );
    }

    #[test]
    fn test_discard_requires_open_pass() {
        let mut graphics = graphics();
        assert!(!graphics.discard(&[true], true));

        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        graphics.draw(&triangle()).unwrap();
        assert!(graphics.discard(&[true], true));
    }

    #[test]
    fn test_render_target_clear_reads_back() {
        let mut graphics = graphics();
        let target = graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm).render_target(1), None)
            .unwrap();
        graphics
            .set_render_targets(RenderTargets {
                colors: vec![ColorTarget::new(target)],
                depth_stencil: None,
            })
            .unwrap();
        graphics
            .clear(&[Some(Color::new(0.0, 1.0, 0.0, 1.0))], None, None)
            .unwrap();
        graphics.reset_render_targets().unwrap();
        assert!(graphics.render_targets().is_none());

        let readback = graphics.readback_texture(target, Rect::new(0, 0, 4, 4), 0, 0).unwrap();
        graphics.flush().unwrap();

        match graphics.readback_status(readback).unwrap() {
            ReadbackStatus::Complete(pixels) => {
                assert_eq!(pixels.len(), 64);
                assert!(pixels.chunks_exact(4).all(|p| p == [0, 255, 0, 255]));
            }
            ReadbackStatus::Pending => panic!("readback should have completed"),
        }
    }

    #[test]
    fn test_render_target_validation() {
        let mut graphics = graphics();
        let plain = graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let small = graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm).render_target(1), None)
            .unwrap();
        let large_depth = graphics
            .new_texture(TextureSettings::new_2d(8, 8, PixelFormat::Depth24Stencil8).render_target(1), None)
            .unwrap();

        let refused = |result: Result<(), RenderError>| matches!(result, Err(RenderError::InvalidResourceState(_)));

        assert!(refused(graphics.set_render_targets(RenderTargets {
            colors: vec![ColorTarget::new(plain)],
            depth_stencil: None,
        })));
        assert!(refused(graphics.set_render_targets(RenderTargets {
            colors: vec![ColorTarget::new(small)],
            depth_stencil: Some(large_depth),
        })));
        assert!(refused(graphics.set_render_targets(RenderTargets {
            colors: vec![ColorTarget::new(large_depth)],
            depth_stencil: None,
        })));
        assert!(refused(graphics.set_render_targets(RenderTargets::default())));
        assert!(graphics.render_targets().is_none());
    }

    #[test]
    fn test_sampler_cache_shares_identical_descriptors() {
        let mut graphics = graphics();
        let before = graphics.stats().sampler_cache;

        let a = graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let b = graphics
            .new_texture(TextureSettings::new_2d(2, 2, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        assert_eq!(
            graphics.texture(a).unwrap().sampler(),
            graphics.texture(b).unwrap().sampler()
        );

        let nearest = SamplerDescriptor {
            min_filter: FilterMode::Nearest,
            mag_filter: FilterMode::Nearest,
            ..SamplerDescriptor::default()
        };
        let c = graphics
            .new_texture(
                TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm).with_sampler(nearest),
                None,
            )
            .unwrap();
        assert_ne!(
            graphics.texture(a).unwrap().sampler(),
            graphics.texture(c).unwrap().sampler()
        );

        let after = graphics.stats().sampler_cache;
        assert_eq!(after.hits, before.hits + 2);
        assert_eq!(after.misses, before.misses + 1);
        assert_eq!(
            graphics
                .backend()
                .count_calls(|c| matches!(c, BackendCall::CreateSampler(_))),
            1
        );
    }

    #[test]
    fn test_link_failure_reported() {
        let mut graphics = graphics();
        let stages = [ShaderStageSource::new(
            ShaderStage::Pixel,
            ShaderCode::Source("#error missing entry point".to_string()),
        )];

        match graphics.new_shader("broken", &stages, &ShaderReflection::new()) {
            Err(RenderError::LinkFailure { shader, log }) => {
                assert_eq!(shader, "broken");
                assert!(log.contains("missing entry point"));
            }
            other => panic!("expected a link failure, got {other:?}"),
        }
        assert!(!graphics.is_device_lost());
    }

    #[test]
    fn test_unknown_binding_recorded() {
        let mut graphics = graphics();
        graphics.backend_mut().inject_uniform("Mystery");
        let reflection = ShaderReflection::new().with(UniformDecl::sampler("MainTex", TextureType::Tex2D));

        let shader = graphics.new_shader("surprise", &render_stages(), &reflection).unwrap();

        let compiled = graphics.shader(shader).unwrap();
        assert_eq!(compiled.unknown_bindings(), ["Mystery".to_string()]);
        assert!(compiled.uniform_id("Mystery").is_none());
    }
}

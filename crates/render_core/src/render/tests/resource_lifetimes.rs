//! Staging, mapping, readback, deferred release, device loss and shutdown

use super::{graphics, manual_graphics, render_stages};
use crate::backends::headless::BackendCall;
use crate::render::backend::{BufferId, GpuBackend, MemoryLocation, UnitBinding};
use crate::render::resources::{BufferDataUsage, BufferSettings, MapType, ReadbackStatus, TextureSettings};
use crate::render::shader::{ShaderReflection, UniformDecl};
use crate::render::types::{BufferUsageFlags, PixelFormat, Rect, TextureType};
use crate::render::{ColorTarget, RenderError, RenderTargets};

#[cfg(test)]
mod tests {
    use super::*;

    fn last_upload_staging(calls: &[BackendCall]) -> Option<BufferId> {
        calls.iter().rev().find_map(|c| match c {
            BackendCall::CreateBuffer {
                id,
                location: MemoryLocation::HostUpload,
                ..
            } => Some(*id),
            _ => None,
        })
    }

    fn refused<T>(result: Result<T, RenderError>) -> bool {
        matches!(result, Err(RenderError::InvalidResourceState(_)))
    }

    #[test]
    fn test_fill_releases_staging_after_completion() {
        let mut graphics = manual_graphics();
        let buffer = graphics
            .new_buffer(256, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        graphics.fill_buffer(buffer, 0, &[0; 256]).unwrap();
        graphics.fill_buffer(buffer, 64, &[1, 2, 3, 4]).unwrap();

        let staging = last_upload_staging(graphics.backend().calls()).expect("fill should stage its data");
        assert!(graphics.backend().buffer_alive(staging));

        let index = graphics.present().unwrap();
        assert!(graphics.backend().buffer_alive(staging));
        assert_eq!(&graphics.backend().buffer_contents(buffer).unwrap()[64..68], &[0, 0, 0, 0]);
        assert_eq!(graphics.stats().pending_cleanups, 2);

        graphics.backend_mut().retire_through(index);
        assert_eq!(graphics.poll().unwrap(), index);

        assert!(!graphics.backend().buffer_alive(staging));
        let contents = graphics.backend().buffer_contents(buffer).unwrap();
        assert_eq!(&contents[64..68], &[1, 2, 3, 4]);
        assert!(contents[..64].iter().chain(&contents[68..]).all(|&b| b == 0));
        assert_eq!(contents.len(), 256);
        assert_eq!(graphics.stats().pending_cleanups, 0);
        assert!(graphics.backend().hazards().is_empty());
    }

    #[test]
    fn test_staging_not_leaked_when_command_buffer_fails() {
        let mut graphics = manual_graphics();
        let buffer = graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        graphics.flush().unwrap();
        graphics.backend_mut().clear_calls();

        graphics.backend_mut().refuse_command_buffers();
        let error = graphics.fill_buffer(buffer, 0, &[7; 16]).unwrap_err();
        assert!(error.is_device_lost());

        let staging = last_upload_staging(graphics.backend().calls()).expect("fill should stage its data");
        assert!(!graphics.backend().buffer_alive(staging));
        assert_eq!(graphics.stats().pending_cleanups, 0);
        assert!(graphics.backend().hazards().is_empty());
    }

    #[test]
    fn test_readback_staging_not_leaked_when_command_buffer_fails() {
        let mut graphics = manual_graphics();
        let buffer = graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        graphics.flush().unwrap();
        graphics.backend_mut().clear_calls();

        graphics.backend_mut().refuse_command_buffers();
        assert!(graphics.readback_buffer(buffer, 0, 16).unwrap_err().is_device_lost());

        let staging = graphics
            .backend()
            .calls()
            .iter()
            .find_map(|c| match c {
                BackendCall::CreateBuffer {
                    id,
                    location: MemoryLocation::HostReadback,
                    ..
                } => Some(*id),
                _ => None,
            })
            .expect("readback should create staging memory");
        assert!(!graphics.backend().buffer_alive(staging));
        assert!(graphics.backend().hazards().is_empty());
    }

    #[test]
    fn test_release_waits_for_gpu() {
        let mut graphics = manual_graphics();
        let buffer = graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();

        graphics.release_buffer(buffer).unwrap();
        assert!(graphics.buffer(buffer).is_none());
        assert!(graphics.backend().buffer_alive(buffer));

        graphics.present().unwrap();
        assert!(graphics.backend().buffer_alive(buffer));

        graphics.backend_mut().retire_all();
        graphics.poll().unwrap();
        assert!(!graphics.backend().buffer_alive(buffer));
        assert!(graphics.stats().executed_cleanups >= 1);
        assert!(refused(graphics.release_buffer(buffer)));
    }

    #[test]
    fn test_defaults_cannot_be_released() {
        let mut graphics = graphics();
        let texture = graphics.default_resources().texture(TextureType::Cube).id;
        let buffer = graphics.default_resources().storage_buffer().id;

        assert!(refused(graphics.release_texture(texture)));
        assert!(refused(graphics.release_buffer(buffer)));
        assert!(graphics.backend().texture_alive(texture));
    }

    #[test]
    fn test_map_refusals() {
        let mut graphics = graphics();
        let vertex = graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        let frozen = graphics
            .new_buffer(16, BufferSettings::new(BufferUsageFlags::VERTEX).immutable(), Some(&[9; 16]))
            .unwrap();

        assert!(refused(graphics.map_buffer(vertex, MapType::WriteInvalidate, 0, 0)));
        assert!(refused(graphics.map_buffer(vertex, MapType::ReadOnly, 0, 16)));
        assert!(refused(graphics.map_buffer(vertex, MapType::WriteInvalidate, 60, 8)));
        assert!(refused(graphics.map_buffer(frozen, MapType::WriteInvalidate, 0, 4)));
        assert!(refused(graphics.fill_buffer(frozen, 0, &[1])));
        assert!(refused(graphics.fill_buffer(vertex, 0, &[])));

        graphics.map_buffer(vertex, MapType::WriteInvalidate, 0, 16).unwrap();
        assert!(refused(graphics.map_buffer(vertex, MapType::WriteInvalidate, 16, 16)));
        graphics.unmap_buffer(vertex, 0, 0).unwrap();
        assert!(refused(graphics.unmap_buffer(vertex, 0, 0)));
        assert!(!graphics.is_device_lost());
    }

    #[test]
    fn test_map_commits_only_used_range() {
        let mut graphics = graphics();
        let buffer = graphics
            .new_buffer(32, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();

        let bytes = graphics.map_buffer(buffer, MapType::WriteInvalidate, 8, 8).unwrap();
        assert_eq!(bytes.len(), 8);
        bytes.copy_from_slice(&[7; 8]);
        graphics.unmap_buffer(buffer, 8, 4).unwrap();
        graphics.flush().unwrap();

        let contents = graphics.backend().buffer_contents(buffer).unwrap();
        assert_eq!(&contents[8..12], &[7; 4]);
        assert_eq!(&contents[12..16], &[0; 4]);
    }

    #[test]
    fn test_readback_round_trip() {
        let mut graphics = graphics();
        let data: Vec<u8> = (0..16).collect();
        let buffer = graphics
            .new_buffer(16, BufferSettings::new(BufferUsageFlags::VERTEX), Some(&data))
            .unwrap();

        let readback = graphics.readback_buffer(buffer, 4, 8).unwrap();
        assert_eq!(graphics.readback_status(readback).unwrap(), ReadbackStatus::Pending);

        graphics.flush().unwrap();
        assert_eq!(
            graphics.readback_status(readback).unwrap(),
            ReadbackStatus::Complete((4..12).collect())
        );
        assert!(refused(graphics.readback_status(readback)));
        assert!(refused(graphics.readback_buffer(buffer, 12, 8)));
    }

    #[test]
    fn test_readback_buffer_maps_for_read() {
        let mut graphics = graphics();
        let source = graphics
            .new_buffer(8, BufferSettings::new(BufferUsageFlags::VERTEX), Some(&[5; 8]))
            .unwrap();
        let target = graphics
            .new_buffer(
                8,
                BufferSettings::new(BufferUsageFlags::COPY_DEST).with_data_usage(BufferDataUsage::Readback),
                None,
            )
            .unwrap();

        graphics.copy_buffer(source, target, 0, 0, 8).unwrap();
        graphics.flush().unwrap();

        let bytes = graphics.map_buffer(target, MapType::ReadOnly, 0, 8).unwrap();
        assert_eq!(bytes, &[5; 8]);
        graphics.unmap_buffer(target, 0, 8).unwrap();
        assert!(refused(graphics.fill_buffer(target, 0, &[1])));
    }

    #[test]
    fn test_texture_pixels_round_trip() {
        let mut graphics = graphics();
        let texture = graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let pixels: Vec<u8> = (0..16).collect();

        graphics
            .replace_pixels(texture, &pixels, Rect::new(1, 1, 2, 2), 0, 0)
            .unwrap();
        assert!(refused(graphics.replace_pixels(texture, &pixels, Rect::new(3, 3, 2, 2), 0, 0)));
        assert!(refused(graphics.replace_pixels(texture, &pixels[..8], Rect::new(0, 0, 2, 2), 0, 0)));

        let readback = graphics
            .readback_texture(texture, Rect::new(1, 1, 2, 2), 0, 0)
            .unwrap();
        graphics.flush().unwrap();
        assert_eq!(
            graphics.readback_status(readback).unwrap(),
            ReadbackStatus::Complete(pixels)
        );
    }

    #[test]
    fn test_releasing_bound_texture_scrubs_slots() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new().with(UniformDecl::sampler("MainTex", TextureType::Tex2D));
        let shader = graphics.new_shader("sprite", &render_stages(), &reflection).unwrap();
        graphics.set_shader(shader).unwrap();

        let texture = graphics
            .new_texture(TextureSettings::new_2d(2, 2, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let main = graphics.uniform_id(shader, "MainTex").unwrap();
        graphics.send_textures(shader, main, &[Some(texture)]).unwrap();
        assert!(matches!(
            graphics.backend().texture_unit(0),
            Some(UnitBinding::Texture { texture: bound, .. }) if bound == texture
        ));

        graphics.release_texture(texture).unwrap();

        let default = graphics.default_resources().texture(TextureType::Tex2D).id;
        assert!(matches!(
            graphics.backend().texture_unit(0),
            Some(UnitBinding::Texture { texture: bound, .. }) if bound == default
        ));
        assert!(!graphics
            .shader(shader)
            .unwrap()
            .active_textures()
            .contains(&Some(texture)));
    }

    #[test]
    fn test_main_texture_array_gets_exclusive_units() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new()
            .with(UniformDecl::sampler("MainTex", TextureType::Tex2D).with_count(2))
            .with(UniformDecl::sampler("Other", TextureType::Tex2D));
        let shader_id = graphics.new_shader("layered", &render_stages(), &reflection).unwrap();

        let shader = graphics.shader(shader_id).unwrap();
        let main = shader.uniform(shader.uniform_id("MainTex").unwrap()).unwrap().ints().to_vec();
        let other = shader.uniform(shader.uniform_id("Other").unwrap()).unwrap().ints().to_vec();
        assert_eq!(main[0], 0);
        assert_eq!(main.len(), 2);
        assert!(other.iter().all(|unit| !main.contains(unit)));
        assert_eq!(shader.texture_units().len(), 3);

        graphics.set_shader(shader_id).unwrap();
        let texture = graphics
            .new_texture(TextureSettings::new_2d(2, 2, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let main_id = graphics.uniform_id(shader_id, "MainTex").unwrap();
        graphics.send_textures(shader_id, main_id, &[None, Some(texture)]).unwrap();

        let default = graphics.default_resources().texture(TextureType::Tex2D).id;
        assert!(matches!(
            graphics.backend().texture_unit(main[1] as u32),
            Some(UnitBinding::Texture { texture: bound, .. }) if bound == texture
        ));
        assert!(matches!(
            graphics.backend().texture_unit(other[0] as u32),
            Some(UnitBinding::Texture { texture: bound, .. }) if bound == default
        ));
    }

    #[test]
    fn test_releasing_render_target_returns_to_backbuffer() {
        let mut graphics = graphics();
        let target = graphics
            .new_texture(TextureSettings::new_2d(8, 8, PixelFormat::Rgba8Unorm).render_target(1), None)
            .unwrap();
        graphics
            .set_render_targets(RenderTargets {
                colors: vec![ColorTarget::new(target)],
                depth_stencil: None,
            })
            .unwrap();

        graphics.release_texture(target).unwrap();

        assert!(graphics.render_targets().is_none());
        assert_eq!(graphics.state().state().viewport.width, 64.0);
    }

    #[test]
    fn test_unknown_texture_in_send_is_refused() {
        let mut graphics = graphics();
        let reflection = ShaderReflection::new().with(UniformDecl::sampler("MainTex", TextureType::Tex2D));
        let shader = graphics.new_shader("sprite", &render_stages(), &reflection).unwrap();
        let texture = graphics
            .new_texture(TextureSettings::new_2d(2, 2, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        graphics.release_texture(texture).unwrap();

        let main = graphics.uniform_id(shader, "MainTex").unwrap();
        assert!(refused(graphics.send_textures(shader, main, &[Some(texture)])));
        graphics.send_textures(shader, main, &[None]).unwrap();
    }

    #[test]
    fn test_device_loss_drains_and_refuses() {
        let mut graphics = manual_graphics();
        let buffer = graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), None)
            .unwrap();
        graphics.release_buffer(buffer).unwrap();
        assert_eq!(graphics.stats().pending_cleanups, 1);

        graphics.backend_mut().lose_device();
        let error = graphics.present().unwrap_err();

        assert!(error.is_device_lost());
        assert!(graphics.is_device_lost());
        assert_eq!(graphics.stats().pending_cleanups, 0);
        assert!(!graphics.backend().buffer_alive(buffer));
        assert!(matches!(
            graphics.new_buffer(16, BufferSettings::new(BufferUsageFlags::VERTEX), None),
            Err(RenderError::DeviceLost(_))
        ));
        assert!(matches!(graphics.poll(), Err(RenderError::DeviceLost(_))));
        graphics.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_destroys_everything() {
        let mut graphics = graphics();
        graphics
            .new_buffer(64, BufferSettings::new(BufferUsageFlags::VERTEX), Some(&[1; 64]))
            .unwrap();
        graphics
            .new_texture(TextureSettings::new_2d(4, 4, PixelFormat::Rgba8Unorm), None)
            .unwrap();
        let shader = graphics
            .new_shader("flat", &render_stages(), &ShaderReflection::new())
            .unwrap();
        graphics.set_shader(shader).unwrap();
        let texel = graphics.default_resources().texel_buffer().id;
        graphics.readback_buffer(texel, 0, 4).unwrap();

        graphics.shutdown().unwrap();
        graphics.shutdown().unwrap();

        let backbuffer = graphics.backend().backbuffer();
        let backbuffer_textures =
            1 + usize::from(backbuffer.msaa_color.is_some()) + usize::from(backbuffer.depth_stencil.is_some());
        assert_eq!(graphics.backend().live_objects(), (0, backbuffer_textures, 0, 0));
        assert!(graphics.backend().hazards().is_empty());
        assert!(matches!(graphics.present(), Err(RenderError::DeviceLost(_))));
    }
}

//! Textures: creation and pixel uploads through staging

use log::debug;

use super::staging::TransferContext;
use crate::render::backend::{BufferTextureCopy, GpuBackend, SamplerDescriptor, SamplerId, TextureDesc, TextureId};
use crate::render::shader::BoundTexture;
use crate::render::types::{PixelFormat, Rect, TextureType};
use crate::render::{RenderError, RenderResult};

/// Texture creation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSettings {
    /// Dimensionality
    pub texture_type: TextureType,
    /// Pixel format
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Array layers or volume depth; cube maps always have 6
    pub layers: u32,
    /// Mip levels
    pub mip_levels: u32,
    /// Sample count
    pub msaa: u32,
    /// Usable as a render target
    pub render_target: bool,
    /// Writable from compute shaders
    pub compute_write: bool,
    /// Sampler state
    pub sampler: SamplerDescriptor,
    /// Debug label
    pub label: Option<String>,
}

impl TextureSettings {
    /// Single-layer 2D texture
    pub fn new_2d(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            texture_type: TextureType::Tex2D,
            format,
            width,
            height,
            layers: 1,
            mip_levels: 1,
            msaa: 1,
            render_target: false,
            compute_write: false,
            sampler: SamplerDescriptor::default(),
            label: None,
        }
    }

    /// Texture of any type with `layers` layers
    pub fn with_type(mut self, texture_type: TextureType, layers: u32) -> Self {
        self.texture_type = texture_type;
        self.layers = match texture_type {
            TextureType::Tex2D => 1,
            TextureType::Cube => 6,
            TextureType::Array | TextureType::Volume => layers.max(1),
        };
        self
    }

    /// Make the texture a render target with `msaa` samples
    pub fn render_target(mut self, msaa: u32) -> Self {
        self.render_target = true;
        self.msaa = msaa.max(1);
        self
    }

    /// Allow compute shader writes
    pub fn compute_write(mut self) -> Self {
        self.compute_write = true;
        self
    }

    /// Set mip level count
    pub fn with_mip_levels(mut self, levels: u32) -> Self {
        self.mip_levels = levels.max(1);
        self
    }

    /// Set sampler state
    pub fn with_sampler(mut self, sampler: SamplerDescriptor) -> Self {
        self.sampler = sampler;
        self
    }

    /// Set debug label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn validate(&self) -> RenderResult<()> {
        let fail = |reason: String| Err(RenderError::ResourceCreationFailed(reason));

        if self.width == 0 || self.height == 0 {
            return fail(format!("Texture size must be non-zero, got {}x{}", self.width, self.height));
        }
        if self.texture_type == TextureType::Cube && self.width != self.height {
            return fail("Cube map faces must be square".to_string());
        }
        let max_mips = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels > max_mips {
            return fail(format!("{} mip levels requested, at most {} possible", self.mip_levels, max_mips));
        }
        if self.msaa > 1 {
            if !self.render_target || self.texture_type != TextureType::Tex2D || self.mip_levels > 1 {
                return fail("Multisampled textures must be single-mip 2D render targets".to_string());
            }
            if self.compute_write {
                return fail("Multisampled textures cannot be written by compute shaders".to_string());
            }
        }
        if self.compute_write && self.format.is_depth() {
            return fail("Depth textures cannot be written by compute shaders".to_string());
        }
        Ok(())
    }

    /// Backend creation parameters
    pub fn descriptor(&self) -> TextureDesc {
        TextureDesc {
            texture_type: self.texture_type,
            format: self.format,
            width: self.width,
            height: self.height,
            layers: self.layers,
            mip_levels: self.mip_levels,
            samples: self.msaa,
            render_target: self.render_target,
            storage: self.compute_write,
            label: self.label.clone(),
        }
    }
}

/// A GPU texture and its sampler
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    settings: TextureSettings,
    sampler: SamplerId,
}

impl Texture {
    /// Create a texture, optionally uploading `data` for mip 0 of every layer
    pub fn create<B: GpuBackend>(
        ctx: &mut TransferContext<'_, B>,
        settings: TextureSettings,
        sampler: SamplerId,
        data: Option<&[u8]>,
    ) -> RenderResult<Self> {
        settings.validate()?;

        let desc = settings.descriptor();
        let layer_size = desc.layer_size();
        if let Some(data) = data {
            let expected = layer_size * u64::from(settings.layers);
            if data.len() as u64 != expected {
                return Err(RenderError::ResourceCreationFailed(format!(
                    "Initial data is {} bytes, texture needs {}",
                    data.len(),
                    expected
                )));
            }
            if settings.msaa > 1 {
                return Err(RenderError::ResourceCreationFailed(
                    "Multisampled textures cannot take initial data".to_string(),
                ));
            }
        }

        debug!(
            "Creating {:?} texture {}x{}x{} {:?}",
            settings.texture_type, settings.width, settings.height, settings.layers, settings.format
        );
        let id = ctx.backend.create_texture(&desc)?;
        let texture = Self { id, settings, sampler };

        if let Some(data) = data {
            let region = Rect::new(0, 0, texture.settings.width, texture.settings.height);
            for (slice, layer) in data.chunks_exact(layer_size as usize).enumerate() {
                texture.replace_pixels(ctx, layer, region, slice as u32, 0)?;
            }
        }

        Ok(texture)
    }

    /// Backend handle
    pub const fn id(&self) -> TextureId {
        self.id
    }

    /// Creation settings
    pub const fn settings(&self) -> &TextureSettings {
        &self.settings
    }

    /// Sampler object
    pub const fn sampler(&self) -> SamplerId {
        self.sampler
    }

    /// Replace the sampler object
    pub fn set_sampler(&mut self, sampler: SamplerId, desc: SamplerDescriptor) {
        self.sampler = sampler;
        self.settings.sampler = desc;
    }

    /// Texture as seen by shader slots
    pub const fn bound(&self) -> BoundTexture {
        BoundTexture {
            id: self.id,
            texture_type: self.settings.texture_type,
            sampler: self.sampler,
            format: self.settings.format,
            storage: self.settings.compute_write,
        }
    }

    /// Width and height of a mip level
    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.settings.width >> mip).max(1), (self.settings.height >> mip).max(1))
    }

    /// Check that `region` of `slice`/`mip` exists, returns the tightly packed byte size
    pub fn validate_region(&self, region: Rect, slice: u32, mip: u32) -> RenderResult<u64> {
        if self.settings.msaa > 1 {
            return Err(RenderError::InvalidResourceState(
                "Multisampled textures cannot be copied from or to".to_string(),
            ));
        }
        if mip >= self.settings.mip_levels || slice >= self.settings.layers {
            return Err(RenderError::InvalidResourceState(format!(
                "Slice {slice} mip {mip} does not exist"
            )));
        }
        let (width, height) = self.mip_size(mip);
        let fits = region.x >= 0
            && region.y >= 0
            && region.w > 0
            && region.h > 0
            && region.x as u32 + region.w <= width
            && region.y as u32 + region.h <= height;
        if !fits {
            return Err(RenderError::InvalidResourceState(format!(
                "Region {region:?} is outside mip {mip} ({width}x{height})"
            )));
        }

        Ok(u64::from(region.w) * u64::from(region.h) * u64::from(self.settings.format.bytes_per_pixel()))
    }

    /// Upload tightly packed pixels into `region` of `slice`/`mip`
    pub fn replace_pixels<B: GpuBackend>(
        &self,
        ctx: &mut TransferContext<'_, B>,
        data: &[u8],
        region: Rect,
        slice: u32,
        mip: u32,
    ) -> RenderResult<()> {
        let expected = self.validate_region(region, slice, mip)?;
        if data.len() as u64 != expected {
            return Err(RenderError::InvalidResourceState(format!(
                "Pixel data is {} bytes, region needs {}",
                data.len(),
                expected
            )));
        }

        let staging = ctx.stage_upload(data)?;
        let encoder = ctx.blit_encoder()?;
        ctx.backend.copy_buffer_to_texture(
            encoder,
            staging,
            self.id,
            &BufferTextureCopy {
                buffer_offset: 0,
                bytes_per_row: region.w * self.settings.format.bytes_per_pixel(),
                region,
                slice,
                mip,
            },
        );
        Ok(())
    }

    /// Queue destruction once the command buffer being recorded completes
    pub fn release<B: GpuBackend>(self, ctx: &mut TransferContext<'_, B>) {
        ctx.release_texture_after_pending(self.id);
    }
}

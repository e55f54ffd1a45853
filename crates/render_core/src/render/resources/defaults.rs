//! Placeholder resources bound wherever a shader slot has nothing else

use crate::render::backend::{BufferId, TextureId};
use crate::render::shader::{BoundBuffer, BoundTexture};
use crate::render::types::TextureType;

/// One default texture per [`TextureType`] plus default texel and storage buffers
#[derive(Debug, Clone)]
pub struct DefaultResources {
    textures: [BoundTexture; 4],
    texel_buffer: BoundBuffer,
    storage_buffer: BoundBuffer,
}

impl DefaultResources {
    /// Bundle already-created default resources; `textures` is in [`TextureType::ALL`] order
    pub const fn new(
        textures: [BoundTexture; 4],
        texel_buffer: BoundBuffer,
        storage_buffer: BoundBuffer,
    ) -> Self {
        Self {
            textures,
            texel_buffer,
            storage_buffer,
        }
    }

    /// Default texture for a type
    pub fn texture(&self, texture_type: TextureType) -> BoundTexture {
        let index = TextureType::ALL
            .iter()
            .position(|t| *t == texture_type)
            .unwrap_or(0);
        self.textures[index]
    }

    /// Default texel buffer
    pub const fn texel_buffer(&self) -> BoundBuffer {
        self.texel_buffer
    }

    /// Default storage buffer
    pub const fn storage_buffer(&self) -> BoundBuffer {
        self.storage_buffer
    }

    /// Whether `id` is one of the default textures
    pub fn is_default_texture(&self, id: TextureId) -> bool {
        self.textures.iter().any(|t| t.id == id)
    }

    /// Whether `id` is one of the default buffers
    pub fn is_default_buffer(&self, id: BufferId) -> bool {
        self.texel_buffer.id == id || self.storage_buffer.id == id
    }

    /// Every default texture handle
    pub fn texture_ids(&self) -> impl Iterator<Item = TextureId> + '_ {
        self.textures.iter().map(|t| t.id)
    }

    /// Every default buffer handle
    pub fn buffer_ids(&self) -> [BufferId; 2] {
        [self.texel_buffer.id, self.storage_buffer.id]
    }
}

//! Uniform metadata and CPU-side storage

use crate::render::types::{Access, PixelFormat, TextureType};

/// Base type of a uniform as declared by the shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    /// Float scalar or vector
    Float,
    /// Signed integer scalar or vector
    Int,
    /// Unsigned integer scalar or vector
    Uint,
    /// Boolean scalar or vector, stored as 32-bit integers
    Bool,
    /// Float matrix
    Matrix,
    /// Combined texture/sampler
    Sampler,
    /// Texel buffer
    TexelBuffer,
    /// Storage image
    StorageTexture,
    /// Storage buffer block
    StorageBuffer,
}

impl UniformType {
    /// Whether the uniform names a GPU resource rather than plain data
    pub const fn is_resource(self) -> bool {
        matches!(
            self,
            Self::Sampler | Self::TexelBuffer | Self::StorageTexture | Self::StorageBuffer
        )
    }

    /// Whether the uniform occupies texture units
    pub const fn uses_texture_units(self) -> bool {
        matches!(self, Self::Sampler | Self::TexelBuffer)
    }

    /// Whether the uniform's resources live in the texture half of the binding table
    pub const fn is_texture_resource(self) -> bool {
        matches!(self, Self::Sampler | Self::StorageTexture)
    }

    /// Whether the uniform's resources live in the buffer half of the binding table
    pub const fn is_buffer_resource(self) -> bool {
        matches!(self, Self::TexelBuffer | Self::StorageBuffer)
    }
}

/// Matrix dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MatrixSize {
    /// Rows
    pub rows: u32,
    /// Columns
    pub columns: u32,
}

impl MatrixSize {
    /// Create a matrix size
    pub const fn new(columns: u32, rows: u32) -> Self {
        Self { rows, columns }
    }
}

/// Index of a uniform within its shader's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformId(pub(crate) usize);

impl UniformId {
    /// Position in the table
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Metadata and local data of one uniform
///
/// Data is kept as 32-bit words. Floats, signed and unsigned integers are
/// reinterpreted views of the same storage, so a sampler uniform's unit
/// indices and a float vector's components share one layout. For resource
/// uniforms each element holds the texture unit or binding slot it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformInfo {
    /// Canonical name
    pub name: String,
    /// Base type
    pub base_type: UniformType,
    /// Components per element for scalar/vector types
    pub components: u32,
    /// Dimensions for matrix types
    pub matrix: MatrixSize,
    /// Array length
    pub count: usize,
    /// Native location, -1 when inactive
    pub location: i32,
    /// First slot in the shader's active texture or buffer list
    pub resource_index: usize,
    /// Expected texture dimensionality for sampler and storage texture uniforms
    pub texture_type: TextureType,
    /// Shader access for storage resources
    pub access: Access,
    /// Format declared for storage textures
    pub storage_format: Option<PixelFormat>,
    /// Whether the linker reported the uniform as used
    pub active: bool,
    data: Vec<u32>,
}

impl UniformInfo {
    /// Inactive uniform with no storage allocated
    pub fn new(name: impl Into<String>, base_type: UniformType) -> Self {
        Self {
            name: name.into(),
            base_type,
            components: 1,
            matrix: MatrixSize::default(),
            count: 1,
            location: -1,
            resource_index: 0,
            texture_type: TextureType::Tex2D,
            access: Access::READ,
            storage_format: None,
            active: false,
            data: Vec::new(),
        }
    }

    /// 32-bit words per array element
    pub fn element_words(&self) -> usize {
        match self.base_type {
            UniformType::Matrix => (self.matrix.rows * self.matrix.columns) as usize,
            t if t.is_resource() => 1,
            _ => self.components as usize,
        }
    }

    /// Size of the local data in bytes
    pub fn data_size(&self) -> usize {
        self.element_words() * self.count * std::mem::size_of::<u32>()
    }

    /// Whether storage has been allocated
    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Allocate zeroed storage for every element, keeping any existing data
    pub(crate) fn allocate(&mut self) {
        let words = self.element_words() * self.count;
        if self.data.len() != words {
            self.data.resize(words, 0);
        }
    }

    /// Copy an initializer into local storage, truncating to the allocated size
    pub(crate) fn apply_initializer(&mut self, words: &[u32]) {
        let len = words.len().min(self.data.len());
        self.data[..len].copy_from_slice(&words[..len]);
    }

    /// Raw words
    pub fn words(&self) -> &[u32] {
        &self.data
    }

    /// Mutable raw words
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    /// Float view
    pub fn floats(&self) -> &[f32] {
        bytemuck::cast_slice(&self.data)
    }

    /// Mutable float view
    pub fn floats_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// Signed integer view
    pub fn ints(&self) -> &[i32] {
        bytemuck::cast_slice(&self.data)
    }

    /// Mutable signed integer view
    pub fn ints_mut(&mut self) -> &mut [i32] {
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// Number of whole elements covered by `words` written from the start
    pub fn elements_for_words(&self, words: usize) -> usize {
        let per = self.element_words().max(1);
        words.div_ceil(per).min(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_size_by_type() {
        let mut vec4 = UniformInfo::new("color", UniformType::Float);
        vec4.components = 4;
        vec4.count = 3;
        assert_eq!(vec4.data_size(), 48);

        let mut mat = UniformInfo::new("mvp", UniformType::Matrix);
        mat.matrix = MatrixSize::new(4, 4);
        assert_eq!(mat.data_size(), 64);

        let mut samplers = UniformInfo::new("tex", UniformType::Sampler);
        samplers.count = 2;
        samplers.components = 4;
        assert_eq!(samplers.data_size(), 8);
    }

    #[test]
    fn test_views_share_storage() {
        let mut info = UniformInfo::new("value", UniformType::Float);
        info.components = 2;
        info.allocate();
        info.floats_mut()[0] = 1.0;
        info.ints_mut()[1] = -1;

        assert_eq!(info.words()[0], 1.0f32.to_bits());
        assert_eq!(info.words()[1], u32::MAX);
    }

    #[test]
    fn test_initializer_truncates() {
        let mut info = UniformInfo::new("value", UniformType::Uint);
        info.allocate();
        info.apply_initializer(&[7, 8, 9]);
        assert_eq!(info.words(), &[7]);
    }

    #[test]
    fn test_elements_for_words_clamps() {
        let mut info = UniformInfo::new("v", UniformType::Float);
        info.components = 3;
        info.count = 2;
        assert_eq!(info.elements_for_words(1), 1);
        assert_eq!(info.elements_for_words(4), 2);
        assert_eq!(info.elements_for_words(100), 2);
    }
}

//! Declared shader interface
//!
//! A [`ShaderReflection`] lists every uniform, resource and storage block the
//! shader source declares, plus initializer values. The backend linker later
//! reports which of those are actually active; declarations the linker never
//! mentions stay inactive and cost nothing.

use std::collections::BTreeMap;

use super::uniform::{MatrixSize, UniformInfo, UniformType};
use crate::render::types::{Access, PixelFormat, TextureType};

/// Strip a trailing array subscript, `lights[0]` becomes `lights`
pub fn canonicalize_uniform_name(name: &str) -> &str {
    if name.ends_with(']') {
        if let Some(open) = name.rfind('[') {
            return &name[..open];
        }
    }
    name
}

/// Declaration of one uniform or storage block
#[derive(Debug, Clone, PartialEq)]
pub struct UniformDecl {
    info: UniformInfo,
}

impl UniformDecl {
    fn with_type(name: &str, base_type: UniformType) -> Self {
        Self {
            info: UniformInfo::new(canonicalize_uniform_name(name), base_type),
        }
    }

    /// Float scalar or vector
    pub fn float(name: &str, components: u32) -> Self {
        let mut decl = Self::with_type(name, UniformType::Float);
        decl.info.components = components;
        decl
    }

    /// Signed integer scalar or vector
    pub fn int(name: &str, components: u32) -> Self {
        let mut decl = Self::with_type(name, UniformType::Int);
        decl.info.components = components;
        decl
    }

    /// Unsigned integer scalar or vector
    pub fn uint(name: &str, components: u32) -> Self {
        let mut decl = Self::with_type(name, UniformType::Uint);
        decl.info.components = components;
        decl
    }

    /// Boolean scalar or vector
    pub fn bool(name: &str, components: u32) -> Self {
        let mut decl = Self::with_type(name, UniformType::Bool);
        decl.info.components = components;
        decl
    }

    /// Float matrix with `columns` x `rows`
    pub fn matrix(name: &str, columns: u32, rows: u32) -> Self {
        let mut decl = Self::with_type(name, UniformType::Matrix);
        decl.info.matrix = MatrixSize::new(columns, rows);
        decl
    }

    /// Sampled texture
    pub fn sampler(name: &str, texture_type: TextureType) -> Self {
        let mut decl = Self::with_type(name, UniformType::Sampler);
        decl.info.texture_type = texture_type;
        decl
    }

    /// Texel buffer
    pub fn texel_buffer(name: &str) -> Self {
        Self::with_type(name, UniformType::TexelBuffer)
    }

    /// Storage texture
    pub fn storage_texture(
        name: &str,
        texture_type: TextureType,
        format: PixelFormat,
        access: Access,
    ) -> Self {
        let mut decl = Self::with_type(name, UniformType::StorageTexture);
        decl.info.texture_type = texture_type;
        decl.info.storage_format = Some(format);
        decl.info.access = access;
        decl
    }

    /// Storage buffer block
    pub fn storage_buffer(name: &str, access: Access) -> Self {
        let mut decl = Self::with_type(name, UniformType::StorageBuffer);
        decl.info.access = access;
        decl
    }

    /// Make the declaration an array of `count` elements
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.info.count = count.max(1);
        self
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Declared base type
    pub fn base_type(&self) -> UniformType {
        self.info.base_type
    }

    pub(crate) fn info(&self) -> &UniformInfo {
        &self.info
    }
}

/// Declared interface of a shader program
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderReflection {
    uniforms: BTreeMap<String, UniformInfo>,
    storage_blocks: BTreeMap<String, UniformInfo>,
    initializers: BTreeMap<String, Vec<u32>>,
    texture_resources: usize,
    buffer_resources: usize,
}

impl ShaderReflection {
    /// Empty interface
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a uniform or storage block
    ///
    /// Resource uniforms are assigned consecutive indices in the texture or
    /// buffer half of the binding table in declaration order.
    #[must_use]
    pub fn with(mut self, decl: UniformDecl) -> Self {
        let mut info = decl.info;
        if info.base_type.is_texture_resource() {
            info.resource_index = self.texture_resources;
            self.texture_resources += info.count;
        } else if info.base_type.is_buffer_resource() {
            info.resource_index = self.buffer_resources;
            self.buffer_resources += info.count;
        }

        if info.base_type == UniformType::StorageBuffer {
            self.storage_blocks.insert(info.name.clone(), info);
        } else {
            self.uniforms.insert(info.name.clone(), info);
        }
        self
    }

    /// Declare an initializer value for a uniform, as raw words
    #[must_use]
    pub fn with_initializer(mut self, name: &str, words: Vec<u32>) -> Self {
        self.initializers
            .insert(canonicalize_uniform_name(name).to_string(), words);
        self
    }

    /// Declare a float initializer value for a uniform
    #[must_use]
    pub fn with_float_initializer(self, name: &str, values: &[f32]) -> Self {
        self.with_initializer(name, bytemuck::cast_slice(values).to_vec())
    }

    /// Declared uniforms, excluding storage blocks
    pub fn uniforms(&self) -> impl Iterator<Item = &UniformInfo> {
        self.uniforms.values()
    }

    /// Declared storage blocks
    pub fn storage_blocks(&self) -> impl Iterator<Item = &UniformInfo> {
        self.storage_blocks.values()
    }

    /// Uniform declaration by canonical name
    pub fn uniform(&self, name: &str) -> Option<&UniformInfo> {
        self.uniforms.get(name)
    }

    /// Storage block declaration by canonical name
    pub fn storage_block(&self, name: &str) -> Option<&UniformInfo> {
        self.storage_blocks.get(name)
    }

    /// Initializer for a uniform
    pub fn initializer(&self, name: &str) -> Option<&[u32]> {
        self.initializers.get(name).map(Vec::as_slice)
    }

    /// Slots needed in the texture half of the binding table
    pub const fn texture_resource_count(&self) -> usize {
        self.texture_resources
    }

    /// Slots needed in the buffer half of the binding table
    pub const fn buffer_resource_count(&self) -> usize {
        self.buffer_resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_strips_subscript() {
        assert_eq!(canonicalize_uniform_name("lights[0]"), "lights");
        assert_eq!(canonicalize_uniform_name("lights[12]"), "lights");
        assert_eq!(canonicalize_uniform_name("color"), "color");
        assert_eq!(canonicalize_uniform_name("odd]"), "odd]");
    }

    #[test]
    fn test_resource_indices_assigned_per_half() {
        let reflection = ShaderReflection::new()
            .with(UniformDecl::sampler("albedo", TextureType::Tex2D))
            .with(UniformDecl::texel_buffer("offsets"))
            .with(UniformDecl::sampler("shadows", TextureType::Array).with_count(3))
            .with(UniformDecl::storage_buffer("Particles", Access::READ | Access::WRITE))
            .with(UniformDecl::float("tint", 4));

        assert_eq!(reflection.uniform("albedo").unwrap().resource_index, 0);
        assert_eq!(reflection.uniform("shadows").unwrap().resource_index, 1);
        assert_eq!(reflection.uniform("offsets").unwrap().resource_index, 0);
        assert_eq!(reflection.storage_block("Particles").unwrap().resource_index, 1);
        assert_eq!(reflection.texture_resource_count(), 4);
        assert_eq!(reflection.buffer_resource_count(), 2);
        assert!(reflection.uniform("Particles").is_none());
    }

    #[test]
    fn test_initializer_by_canonical_name() {
        let reflection = ShaderReflection::new()
            .with(UniformDecl::float("weights", 1).with_count(2))
            .with_float_initializer("weights[0]", &[0.25, 0.75]);
        let words = reflection.initializer("weights").unwrap();
        assert_eq!(words, &[0.25f32.to_bits(), 0.75f32.to_bits()]);
    }
}

//! # Shader Programs
//!
//! A [`Shader`] pairs a linked backend program with everything the core needs
//! to drive it: the uniform table built from the declared
//! [`ShaderReflection`], the texture unit and storage binding slots derived
//! from it, the resources currently occupying those slots, and uniform
//! updates queued while the shader is not the active one.

pub mod binding_table;
pub mod reflection;
pub mod uniform;

pub use binding_table::{BoundBuffer, BoundTexture, Shader, StorageBufferSlot, TextureUnit, UniformValues};
pub use reflection::{canonicalize_uniform_name, ShaderReflection, UniformDecl};
pub use uniform::{MatrixSize, UniformId, UniformInfo, UniformType};

/// Texture unit reserved for the main texture
pub const MAIN_TEXTURE_UNIT: u32 = 0;

/// Pipeline stage of a shader module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex stage
    Vertex,
    /// Pixel (fragment) stage
    Pixel,
    /// Compute stage
    Compute,
}

/// Uniforms the core writes on every draw when a shader declares them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinUniform {
    /// Main texture, always on unit 0
    MainTexture,
    /// Model-view transform
    TransformMatrix,
    /// Projection transform
    ProjectionMatrix,
    /// Inverse-transpose of the upper 3x3 of the transform
    NormalMatrix,
    /// Constant color multiplied into every vertex color
    ConstantColor,
    /// Render target size in pixels: width, height, y-flip sign, y-flip offset
    ScreenSize,
    /// Point sprite size
    PointSize,
}

impl BuiltinUniform {
    /// Every built-in uniform
    pub const ALL: [Self; 7] = [
        Self::MainTexture,
        Self::TransformMatrix,
        Self::ProjectionMatrix,
        Self::NormalMatrix,
        Self::ConstantColor,
        Self::ScreenSize,
        Self::PointSize,
    ];

    /// Name the shader source declares
    pub const fn name(self) -> &'static str {
        match self {
            Self::MainTexture => "MainTex",
            Self::TransformMatrix => "TransformMatrix",
            Self::ProjectionMatrix => "ProjectionMatrix",
            Self::NormalMatrix => "NormalMatrix",
            Self::ConstantColor => "ConstantColor",
            Self::ScreenSize => "ScreenSize",
            Self::PointSize => "PointSize",
        }
    }

    /// Look up a built-in by declared name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }
}

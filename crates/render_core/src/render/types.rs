//! Logical render state types shared by the core and every backend
//!
//! These types describe *what* the caller wants (blend equations, compare
//! functions, pixel formats) without committing to any native graphics API.
//! Backends translate them at the point of application.

use bitflags::bitflags;

/// Linear RGBA color with floating point channels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color {
    /// Red channel
    pub r: f32,
    /// Green channel
    pub g: f32,
    /// Blue channel
    pub b: f32,
    /// Alpha channel
    pub a: f32,
}

impl Color {
    /// Opaque white
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    /// Transparent black
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Create a new color
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Channels as an array in RGBA order
    pub const fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Quantize to 8-bit unsigned normalized channels
    pub fn to_rgba8(self) -> [u8; 4] {
        let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [quantize(self.r), quantize(self.g), quantize(self.b), quantize(self.a)]
    }
}

/// Integer rectangle in pixels, used for scissor and readback regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub w: u32,
    /// Height in pixels
    pub h: u32,
}

impl Rect {
    /// Create a new rectangle
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }
}

/// Viewport transform applied before rasterization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width in pixels
    pub width: f32,
    /// Height in pixels
    pub height: f32,
    /// Near depth range
    pub min_depth: f32,
    /// Far depth range
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport covering `width` x `height` pixels
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::from_size(1, 1)
    }
}

/// Comparison function used by depth and stencil tests and shadow samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareMode {
    /// Passes when the incoming value is less than the stored value
    Less,
    /// Passes when less than or equal
    LessEqual,
    /// Passes when equal
    Equal,
    /// Passes when greater than or equal
    GreaterEqual,
    /// Passes when greater
    Greater,
    /// Passes when not equal
    NotEqual,
    /// Always passes
    #[default]
    Always,
    /// Never passes
    Never,
}

impl CompareMode {
    pub(crate) const fn bits(self) -> u64 {
        self as u64
    }
}

/// Operation applied to the stencil buffer when the stencil test passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilAction {
    /// Keep the stored value
    #[default]
    Keep,
    /// Write zero
    Zero,
    /// Write the reference value
    Replace,
    /// Increment, clamping at the maximum
    Increment,
    /// Decrement, clamping at zero
    Decrement,
    /// Increment with wrap-around
    IncrementWrap,
    /// Decrement with wrap-around
    DecrementWrap,
    /// Bitwise invert
    Invert,
}

impl StencilAction {
    pub(crate) const fn bits(self) -> u64 {
        self as u64
    }
}

/// Logical stencil configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    /// Action taken when the test passes
    pub action: StencilAction,
    /// Comparison against the reference value
    pub compare: CompareMode,
    /// Reference value
    pub value: u32,
    /// Mask applied before comparison
    pub read_mask: u8,
    /// Mask applied on write
    pub write_mask: u8,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            action: StencilAction::Keep,
            compare: CompareMode::Always,
            value: 0,
            read_mask: 0xFF,
            write_mask: 0xFF,
        }
    }
}

impl StencilState {
    /// Whether this configuration can affect rendering at all
    pub fn is_enabled(&self) -> bool {
        self.action != StencilAction::Keep || self.compare != CompareMode::Always
    }
}

/// Logical depth test configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthState {
    /// Depth comparison
    pub compare: CompareMode,
    /// Whether passing fragments write depth
    pub write: bool,
}

/// Blend factor applied to source or destination color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    /// 0
    Zero,
    /// 1
    One,
    /// Source color
    SrcColor,
    /// 1 - source color
    OneMinusSrcColor,
    /// Source alpha
    SrcAlpha,
    /// 1 - source alpha
    OneMinusSrcAlpha,
    /// Destination color
    DstColor,
    /// 1 - destination color
    OneMinusDstColor,
    /// Destination alpha
    DstAlpha,
    /// 1 - destination alpha
    OneMinusDstAlpha,
    /// min(source alpha, 1 - destination alpha)
    SrcAlphaSaturated,
}

/// Blend equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    /// src + dst
    Add,
    /// src - dst
    Subtract,
    /// dst - src
    ReverseSubtract,
    /// min(src, dst)
    Min,
    /// max(src, dst)
    Max,
}

/// Full blend configuration for all color attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    /// Whether blending is enabled
    pub enabled: bool,
    /// Color equation
    pub operation_rgb: BlendOperation,
    /// Alpha equation
    pub operation_a: BlendOperation,
    /// Source color factor
    pub src_factor_rgb: BlendFactor,
    /// Source alpha factor
    pub src_factor_a: BlendFactor,
    /// Destination color factor
    pub dst_factor_rgb: BlendFactor,
    /// Destination alpha factor
    pub dst_factor_a: BlendFactor,
}

impl BlendState {
    /// Blending disabled, source replaces destination
    pub const fn replace() -> Self {
        Self {
            enabled: false,
            operation_rgb: BlendOperation::Add,
            operation_a: BlendOperation::Add,
            src_factor_rgb: BlendFactor::One,
            src_factor_a: BlendFactor::One,
            dst_factor_rgb: BlendFactor::Zero,
            dst_factor_a: BlendFactor::Zero,
        }
    }

    /// Premultiplied alpha blending
    pub const fn alpha_premultiplied() -> Self {
        Self {
            enabled: true,
            operation_rgb: BlendOperation::Add,
            operation_a: BlendOperation::Add,
            src_factor_rgb: BlendFactor::One,
            src_factor_a: BlendFactor::One,
            dst_factor_rgb: BlendFactor::OneMinusSrcAlpha,
            dst_factor_a: BlendFactor::OneMinusSrcAlpha,
        }
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::alpha_premultiplied()
    }
}

bitflags! {
    /// Color channels written by draws
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorChannelMask: u8 {
        /// Red
        const R = 1 << 0;
        /// Green
        const G = 1 << 1;
        /// Blue
        const B = 1 << 2;
        /// Alpha
        const A = 1 << 3;
    }
}

impl Default for ColorChannelMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Face culling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    /// No culling
    #[default]
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    Back,
}

/// Vertex winding that defines a front face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Winding {
    /// Clockwise triangles are front-facing
    Clockwise,
    /// Counter-clockwise triangles are front-facing
    #[default]
    CounterClockwise,
}

/// Primitive topology for draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    /// Independent triangles
    #[default]
    Triangles,
    /// Triangle strip
    TriangleStrip,
    /// Independent lines
    Lines,
    /// Line strip
    LineStrip,
    /// Points
    Points,
}

/// Index element size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    /// 16-bit indices
    Uint16,
    /// 32-bit indices
    #[default]
    Uint32,
}

/// Dimensionality of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    /// Plain 2D texture
    #[default]
    Tex2D,
    /// 2D array texture
    Array,
    /// 3D texture
    Volume,
    /// Cube map
    Cube,
}

impl TextureType {
    /// All texture types, in declaration order
    pub const ALL: [Self; 4] = [Self::Tex2D, Self::Array, Self::Volume, Self::Cube];
}

/// Pixel formats understood by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 8-bit RGBA, unsigned normalized
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 8-bit BGRA, unsigned normalized
    Bgra8Unorm,
    /// Single 8-bit channel
    R8Unorm,
    /// Single 32-bit float channel
    R32Float,
    /// Four 16-bit float channels
    Rgba16Float,
    /// Four 32-bit float channels
    Rgba32Float,
    /// Single 32-bit unsigned integer channel
    R32Uint,
    /// 16-bit depth
    Depth16,
    /// 24-bit depth with 8-bit stencil
    Depth24Stencil8,
    /// 32-bit float depth
    Depth32Float,
}

impl PixelFormat {
    /// Size of a single texel in bytes
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Depth16 => 2,
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::R32Float
            | Self::R32Uint
            | Self::Depth24Stencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Whether the format carries depth
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth16 | Self::Depth24Stencil8 | Self::Depth32Float)
    }

    /// Whether the format carries stencil
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8)
    }
}

/// Texture minification/magnification filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel
    Nearest,
    /// Bilinear
    #[default]
    Linear,
}

/// Filter between mipmap levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapFilter {
    /// Mipmaps are not sampled
    #[default]
    None,
    /// Nearest level
    Nearest,
    /// Blend between levels
    Linear,
}

/// Texture coordinate wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    /// Clamp to edge
    #[default]
    Clamp,
    /// Clamp to transparent black
    ClampZero,
    /// Clamp to opaque white
    ClampOne,
    /// Repeat
    Repeat,
    /// Mirrored repeat
    MirroredRepeat,
}

bitflags! {
    /// Ways a buffer may be used by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsageFlags: u32 {
        /// Vertex data
        const VERTEX = 1 << 0;
        /// Index data
        const INDEX = 1 << 1;
        /// Uniform block data
        const UNIFORM = 1 << 2;
        /// Texel buffer (formatted, sampled through a view)
        const TEXEL = 1 << 3;
        /// Shader storage buffer
        const SHADER_STORAGE = 1 << 4;
        /// Indirect draw/dispatch arguments
        const INDIRECT_ARGUMENTS = 1 << 5;
        /// Source of GPU copies
        const COPY_SOURCE = 1 << 6;
        /// Destination of GPU copies
        const COPY_DEST = 1 << 7;
    }
}

bitflags! {
    /// Shader access to a storage resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        /// Shader reads the resource
        const READ = 1 << 0;
        /// Shader writes the resource
        const WRITE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_quantization() {
        assert_eq!(Color::WHITE.to_rgba8(), [255, 255, 255, 255]);
        assert_eq!(Color::new(0.5, 0.0, 2.0, -1.0).to_rgba8(), [128, 0, 255, 0]);
    }

    #[test]
    fn test_stencil_enabled() {
        assert!(!StencilState::default().is_enabled());
        let stencil = StencilState {
            compare: CompareMode::Equal,
            ..StencilState::default()
        };
        assert!(stencil.is_enabled());
    }

    #[test]
    fn test_pixel_format_properties() {
        assert_eq!(PixelFormat::Rgba8Unorm.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::Rgba32Float.bytes_per_pixel(), 16);
        assert!(PixelFormat::Depth24Stencil8.is_depth());
        assert!(PixelFormat::Depth24Stencil8.has_stencil());
        assert!(!PixelFormat::Depth32Float.has_stencil());
    }
}

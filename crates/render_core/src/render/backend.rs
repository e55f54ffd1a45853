//! # GPU Backend Capability Interface
//!
//! [`GpuBackend`] is the seam between the rendering core and a native graphics
//! API. The core owns all policy (encoder switching, dirty state, deferred
//! destruction, staging, binding slots); a backend only has to create
//! objects, record commands into an explicit encoder, submit command buffers
//! tagged with a completion index, and report the highest completed index.
//!
//! Handles are slotmap keys, so a handle from a destroyed object never aliases
//! a newer one.

use super::shader::{ShaderReflection, ShaderStage, UniformType};
use super::shader::uniform::MatrixSize;
use super::types::{
    Access, BlendState, BufferUsageFlags, Color, ColorChannelMask, CompareMode, CullMode,
    DepthState, FilterMode, IndexFormat, MipmapFilter, PixelFormat, PrimitiveType, Rect,
    StencilAction, TextureType, Viewport, Winding, WrapMode,
};
use super::RenderResult;

slotmap::new_key_type! {
    /// Handle to a GPU buffer
    pub struct BufferId;
    /// Handle to a GPU texture
    pub struct TextureId;
    /// Handle to an immutable sampler object
    pub struct SamplerId;
    /// Handle to an immutable depth/stencil state object
    pub struct DepthStencilId;
    /// Handle to a linked shader program
    pub struct ProgramId;
    /// Handle to a command buffer being recorded or in flight
    pub struct CommandBufferId;
    /// Handle to a render, blit or compute encoder
    pub struct EncoderId;
}

/// Kind of encoder recording into a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    /// Draws into a render pass
    Render,
    /// Copies and fills
    Blit,
    /// Compute dispatches
    Compute,
}

/// What happens after a command buffer is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubmitMode {
    /// Plain submission, completion is tracked by index only
    #[default]
    Standard,
    /// Submission also presents the backbuffer
    Present,
}

/// Memory placement of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocation {
    /// GPU-only memory, written through staging copies
    #[default]
    DeviceLocal,
    /// Host-visible memory the CPU writes and the GPU reads
    HostUpload,
    /// Host-visible, host-cached memory the GPU writes and the CPU reads
    HostReadback,
}

impl MemoryLocation {
    /// Whether the CPU can map this memory
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Requested usage, the core always adds copy source/destination
    pub usage: BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
    /// Whether a dedicated allocation is requested
    pub dedicated: bool,
    /// Format for texel buffer views
    pub texel_format: Option<PixelFormat>,
    /// Debug label
    pub label: Option<String>,
}

/// Texture creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    /// Dimensionality
    pub texture_type: TextureType,
    /// Pixel format
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Array layers, cube faces (6) or volume depth
    pub layers: u32,
    /// Mip levels
    pub mip_levels: u32,
    /// Sample count
    pub samples: u32,
    /// Usable as a render pass attachment
    pub render_target: bool,
    /// Writable from compute shaders
    pub storage: bool,
    /// Debug label
    pub label: Option<String>,
}

impl TextureDesc {
    /// Byte size of one layer at mip 0
    pub fn layer_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }
}

/// Immutable sampler parameters, deduplicated by a packed 64-bit key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDescriptor {
    /// Minification filter
    pub min_filter: FilterMode,
    /// Magnification filter
    pub mag_filter: FilterMode,
    /// Mipmap filter
    pub mipmap_filter: MipmapFilter,
    /// Wrapping along U
    pub wrap_u: WrapMode,
    /// Wrapping along V
    pub wrap_v: WrapMode,
    /// Wrapping along W
    pub wrap_w: WrapMode,
    /// Maximum anisotropy (1 disables)
    pub max_anisotropy: u8,
    /// Lowest mip sampled
    pub min_lod: u8,
    /// Highest mip sampled
    pub max_lod: u8,
    /// Depth comparison for shadow samplers
    pub compare: Option<CompareMode>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mipmap_filter: MipmapFilter::None,
            wrap_u: WrapMode::Clamp,
            wrap_v: WrapMode::Clamp,
            wrap_w: WrapMode::Clamp,
            max_anisotropy: 1,
            min_lod: 0,
            max_lod: u8::MAX,
            compare: None,
        }
    }
}

impl SamplerDescriptor {
    /// Pack every field into a collision-free 64-bit key
    pub fn key(&self) -> u64 {
        let mut key = 0u64;
        let mut shift = 0u32;
        let mut push = |value: u64, bits: u32| {
            key |= value << shift;
            shift += bits;
        };

        push(self.min_filter as u64, 1);
        push(self.mag_filter as u64, 1);
        push(self.mipmap_filter as u64, 2);
        push(self.wrap_u as u64, 3);
        push(self.wrap_v as u64, 3);
        push(self.wrap_w as u64, 3);
        push(u64::from(self.max_anisotropy), 8);
        push(u64::from(self.min_lod), 8);
        push(u64::from(self.max_lod), 8);
        push(self.compare.map_or(0, |mode| mode.bits() + 1), 4);
        key
    }
}

/// Immutable depth/stencil object parameters
///
/// The stencil reference value is dynamic state and not part of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthStencilDescriptor {
    /// Depth test
    pub depth: DepthState,
    /// Stencil action on pass
    pub stencil_action: StencilAction,
    /// Stencil comparison
    pub stencil_compare: CompareMode,
    /// Stencil read mask
    pub stencil_read_mask: u8,
    /// Stencil write mask
    pub stencil_write_mask: u8,
}

impl DepthStencilDescriptor {
    /// Pack every field into a collision-free 64-bit key
    pub fn key(&self) -> u64 {
        self.depth.compare.bits()
            | u64::from(self.depth.write) << 3
            | self.stencil_action.bits() << 4
            | self.stencil_compare.bits() << 7
            | u64::from(self.stencil_read_mask) << 10
            | u64::from(self.stencil_write_mask) << 18
    }
}

/// How an attachment's previous contents are treated when a pass begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadAction {
    /// Preserve previous contents
    #[default]
    Load,
    /// Clear to the attachment's clear value
    Clear,
    /// Contents are undefined
    DontCare,
}

/// How an attachment's contents are treated when a pass ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreAction {
    /// Keep the rendered contents
    #[default]
    Store,
    /// Contents may be discarded
    DontCare,
    /// Resolve multisampled contents into the resolve target, discard samples
    MultisampleResolve,
    /// Resolve and keep the multisampled contents
    StoreAndMultisampleResolve,
}

/// Store actions chosen for every attachment of a render pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachmentStoreActions {
    /// One per color attachment
    pub colors: Vec<StoreAction>,
    /// Depth attachment
    pub depth: StoreAction,
    /// Stencil attachment
    pub stencil: StoreAction,
}

/// Color attachment of a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct ColorAttachment {
    /// Target texture
    pub texture: TextureId,
    /// Array layer, cube face or volume slice
    pub slice: u32,
    /// Mip level
    pub mip: u32,
    /// Single-sampled texture receiving the resolve
    pub resolve: Option<TextureId>,
    /// Load action
    pub load: LoadAction,
    /// Clear value used with [`LoadAction::Clear`]
    pub clear: Color,
}

/// Depth/stencil attachment of a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct DepthStencilAttachment {
    /// Target texture
    pub texture: TextureId,
    /// Depth load action
    pub depth_load: LoadAction,
    /// Depth clear value
    pub clear_depth: f64,
    /// Stencil load action
    pub stencil_load: LoadAction,
    /// Stencil clear value
    pub clear_stencil: u32,
}

/// Attachments and load actions for a render encoder
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    /// Color attachments
    pub colors: Vec<ColorAttachment>,
    /// Optional depth/stencil attachment
    pub depth_stencil: Option<DepthStencilAttachment>,
    /// Render area width
    pub width: u32,
    /// Render area height
    pub height: u32,
}

/// Default render target provided by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backbuffer {
    /// Single-sampled color target, the one that is presented
    pub color: TextureId,
    /// Multisampled color target resolved into `color`
    pub msaa_color: Option<TextureId>,
    /// Depth/stencil target
    pub depth_stencil: Option<TextureId>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Vertex buffer bound for a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    /// Binding slot
    pub slot: u32,
    /// Source buffer
    pub buffer: BufferId,
    /// Byte offset
    pub offset: u64,
}

/// Non-indexed draw
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DrawCommand {
    /// Topology
    pub primitive: PrimitiveType,
    /// First vertex
    pub vertex_start: u32,
    /// Vertex count
    pub vertex_count: u32,
    /// Instance count
    pub instance_count: u32,
    /// Vertex buffers
    pub vertex_buffers: Vec<VertexBufferBinding>,
}

/// Indexed draw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawIndexedCommand {
    /// Topology
    pub primitive: PrimitiveType,
    /// First index
    pub index_start: u32,
    /// Index count
    pub index_count: u32,
    /// Instance count
    pub instance_count: u32,
    /// Added to each index
    pub base_vertex: i32,
    /// Index buffer
    pub index_buffer: BufferId,
    /// Byte offset into the index buffer
    pub index_offset: u64,
    /// Index element size
    pub index_format: IndexFormat,
    /// Vertex buffers
    pub vertex_buffers: Vec<VertexBufferBinding>,
}

/// In-pass clear of the current attachments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClearValues {
    /// Per color attachment, `None` leaves it untouched
    pub colors: Vec<Option<Color>>,
    /// Depth clear
    pub depth: Option<f64>,
    /// Stencil clear
    pub stencil: Option<u32>,
}

/// Buffer-to-buffer copy region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    /// Source offset
    pub src_offset: u64,
    /// Destination offset
    pub dst_offset: u64,
    /// Byte count
    pub size: u64,
}

/// Buffer-to-texture or texture-to-buffer copy region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTextureCopy {
    /// Byte offset into the buffer
    pub buffer_offset: u64,
    /// Bytes between rows in the buffer
    pub bytes_per_row: u32,
    /// Texel region
    pub region: Rect,
    /// Array layer, cube face or volume slice
    pub slice: u32,
    /// Mip level
    pub mip: u32,
}

/// Resource bound to a texture unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitBinding {
    /// Sampled texture
    Texture {
        /// Texture
        texture: TextureId,
        /// Dimensionality the unit expects
        texture_type: TextureType,
        /// Sampler state
        sampler: SamplerId,
    },
    /// Texel buffer view
    TexelBuffer(BufferId),
}

/// Shader source for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderCode {
    /// SPIR-V words
    Spirv(Vec<u32>),
    /// High level source for backends that compile at runtime
    Source(String),
}

impl ShaderCode {
    /// Whether there is no code at all
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Spirv(words) => words.is_empty(),
            Self::Source(text) => text.trim().is_empty(),
        }
    }
}

/// One stage of a shader program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageSource {
    /// Pipeline stage
    pub stage: ShaderStage,
    /// Code
    pub code: ShaderCode,
    /// Entry point
    pub entry_point: String,
}

impl ShaderStageSource {
    /// Stage with the conventional `main` entry point
    pub fn new(stage: ShaderStage, code: ShaderCode) -> Self {
        Self {
            stage,
            code,
            entry_point: "main".to_string(),
        }
    }
}

/// Program link request
#[derive(Debug, Clone, Copy)]
pub struct ProgramDesc<'a> {
    /// Debug label
    pub label: &'a str,
    /// Stages
    pub stages: &'a [ShaderStageSource],
    /// Declared interface
    pub reflection: &'a ShaderReflection,
}

/// Uniform the linker reports as active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUniform {
    /// Name as reported, possibly with an array suffix
    pub name: String,
    /// Native location
    pub location: i32,
    /// Array length
    pub count: usize,
}

/// Result of a successful link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedProgram {
    /// Program handle
    pub program: ProgramId,
    /// Active uniforms, including opaque resource uniforms
    pub uniforms: Vec<ActiveUniform>,
    /// Active storage blocks, by name
    pub storage_blocks: Vec<String>,
    /// Non-fatal linker output
    pub log: String,
}

/// Uniform data handed to the backend for one update
#[derive(Debug, Clone, Copy)]
pub struct UniformUpload<'a> {
    /// Base type
    pub base_type: UniformType,
    /// Components per element for scalar/vector types
    pub components: u32,
    /// Matrix dimensions for matrix types
    pub matrix: MatrixSize,
    /// Number of array elements to upload
    pub count: usize,
    /// Raw data, `count` elements
    pub words: &'a [u32],
}

/// Capability interface every GPU backend implements
///
/// Recording calls (`set_*`, `draw*`, `copy_*`) take the encoder they record
/// into and cannot fail; a backend that detects misuse logs it and skips the
/// command. Calls that talk to the device return [`RenderResult`] and report
/// [`RenderError::DeviceLost`](super::RenderError::DeviceLost) once the device
/// is gone.
pub trait GpuBackend: 'static {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Default render target
    fn backbuffer(&self) -> Backbuffer;

    /// Start recording a new command buffer
    fn begin_command_buffer(&mut self) -> RenderResult<CommandBufferId>;

    /// Submit a finished command buffer; its completion is reported as `index`
    fn submit_command_buffer(
        &mut self,
        cmd: CommandBufferId,
        index: u64,
        mode: SubmitMode,
    ) -> RenderResult<()>;

    /// Highest command buffer index the GPU has finished executing
    fn completed_index(&mut self) -> RenderResult<u64>;

    /// Return a completed command buffer to the backend for reuse
    fn release_command_buffer(&mut self, cmd: CommandBufferId);

    /// Block until every submitted command buffer has completed
    fn wait_idle(&mut self) -> RenderResult<()>;

    /// Open an encoder; `pass` is required for render encoders
    fn begin_encoder(
        &mut self,
        cmd: CommandBufferId,
        kind: EncoderKind,
        pass: Option<&RenderPassDesc>,
    ) -> RenderResult<EncoderId>;

    /// Close an encoder; render encoders receive their final store actions
    fn end_encoder(&mut self, encoder: EncoderId, store: Option<&AttachmentStoreActions>);

    /// Set the viewport
    fn set_viewport(&mut self, encoder: EncoderId, viewport: &Viewport);

    /// Set the scissor rectangle, `None` covers the whole target
    fn set_scissor(&mut self, encoder: EncoderId, scissor: Option<Rect>);

    /// Set the blend equation
    fn set_blend_state(&mut self, encoder: EncoderId, blend: &BlendState);

    /// Set the color write mask
    fn set_color_mask(&mut self, encoder: EncoderId, mask: ColorChannelMask);

    /// Bind a depth/stencil object together with the dynamic stencil reference
    fn set_depth_stencil_state(&mut self, encoder: EncoderId, state: DepthStencilId, reference: u32);

    /// Set face culling
    fn set_cull_mode(&mut self, encoder: EncoderId, mode: CullMode);

    /// Set front face winding
    fn set_front_face(&mut self, encoder: EncoderId, winding: Winding);

    /// Toggle wireframe rasterization
    fn set_wireframe(&mut self, encoder: EncoderId, enabled: bool);

    /// Bind a program for subsequent draws or dispatches
    fn bind_program(&mut self, encoder: EncoderId, program: ProgramId);

    /// Record a draw
    fn draw(&mut self, encoder: EncoderId, draw: &DrawCommand);

    /// Record an indexed draw
    fn draw_indexed(&mut self, encoder: EncoderId, draw: &DrawIndexedCommand);

    /// Clear attachments of the current render pass
    fn clear_attachments(&mut self, encoder: EncoderId, clear: &ClearValues);

    /// Record a compute dispatch
    fn dispatch(&mut self, encoder: EncoderId, groups: [u32; 3]);

    /// Record a buffer-to-buffer copy
    fn copy_buffer(&mut self, encoder: EncoderId, src: BufferId, dst: BufferId, region: &BufferCopy);

    /// Record a zero fill of a buffer range
    fn fill_buffer_zero(&mut self, encoder: EncoderId, dst: BufferId, offset: u64, size: u64);

    /// Record a buffer-to-texture copy
    fn copy_buffer_to_texture(
        &mut self,
        encoder: EncoderId,
        src: BufferId,
        dst: TextureId,
        region: &BufferTextureCopy,
    );

    /// Record a texture-to-buffer copy
    fn copy_texture_to_buffer(
        &mut self,
        encoder: EncoderId,
        src: TextureId,
        dst: BufferId,
        region: &BufferTextureCopy,
    );

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId>;

    /// Destroy a buffer immediately
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Whether a host-visible buffer's memory is coherent
    fn is_coherent(&self, buffer: BufferId) -> bool;

    /// CPU view of a host-visible buffer
    fn mapped_range(&self, buffer: BufferId, offset: u64, size: u64) -> Option<&[u8]>;

    /// Writable CPU view of a host-visible buffer
    fn mapped_range_mut(&mut self, buffer: BufferId, offset: u64, size: u64) -> Option<&mut [u8]>;

    /// Make host writes to a non-coherent range visible to the device
    fn flush_mapped_range(&mut self, buffer: BufferId, offset: u64, size: u64);

    /// Make device writes to a non-coherent range visible to the host
    fn invalidate_mapped_range(&mut self, buffer: BufferId, offset: u64, size: u64);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId>;

    /// Destroy a texture immediately
    fn destroy_texture(&mut self, texture: TextureId);

    /// Create a sampler object
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RenderResult<SamplerId>;

    /// Destroy a sampler object
    fn destroy_sampler(&mut self, sampler: SamplerId);

    /// Create a depth/stencil object
    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> RenderResult<DepthStencilId>;

    /// Destroy a depth/stencil object
    fn destroy_depth_stencil_state(&mut self, state: DepthStencilId);

    /// Compile and link a program
    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> RenderResult<LinkedProgram>;

    /// Destroy a program
    fn destroy_program(&mut self, program: ProgramId);

    /// Upload uniform data to a program location
    fn set_uniform(&mut self, program: ProgramId, location: i32, upload: &UniformUpload<'_>);

    /// Bind a resource to a texture unit
    fn bind_texture_unit(&mut self, unit: u32, binding: UnitBinding);

    /// Bind a storage texture, `None` unbinds
    fn bind_storage_texture(
        &mut self,
        binding: u32,
        texture: Option<TextureId>,
        access: Access,
        format: PixelFormat,
    );

    /// Bind a storage buffer, `None` unbinds
    fn bind_storage_buffer(&mut self, binding: u32, buffer: Option<BufferId>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_keys_are_distinct() {
        let base = SamplerDescriptor::default();
        let nearest = SamplerDescriptor {
            min_filter: FilterMode::Nearest,
            ..base
        };
        let shadow = SamplerDescriptor {
            compare: Some(CompareMode::Less),
            ..base
        };
        let repeat_w = SamplerDescriptor {
            wrap_w: WrapMode::Repeat,
            ..base
        };

        assert_eq!(base.key(), SamplerDescriptor::default().key());
        assert_ne!(base.key(), nearest.key());
        assert_ne!(base.key(), shadow.key());
        assert_ne!(base.key(), repeat_w.key());
        assert_ne!(nearest.key(), repeat_w.key());
    }

    #[test]
    fn test_depth_stencil_key_ignores_nothing() {
        let base = DepthStencilDescriptor::default();
        let write = DepthStencilDescriptor {
            depth: DepthState {
                compare: CompareMode::Always,
                write: true,
            },
            ..base
        };
        let masked = DepthStencilDescriptor {
            stencil_write_mask: 0x0F,
            ..base
        };
        assert_ne!(base.key(), write.key());
        assert_ne!(base.key(), masked.key());
        assert_ne!(write.key(), masked.key());
    }
}

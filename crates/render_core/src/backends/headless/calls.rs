//! Record of every call the core made into the headless backend

use crate::render::backend::{
    AttachmentStoreActions, BufferCopy, BufferId, BufferTextureCopy, DepthStencilId, EncoderKind,
    MemoryLocation, ProgramId, SamplerId, SubmitMode, TextureId, UnitBinding,
};
use crate::render::types::{BlendState, ColorChannelMask, CullMode, Rect, Viewport, Winding};

/// One backend call, in the order the core issued it
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// Command buffer opened
    BeginCommandBuffer,
    /// Command buffer submitted
    Submit {
        /// Completion index
        index: u64,
        /// Submission mode
        mode: SubmitMode,
    },
    /// Encoder opened
    BeginEncoder {
        /// Encoder kind
        kind: EncoderKind,
    },
    /// Encoder closed
    EndEncoder {
        /// Encoder kind
        kind: EncoderKind,
        /// Store actions for render encoders
        store: Option<AttachmentStoreActions>,
    },
    /// Viewport set
    SetViewport(Viewport),
    /// Scissor set
    SetScissor(Option<Rect>),
    /// Blend state set
    SetBlend(BlendState),
    /// Color mask set
    SetColorMask(ColorChannelMask),
    /// Depth/stencil object bound
    SetDepthStencil {
        /// Object
        state: DepthStencilId,
        /// Stencil reference
        reference: u32,
    },
    /// Cull mode set
    SetCullMode(CullMode),
    /// Front face set
    SetFrontFace(Winding),
    /// Wireframe toggled
    SetWireframe(bool),
    /// Program bound to an encoder
    BindProgram(ProgramId),
    /// Draw recorded
    Draw {
        /// Vertices
        vertex_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Indexed draw recorded
    DrawIndexed {
        /// Indices
        index_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// In-pass clear recorded
    ClearAttachments,
    /// Dispatch recorded
    Dispatch([u32; 3]),
    /// Buffer copy recorded
    CopyBuffer {
        /// Source
        src: BufferId,
        /// Destination
        dst: BufferId,
        /// Region
        region: BufferCopy,
    },
    /// Zero fill recorded
    FillZero {
        /// Destination
        dst: BufferId,
        /// Offset
        offset: u64,
        /// Size
        size: u64,
    },
    /// Buffer-to-texture copy recorded
    CopyBufferToTexture {
        /// Destination
        dst: TextureId,
        /// Region
        region: BufferTextureCopy,
    },
    /// Texture-to-buffer copy recorded
    CopyTextureToBuffer {
        /// Source
        src: TextureId,
        /// Region
        region: BufferTextureCopy,
    },
    /// Buffer created
    CreateBuffer {
        /// Handle
        id: BufferId,
        /// Size
        size: u64,
        /// Placement
        location: MemoryLocation,
        /// Dedicated allocation requested
        dedicated: bool,
    },
    /// Buffer destroyed
    DestroyBuffer(BufferId),
    /// Texture created
    CreateTexture(TextureId),
    /// Texture destroyed
    DestroyTexture(TextureId),
    /// Sampler created
    CreateSampler(SamplerId),
    /// Sampler destroyed
    DestroySampler(SamplerId),
    /// Depth/stencil object created
    CreateDepthStencil(DepthStencilId),
    /// Depth/stencil object destroyed
    DestroyDepthStencil(DepthStencilId),
    /// Program linked
    CreateProgram(ProgramId),
    /// Program destroyed
    DestroyProgram(ProgramId),
    /// Uniform uploaded
    SetUniform {
        /// Program
        program: ProgramId,
        /// Location
        location: i32,
        /// Raw words uploaded
        words: Vec<u32>,
    },
    /// Texture unit bound
    BindTextureUnit {
        /// Unit
        unit: u32,
        /// Resource
        binding: UnitBinding,
    },
    /// Storage texture bound
    BindStorageTexture {
        /// Binding index
        binding: u32,
        /// Texture
        texture: Option<TextureId>,
    },
    /// Storage buffer bound
    BindStorageBuffer {
        /// Binding index
        binding: u32,
        /// Buffer
        buffer: Option<BufferId>,
    },
    /// Mapped range flushed
    FlushMapped {
        /// Buffer
        buffer: BufferId,
        /// Offset
        offset: u64,
        /// Size
        size: u64,
    },
    /// Mapped range invalidated
    InvalidateMapped {
        /// Buffer
        buffer: BufferId,
        /// Offset
        offset: u64,
        /// Size
        size: u64,
    },
}

//! GPU buffers: creation, mapping, fills and copies
//!
//! Only readback buffers live in host-visible memory. Every other buffer is
//! device-local and written through a staging buffer whose copy is recorded
//! into the blit encoder, so writes are ordered with the rest of the frame's
//! GPU work. Staging buffers are released through the deferred queue.

use log::{debug, warn};

use super::staging::TransferContext;
use crate::render::backend::{BufferCopy, BufferDesc, BufferId, GpuBackend, MemoryLocation};
use crate::render::shader::BoundBuffer;
use crate::render::types::{BufferUsageFlags, PixelFormat};
use crate::render::{RenderError, RenderResult};

/// Expected update pattern of a buffer's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferDataUsage {
    /// Written once, drawn many times
    #[default]
    Static,
    /// Updated occasionally
    Dynamic,
    /// Updated every frame
    Stream,
    /// Written by the GPU, read back by the CPU
    Readback,
}

/// How a mapping will be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapType {
    /// CPU writes, previous contents of the range are discarded
    WriteInvalidate,
    /// CPU reads GPU-written contents
    ReadOnly,
}

/// Buffer creation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSettings {
    /// GPU usage
    pub usage: BufferUsageFlags,
    /// Update pattern
    pub data_usage: BufferDataUsage,
    /// Contents can never change after creation
    pub immutable: bool,
    /// Clear to zero at creation
    pub zero_initialize: bool,
    /// Element format for texel buffer views
    pub texel_format: Option<PixelFormat>,
    /// Debug label
    pub label: Option<String>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            usage: BufferUsageFlags::VERTEX,
            data_usage: BufferDataUsage::Static,
            immutable: false,
            zero_initialize: true,
            texel_format: None,
            label: None,
        }
    }
}

impl BufferSettings {
    /// Settings for a buffer with the given usage
    pub fn new(usage: BufferUsageFlags) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    /// Set the update pattern
    #[must_use]
    pub fn with_data_usage(mut self, data_usage: BufferDataUsage) -> Self {
        self.data_usage = data_usage;
        self
    }

    /// Forbid updates after creation
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Enable or disable zero initialization
    #[must_use]
    pub fn with_zero_initialize(mut self, enabled: bool) -> Self {
        self.zero_initialize = enabled;
        self
    }

    /// Set the texel buffer element format
    #[must_use]
    pub fn with_texel_format(mut self, format: PixelFormat) -> Self {
        self.texel_format = Some(format);
        self
    }

    /// Set the debug label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether the buffer is used for readback
    pub fn is_readback(&self) -> bool {
        self.data_usage == BufferDataUsage::Readback
    }

    /// Backend creation parameters for a buffer of `size` bytes
    pub fn descriptor(&self, size: u64) -> BufferDesc {
        let location = if self.is_readback() {
            MemoryLocation::HostReadback
        } else {
            MemoryLocation::DeviceLocal
        };
        let dedicated = !self.is_readback()
            && self
                .usage
                .intersects(BufferUsageFlags::TEXEL | BufferUsageFlags::SHADER_STORAGE);

        BufferDesc {
            size,
            usage: self.usage | BufferUsageFlags::COPY_SOURCE | BufferUsageFlags::COPY_DEST,
            location,
            dedicated,
            texel_format: self.texel_format,
            label: self.label.clone(),
        }
    }
}

/// Range handed to the caller by [`Buffer::begin_map`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapTarget {
    /// Buffer whose memory is exposed, the buffer itself or a staging buffer
    pub buffer: BufferId,
    /// Offset within `buffer`
    pub offset: u64,
    /// Length of the mapping
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    map_type: MapType,
    offset: u64,
    size: u64,
    staging: Option<BufferId>,
}

/// A GPU buffer and its CPU-side bookkeeping
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    size: u64,
    settings: BufferSettings,
    coherent: bool,
    mapping: Option<Mapping>,
}

impl Buffer {
    /// Create a buffer, optionally filled with `data` from offset 0
    ///
    /// With zero initialization enabled, bytes not covered by `data` are cleared.
    pub fn create<B: GpuBackend>(
        ctx: &mut TransferContext<'_, B>,
        size: u64,
        settings: BufferSettings,
        data: Option<&[u8]>,
    ) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::ResourceCreationFailed(
                "Buffer size must be non-zero".to_string(),
            ));
        }
        if settings.usage.contains(BufferUsageFlags::TEXEL) && settings.texel_format.is_none() {
            return Err(RenderError::ResourceCreationFailed(
                "Texel buffers need an element format".to_string(),
            ));
        }
        if settings.immutable && data.is_none() {
            return Err(RenderError::ResourceCreationFailed(
                "Immutable buffers need initial data".to_string(),
            ));
        }
        let data_len = data.map_or(0, <[u8]>::len) as u64;
        if data_len > size {
            return Err(RenderError::ResourceCreationFailed(format!(
                "Initial data ({data_len} bytes) exceeds buffer size ({size} bytes)"
            )));
        }

        let desc = settings.descriptor(size);
        debug!(
            "Creating buffer: {} bytes, {:?}, {:?}{}",
            size,
            desc.usage,
            desc.location,
            if desc.dedicated { ", dedicated" } else { "" }
        );
        let id = ctx.backend.create_buffer(&desc)?;
        let buffer = Self {
            id,
            size,
            coherent: ctx.backend.is_coherent(id),
            settings,
            mapping: None,
        };

        if buffer.settings.zero_initialize && data_len < size {
            if buffer.settings.is_readback() {
                let zeros = vec![0u8; (size - data_len) as usize];
                ctx.write_host_visible(id, data_len, &zeros)?;
            } else {
                let encoder = ctx.blit_encoder()?;
                ctx.backend.fill_buffer_zero(encoder, id, data_len, size - data_len);
            }
        }

        if let Some(data) = data.filter(|d| !d.is_empty()) {
            buffer.upload(ctx, 0, data)?;
        }

        Ok(buffer)
    }

    /// Backend handle
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Creation settings
    pub const fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    /// Whether the buffer memory is host-coherent
    pub const fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Whether a mapping is open
    pub const fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Buffer as seen by shader slots
    pub fn bound(&self) -> BoundBuffer {
        BoundBuffer {
            id: self.id,
            usage: self.settings.usage,
        }
    }

    fn check_range(&self, offset: u64, size: u64) -> RenderResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RenderError::InvalidResourceState(format!(
                "Range {}..{} is outside buffer of {} bytes",
                offset,
                offset.saturating_add(size),
                self.size
            ))),
        }
    }

    /// Open a mapping of `size` bytes at `offset`
    ///
    /// Refused, in this order, when: the size is zero; a write mapping targets
    /// an immutable or readback buffer; a read mapping targets a buffer not
    /// created for readback; the range is out of bounds; a mapping is already
    /// open. Readback buffers expose their own memory (invalidated first if
    /// not coherent). Other buffers expose a fresh staging buffer.
    pub fn begin_map<B: GpuBackend>(
        &mut self,
        ctx: &mut TransferContext<'_, B>,
        map_type: MapType,
        offset: u64,
        size: u64,
    ) -> RenderResult<MapTarget> {
        if size == 0 {
            return Err(RenderError::InvalidResourceState("Cannot map zero bytes".to_string()));
        }
        if map_type == MapType::WriteInvalidate && (self.settings.immutable || self.settings.is_readback()) {
            return Err(RenderError::InvalidResourceState(
                "Write mapping requires a mutable, non-readback buffer".to_string(),
            ));
        }
        if map_type == MapType::ReadOnly && !self.settings.is_readback() {
            return Err(RenderError::InvalidResourceState(
                "Read mapping requires a readback buffer".to_string(),
            ));
        }
        self.check_range(offset, size)?;
        if self.mapping.is_some() {
            return Err(RenderError::InvalidResourceState("Buffer is already mapped".to_string()));
        }

        let target = if self.settings.is_readback() {
            if !self.coherent {
                ctx.backend.invalidate_mapped_range(self.id, offset, size);
            }
            self.mapping = Some(Mapping {
                map_type,
                offset,
                size,
                staging: None,
            });
            MapTarget {
                buffer: self.id,
                offset,
                size,
            }
        } else {
            let staging = ctx.create_staging(size, MemoryLocation::HostUpload)?;
            self.mapping = Some(Mapping {
                map_type,
                offset,
                size,
                staging: Some(staging),
            });
            MapTarget {
                buffer: staging,
                offset: 0,
                size,
            }
        };

        Ok(target)
    }

    /// Close the mapping, committing `used_size` bytes written at `used_offset`
    ///
    /// `used_offset` is in buffer coordinates. The used range is clamped to the
    /// mapped range; the staging bytes at `used_offset - mapped_offset` are
    /// copied to `used_offset` in this buffer.
    pub fn end_map<B: GpuBackend>(
        &mut self,
        ctx: &mut TransferContext<'_, B>,
        used_offset: u64,
        used_size: u64,
    ) -> RenderResult<()> {
        let mapping = self
            .mapping
            .take()
            .ok_or_else(|| RenderError::InvalidResourceState("Buffer is not mapped".to_string()))?;

        let Some(staging) = mapping.staging else {
            return Ok(());
        };

        let start = used_offset.clamp(mapping.offset, mapping.offset + mapping.size);
        let end = used_offset
            .saturating_add(used_size)
            .clamp(start, mapping.offset + mapping.size);
        let size = end - start;
        ctx.release_buffer_after_pending(staging);

        if size > 0 && mapping.map_type == MapType::WriteInvalidate {
            let src_offset = start - mapping.offset;
            if !ctx.backend.is_coherent(staging) {
                ctx.backend.flush_mapped_range(staging, src_offset, size);
            }
            let encoder = ctx.blit_encoder()?;
            ctx.backend.copy_buffer(
                encoder,
                staging,
                self.id,
                &BufferCopy {
                    src_offset,
                    dst_offset: start,
                    size,
                },
            );
        }
        Ok(())
    }

    /// Write `data` at `offset` through a one-shot staging buffer
    ///
    /// Refused when the data is empty, the buffer is immutable or a readback
    /// buffer, or the range is out of bounds.
    pub fn fill<B: GpuBackend>(
        &mut self,
        ctx: &mut TransferContext<'_, B>,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        if data.is_empty() {
            return Err(RenderError::InvalidResourceState("Cannot fill zero bytes".to_string()));
        }
        if self.settings.immutable {
            return Err(RenderError::InvalidResourceState("Cannot fill an immutable buffer".to_string()));
        }
        if self.settings.is_readback() {
            return Err(RenderError::InvalidResourceState("Cannot fill a readback buffer".to_string()));
        }
        self.check_range(offset, data.len() as u64)?;

        self.upload(ctx, offset, data)
    }

    fn upload<B: GpuBackend>(&self, ctx: &mut TransferContext<'_, B>, offset: u64, data: &[u8]) -> RenderResult<()> {
        if self.settings.is_readback() {
            return ctx.write_host_visible(self.id, offset, data);
        }

        let staging = ctx.stage_upload(data)?;
        let encoder = ctx.blit_encoder()?;
        ctx.backend.copy_buffer(
            encoder,
            staging,
            self.id,
            &BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size: data.len() as u64,
            },
        );
        Ok(())
    }

    /// Record a GPU copy of `size` bytes into `dst`
    pub fn copy_to<B: GpuBackend>(
        &self,
        ctx: &mut TransferContext<'_, B>,
        dst: &Self,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> RenderResult<()> {
        if size == 0 {
            return Err(RenderError::InvalidResourceState("Cannot copy zero bytes".to_string()));
        }
        if dst.settings.immutable {
            return Err(RenderError::InvalidResourceState("Cannot copy into an immutable buffer".to_string()));
        }
        self.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;

        let encoder = ctx.blit_encoder()?;
        ctx.backend.copy_buffer(
            encoder,
            self.id,
            dst.id,
            &BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        );
        Ok(())
    }

    /// Queue destruction once the command buffer being recorded completes
    pub fn release<B: GpuBackend>(mut self, ctx: &mut TransferContext<'_, B>) {
        if let Some(mapping) = self.mapping.take() {
            warn!("Releasing buffer {:?} while mapped", self.id);
            if let Some(staging) = mapping.staging {
                ctx.release_buffer_after_pending(staging);
            }
        }
        ctx.release_buffer_after_pending(self.id);
    }
}

//! Asynchronous GPU-to-CPU readback
//!
//! A readback records a copy into a host-readback staging buffer and resolves
//! once the command buffer carrying the copy completes. Nothing blocks.

use log::debug;

use super::buffer::Buffer;
use super::staging::TransferContext;
use super::texture::Texture;
use crate::render::backend::{BufferCopy, BufferId, BufferTextureCopy, GpuBackend, MemoryLocation};
use crate::render::types::Rect;
use crate::render::{RenderError, RenderResult};

slotmap::new_key_type! {
    /// Handle to an outstanding readback
    pub struct ReadbackId;
}

/// State of a readback request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadbackStatus {
    /// The copy has not completed yet
    Pending,
    /// Copied bytes, tightly packed
    Complete(Vec<u8>),
}

/// An in-flight readback
#[derive(Debug)]
pub struct Readback {
    staging: BufferId,
    size: u64,
    index: u64,
}

impl Readback {
    /// Read `size` bytes at `offset` of `src`
    pub fn from_buffer<B: GpuBackend>(
        ctx: &mut TransferContext<'_, B>,
        src: &Buffer,
        offset: u64,
        size: u64,
    ) -> RenderResult<Self> {
        if size == 0 || offset.checked_add(size).map_or(true, |end| end > src.size()) {
            return Err(RenderError::InvalidResourceState(format!(
                "Readback range {}+{} is outside buffer of {} bytes",
                offset,
                size,
                src.size()
            )));
        }

        let staging = ctx.create_staging(size, MemoryLocation::HostReadback)?;
        let encoder = ctx.staging_blit_encoder(staging)?;
        ctx.backend.copy_buffer(
            encoder,
            src.id(),
            staging,
            &BufferCopy {
                src_offset: offset,
                dst_offset: 0,
                size,
            },
        );

        Ok(Self::pending(ctx, staging, size))
    }

    /// Read `region` of `slice`/`mip` of `src`
    pub fn from_texture<B: GpuBackend>(
        ctx: &mut TransferContext<'_, B>,
        src: &Texture,
        region: Rect,
        slice: u32,
        mip: u32,
    ) -> RenderResult<Self> {
        let size = src.validate_region(region, slice, mip)?;

        let staging = ctx.create_staging(size, MemoryLocation::HostReadback)?;
        let encoder = ctx.staging_blit_encoder(staging)?;
        ctx.backend.copy_texture_to_buffer(
            encoder,
            src.id(),
            staging,
            &BufferTextureCopy {
                buffer_offset: 0,
                bytes_per_row: region.w * src.settings().format.bytes_per_pixel(),
                region,
                slice,
                mip,
            },
        );

        Ok(Self::pending(ctx, staging, size))
    }

    fn pending<B: GpuBackend>(ctx: &TransferContext<'_, B>, staging: BufferId, size: u64) -> Self {
        let index = ctx.pending_index();
        debug!("Readback of {} bytes resolves at index {}", size, index);
        Self { staging, size, index }
    }

    /// Command buffer index the readback waits for
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Staging buffer holding the result
    pub const fn staging(&self) -> BufferId {
        self.staging
    }

    /// Copy the result out once `completed` covers the readback's index
    pub fn try_read<B: GpuBackend>(&self, backend: &mut B, completed: u64) -> ReadbackStatus {
        if completed < self.index {
            return ReadbackStatus::Pending;
        }
        if !backend.is_coherent(self.staging) {
            backend.invalidate_mapped_range(self.staging, 0, self.size);
        }
        backend
            .mapped_range(self.staging, 0, self.size)
            .map_or(ReadbackStatus::Pending, |bytes| ReadbackStatus::Complete(bytes.to_vec()))
    }
}

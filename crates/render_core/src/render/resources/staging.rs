//! Staging buffers and the state every upload/download path needs

use log::trace;

use super::deferred::DeferredQueue;
use crate::render::backend::{BufferDesc, BufferId, EncoderId, EncoderKind, GpuBackend, MemoryLocation, TextureId};
use crate::render::commands::CommandStream;
use crate::render::types::BufferUsageFlags;
use crate::render::{RenderError, RenderResult};

/// Borrowed view of the backend, command stream and cleanup queue
///
/// Transfers record into the blit encoder of the open command buffer; any
/// temporary they create is released once that command buffer completes.
pub struct TransferContext<'a, B: GpuBackend> {
    /// Backend
    pub backend: &'a mut B,
    /// Command stream
    pub stream: &'a mut CommandStream,
    /// Cleanup queue
    pub deferred: &'a mut DeferredQueue<B>,
}

impl<'a, B: GpuBackend> TransferContext<'a, B> {
    /// Bundle the pieces
    pub fn new(backend: &'a mut B, stream: &'a mut CommandStream, deferred: &'a mut DeferredQueue<B>) -> Self {
        Self {
            backend,
            stream,
            deferred,
        }
    }

    /// Index of the command buffer currently being recorded
    pub fn pending_index(&self) -> u64 {
        self.stream.pending_index()
    }

    /// Blit encoder of the open command buffer
    pub fn blit_encoder(&mut self) -> RenderResult<EncoderId> {
        Ok(self.stream.use_encoder(&mut *self.backend, EncoderKind::Blit, None)?.id)
    }

    /// Create a host-visible staging buffer of `size` bytes
    pub fn create_staging(&mut self, size: u64, location: MemoryLocation) -> RenderResult<BufferId> {
        self.backend.create_buffer(&BufferDesc {
            size,
            usage: BufferUsageFlags::COPY_SOURCE | BufferUsageFlags::COPY_DEST,
            location,
            dedicated: false,
            texel_format: None,
            label: Some("staging".to_string()),
        })
    }

    /// Create an upload staging buffer holding `data`
    ///
    /// Its release is queued against the command buffer being recorded as soon
    /// as it exists, so the caller must not release it again.
    pub fn stage_upload(&mut self, data: &[u8]) -> RenderResult<BufferId> {
        let size = data.len() as u64;
        let staging = self.create_staging(size, MemoryLocation::HostUpload)?;
        self.release_buffer_after_pending(staging);
        self.write_host_visible(staging, 0, data)?;
        Ok(staging)
    }

    /// Blit encoder for a copy into or out of `staging`, destroying it if no encoder can be opened
    pub fn staging_blit_encoder(&mut self, staging: BufferId) -> RenderResult<EncoderId> {
        self.blit_encoder().map_err(|error| {
            self.backend.destroy_buffer(staging);
            error
        })
    }

    /// Copy `data` into a host-visible buffer and flush if the memory is not coherent
    pub fn write_host_visible(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        let size = data.len() as u64;
        let view = self.backend.mapped_range_mut(buffer, offset, size).ok_or_else(|| {
            RenderError::InvalidResourceState(format!("Buffer {buffer:?} is not host visible"))
        })?;
        view.copy_from_slice(data);

        if !self.backend.is_coherent(buffer) {
            self.backend.flush_mapped_range(buffer, offset, size);
        }
        Ok(())
    }

    /// Destroy `buffer` once the command buffer being recorded completes
    pub fn release_buffer_after_pending(&mut self, buffer: BufferId) {
        let index = self.pending_index();
        trace!("Buffer {:?} released at index {}", buffer, index);
        self.deferred
            .queue_cleanup(index, move |backend: &mut B| backend.destroy_buffer(buffer));
    }

    /// Destroy `texture` once the command buffer being recorded completes
    pub fn release_texture_after_pending(&mut self, texture: TextureId) {
        let index = self.pending_index();
        trace!("Texture {:?} released at index {}", texture, index);
        self.deferred
            .queue_cleanup(index, move |backend: &mut B| backend.destroy_texture(texture));
    }
}

//! Simulated device memory and command execution

use slotmap::SlotMap;

use crate::render::backend::{
    AttachmentStoreActions, BufferCopy, BufferId, BufferTextureCopy, ClearValues, LoadAction,
    MemoryLocation, RenderPassDesc, StoreAction, TextureDesc, TextureId,
};
use crate::render::types::{Color, PixelFormat};

/// Buffer storage; non-coherent host-visible buffers keep a separate host copy
#[derive(Debug)]
pub(super) struct HeadlessBuffer {
    pub device: Vec<u8>,
    pub host: Option<Vec<u8>>,
    pub location: MemoryLocation,
}

impl HeadlessBuffer {
    pub fn new(size: u64, location: MemoryLocation, coherent: bool) -> Self {
        let size = size as usize;
        Self {
            device: vec![0; size],
            host: (location.is_host_visible() && !coherent).then(|| vec![0; size]),
            location,
        }
    }

    pub fn is_coherent(&self) -> bool {
        self.host.is_none()
    }

    pub fn host_view(&self) -> &[u8] {
        self.host.as_deref().unwrap_or(&self.device)
    }

    pub fn host_view_mut(&mut self) -> &mut [u8] {
        match self.host.as_mut() {
            Some(host) => host,
            None => &mut self.device,
        }
    }

    pub fn flush(&mut self, offset: usize, size: usize) {
        if let Some(host) = &self.host {
            self.device[offset..offset + size].copy_from_slice(&host[offset..offset + size]);
        }
    }

    pub fn invalidate(&mut self, offset: usize, size: usize) {
        if let Some(host) = &mut self.host {
            host[offset..offset + size].copy_from_slice(&self.device[offset..offset + size]);
        }
    }
}

/// Texture storage, mip 0 of every layer
#[derive(Debug)]
pub(super) struct HeadlessTexture {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
}

impl HeadlessTexture {
    pub fn new(desc: TextureDesc) -> Self {
        let size = desc.layer_size() * u64::from(desc.layers);
        Self {
            desc,
            data: vec![0; size as usize],
        }
    }

    fn row_bytes(&self) -> usize {
        (self.desc.width * self.desc.format.bytes_per_pixel()) as usize
    }

    fn layer_range(&self, slice: u32) -> std::ops::Range<usize> {
        let layer = self.desc.layer_size() as usize;
        let start = layer * slice as usize;
        start..start + layer
    }

    fn fill_color(&mut self, slice: u32, color: Color) {
        let pixel = match self.desc.format {
            PixelFormat::Rgba8Unorm | PixelFormat::Rgba8Srgb => color.to_rgba8(),
            PixelFormat::Bgra8Unorm => {
                let [r, g, b, a] = color.to_rgba8();
                [b, g, r, a]
            }
            _ => return,
        };
        let range = self.layer_range(slice);
        for texel in self.data[range].chunks_exact_mut(4) {
            texel.copy_from_slice(&pixel);
        }
    }
}

/// Command recorded into a headless command buffer
#[derive(Debug, Clone)]
pub(super) enum GpuCommand {
    BeginPass(RenderPassDesc),
    ClearAttachments(ClearValues),
    EndPass(AttachmentStoreActions),
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        region: BufferCopy,
    },
    FillZero {
        dst: BufferId,
        offset: u64,
        size: u64,
    },
    BufferToTexture {
        src: BufferId,
        dst: TextureId,
        region: BufferTextureCopy,
    },
    TextureToBuffer {
        src: TextureId,
        dst: BufferId,
        region: BufferTextureCopy,
    },
    Draw,
    Dispatch,
}

/// Work counted while executing command buffers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Draws executed
    pub draws: u64,
    /// Dispatches executed
    pub dispatches: u64,
    /// Copies and fills executed
    pub transfers: u64,
    /// Render passes executed
    pub passes: u64,
}

/// Executes recorded commands against simulated memory
pub(super) struct Executor<'a> {
    pub buffers: &'a mut SlotMap<BufferId, HeadlessBuffer>,
    pub textures: &'a mut SlotMap<TextureId, HeadlessTexture>,
    pub hazards: &'a mut Vec<String>,
    pub stats: &'a mut ExecutionStats,
    pub pass: Option<RenderPassDesc>,
}

impl Executor<'_> {
    pub fn run(&mut self, index: u64, commands: &[GpuCommand]) {
        for command in commands {
            self.execute(index, command);
        }
    }

    fn hazard(&mut self, index: u64, message: String) {
        log::error!("GPU hazard in command buffer {}: {}", index, message);
        self.hazards.push(format!("[{index}] {message}"));
    }

    fn execute(&mut self, index: u64, command: &GpuCommand) {
        match command {
            GpuCommand::BeginPass(pass) => {
                self.stats.passes += 1;
                for attachment in &pass.colors {
                    if attachment.load == LoadAction::Clear {
                        self.clear_color(index, attachment.texture, attachment.slice, attachment.clear);
                    }
                }
                self.pass = Some(pass.clone());
            }
            GpuCommand::ClearAttachments(clear) => {
                let Some(pass) = self.pass.clone() else {
                    self.hazard(index, "clear outside of a render pass".to_string());
                    return;
                };
                for (attachment, color) in pass.colors.iter().zip(&clear.colors) {
                    if let Some(color) = color {
                        self.clear_color(index, attachment.texture, attachment.slice, *color);
                    }
                }
            }
            GpuCommand::EndPass(store) => {
                if let Some(pass) = self.pass.take() {
                    for (attachment, action) in pass.colors.iter().zip(&store.colors) {
                        let resolves = matches!(
                            action,
                            StoreAction::MultisampleResolve | StoreAction::StoreAndMultisampleResolve
                        );
                        if let (true, Some(target)) = (resolves, attachment.resolve) {
                            self.resolve(index, attachment.texture, target);
                        }
                    }
                }
            }
            GpuCommand::CopyBuffer { src, dst, region } => {
                self.stats.transfers += 1;
                self.copy_buffer(index, *src, *dst, region);
            }
            GpuCommand::FillZero { dst, offset, size } => {
                self.stats.transfers += 1;
                match self.buffers.get_mut(*dst) {
                    Some(buffer) => {
                        let start = *offset as usize;
                        let end = (start + *size as usize).min(buffer.device.len());
                        buffer.device[start..end].fill(0);
                    }
                    None => self.hazard(index, format!("fill of destroyed buffer {dst:?}")),
                }
            }
            GpuCommand::BufferToTexture { src, dst, region } => {
                self.stats.transfers += 1;
                self.buffer_to_texture(index, *src, *dst, region);
            }
            GpuCommand::TextureToBuffer { src, dst, region } => {
                self.stats.transfers += 1;
                self.texture_to_buffer(index, *src, *dst, region);
            }
            GpuCommand::Draw => self.stats.draws += 1,
            GpuCommand::Dispatch => self.stats.dispatches += 1,
        }
    }

    fn clear_color(&mut self, index: u64, texture: TextureId, slice: u32, color: Color) {
        match self.textures.get_mut(texture) {
            Some(target) => target.fill_color(slice, color),
            None => self.hazard(index, format!("render pass targets destroyed texture {texture:?}")),
        }
    }

    fn resolve(&mut self, index: u64, source: TextureId, target: TextureId) {
        let Some(samples) = self.textures.get(source).map(|t| t.data.clone()) else {
            self.hazard(index, format!("resolve from destroyed texture {source:?}"));
            return;
        };
        match self.textures.get_mut(target) {
            Some(dest) if dest.data.len() == samples.len() => dest.data.copy_from_slice(&samples),
            Some(_) => self.hazard(index, "resolve between mismatched textures".to_string()),
            None => self.hazard(index, format!("resolve into destroyed texture {target:?}")),
        }
    }

    fn copy_buffer(&mut self, index: u64, src: BufferId, dst: BufferId, region: &BufferCopy) {
        let Some(source) = self.buffers.get(src) else {
            self.hazard(index, format!("copy from destroyed buffer {src:?}"));
            return;
        };
        let start = region.src_offset as usize;
        let bytes = source.device[start..start + region.size as usize].to_vec();

        match self.buffers.get_mut(dst) {
            Some(target) => {
                let start = region.dst_offset as usize;
                target.device[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            None => self.hazard(index, format!("copy into destroyed buffer {dst:?}")),
        }
    }

    fn buffer_to_texture(&mut self, index: u64, src: BufferId, dst: TextureId, region: &BufferTextureCopy) {
        let Some(source) = self.buffers.get(src) else {
            self.hazard(index, format!("upload from destroyed buffer {src:?}"));
            return;
        };
        let Some(target) = self.textures.get_mut(dst) else {
            self.hazard(index, format!("upload into destroyed texture {dst:?}"));
            return;
        };
        if region.mip != 0 {
            return;
        }

        let bpp = target.desc.format.bytes_per_pixel() as usize;
        let row_bytes = target.row_bytes();
        let layer_start = target.layer_range(region.slice).start;
        let copy_bytes = region.region.w as usize * bpp;
        for row in 0..region.region.h as usize {
            let src_start = region.buffer_offset as usize + row * region.bytes_per_row as usize;
            let dst_start = layer_start
                + (region.region.y as usize + row) * row_bytes
                + region.region.x as usize * bpp;
            target.data[dst_start..dst_start + copy_bytes]
                .copy_from_slice(&source.device[src_start..src_start + copy_bytes]);
        }
    }

    fn texture_to_buffer(&mut self, index: u64, src: TextureId, dst: BufferId, region: &BufferTextureCopy) {
        let Some(source) = self.textures.get(src) else {
            self.hazard(index, format!("readback from destroyed texture {src:?}"));
            return;
        };
        if region.mip != 0 {
            return;
        }

        let bpp = source.desc.format.bytes_per_pixel() as usize;
        let row_bytes = source.row_bytes();
        let layer_start = source.layer_range(region.slice).start;
        let copy_bytes = region.region.w as usize * bpp;
        let mut rows = Vec::with_capacity(copy_bytes * region.region.h as usize);
        for row in 0..region.region.h as usize {
            let src_start = layer_start
                + (region.region.y as usize + row) * row_bytes
                + region.region.x as usize * bpp;
            rows.push(source.data[src_start..src_start + copy_bytes].to_vec());
        }

        let Some(target) = self.buffers.get_mut(dst) else {
            self.hazard(index, format!("readback into destroyed buffer {dst:?}"));
            return;
        };
        for (row, bytes) in rows.iter().enumerate() {
            let dst_start = region.buffer_offset as usize + row * region.bytes_per_row as usize;
            target.device[dst_start..dst_start + bytes.len()].copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_coherent_needs_flush() {
        let mut buffer = HeadlessBuffer::new(8, MemoryLocation::HostUpload, false);
        buffer.host_view_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buffer.device[..4], &[0, 0, 0, 0]);

        buffer.flush(0, 4);
        assert_eq!(&buffer.device[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_non_coherent_needs_invalidate() {
        let mut buffer = HeadlessBuffer::new(4, MemoryLocation::HostReadback, false);
        buffer.device.copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(buffer.host_view(), &[0, 0, 0, 0]);

        buffer.invalidate(0, 4);
        assert_eq!(buffer.host_view(), &[9, 9, 9, 9]);
    }

    #[test]
    fn test_coherent_shares_storage() {
        let mut buffer = HeadlessBuffer::new(4, MemoryLocation::HostUpload, true);
        assert!(buffer.is_coherent());
        buffer.host_view_mut()[0] = 5;
        assert_eq!(buffer.device[0], 5);
    }
}

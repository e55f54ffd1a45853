//! [`GpuBackend`] implementation over a Vulkan 1.3 device

use std::collections::VecDeque;

use ash::vk;
use log::{debug, error, info, trace, warn};
use slotmap::SlotMap;

use super::commands::{
    full_barrier, initialize_layout, CommandPool, FrameCommands, MAX_STORAGE_BUFFERS, MAX_STORAGE_TEXTURES,
    MAX_TEXTURE_UNITS, STORAGE_BUFFER_BINDING, STORAGE_TEXTURE_BINDING, TEXEL_BUFFER_BINDING,
};
use super::context::VulkanContext;
use super::convert;
use super::memory::{sample_count, vk_format, VulkanBuffer, VulkanTexture};
use super::pipeline::{PipelineKey, SharedLayouts, VulkanProgram};
use super::VulkanError;
use crate::core::GraphicsConfig;
use crate::render::backend::{
    AttachmentStoreActions, Backbuffer, BufferCopy, BufferDesc, BufferId, BufferTextureCopy, ClearValues,
    CommandBufferId, DepthStencilDescriptor, DepthStencilId, DrawCommand, DrawIndexedCommand, EncoderId,
    EncoderKind, GpuBackend, LinkedProgram, ProgramDesc, ProgramId, RenderPassDesc, SamplerDescriptor,
    SamplerId, SubmitMode, TextureDesc, TextureId, UniformUpload, UnitBinding, VertexBufferBinding,
};
use crate::render::types::{
    Access, BlendState, ColorChannelMask, CompareMode, CullMode, PixelFormat, PrimitiveType, Rect,
    StencilAction, TextureType, Viewport, Winding,
};
use crate::render::{RenderError, RenderResult};

/// Attachment layout of the render pass an encoder records into
struct PassLayout {
    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    stencil_format: vk::Format,
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
}

struct EncoderState {
    cmd: CommandBufferId,
    kind: EncoderKind,
    pass: Option<PassLayout>,
    program: Option<ProgramId>,
    bound_pipeline: vk::Pipeline,
    bound_generation: Option<u64>,
    blend: BlendState,
    mask: ColorChannelMask,
    wireframe: bool,
}

/// Resources currently attached to the shared descriptor layout
#[derive(Default)]
struct Bindings {
    units: [Option<UnitBinding>; MAX_TEXTURE_UNITS as usize],
    storage_buffers: [Option<BufferId>; MAX_STORAGE_BUFFERS as usize],
    storage_textures: [Option<TextureId>; MAX_STORAGE_TEXTURES as usize],
    generation: u64,
}

/// Vulkan implementation of [`GpuBackend`]
///
/// Field order matters: everything holding a device handle drops before the
/// context.
pub struct VulkanBackend {
    pool: CommandPool,
    layouts: SharedLayouts,
    buffers: SlotMap<BufferId, VulkanBuffer>,
    textures: SlotMap<TextureId, VulkanTexture>,
    samplers: SlotMap<SamplerId, vk::Sampler>,
    depth_stencil_states: SlotMap<DepthStencilId, DepthStencilDescriptor>,
    programs: SlotMap<ProgramId, VulkanProgram>,
    frames: SlotMap<CommandBufferId, FrameCommands>,
    spare_frames: Vec<FrameCommands>,
    in_flight: VecDeque<CommandBufferId>,
    encoders: SlotMap<EncoderId, EncoderState>,
    bindings: Bindings,
    backbuffer: Backbuffer,
    completed: u64,
    presents: u64,
    lost: bool,
    wireframe_warned: bool,
    context: VulkanContext,
}

impl VulkanBackend {
    /// Open a device and create the offscreen backbuffer described by `config`
    pub fn new(config: &GraphicsConfig) -> RenderResult<Self> {
        let context = VulkanContext::new(&config.application_name, config.validation_enabled())?;
        let device = context.raw().clone();
        let pool = CommandPool::new(device.clone(), context.physical_device.queue_family)?;
        let layouts = SharedLayouts::new(&device, context.push_constant_size())?;

        let mut backend = Self {
            pool,
            layouts,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            depth_stencil_states: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            frames: SlotMap::with_key(),
            spare_frames: Vec::new(),
            in_flight: VecDeque::new(),
            encoders: SlotMap::with_key(),
            bindings: Bindings::default(),
            backbuffer: Backbuffer {
                color: TextureId::default(),
                msaa_color: None,
                depth_stencil: None,
                width: config.backbuffer.width,
                height: config.backbuffer.height,
            },
            completed: 0,
            presents: 0,
            lost: false,
            wireframe_warned: false,
            context,
        };

        let size = &config.backbuffer;
        let target = |format: PixelFormat, samples: u32, label: &str| TextureDesc {
            texture_type: TextureType::Tex2D,
            format,
            width: size.width,
            height: size.height,
            layers: 1,
            mip_levels: 1,
            samples,
            render_target: true,
            storage: false,
            label: Some(label.to_string()),
        };
        backend.backbuffer.color = backend.create_texture(&target(PixelFormat::Rgba8Unorm, 1, "backbuffer"))?;
        if size.msaa > 1 {
            let msaa = target(PixelFormat::Rgba8Unorm, size.msaa, "backbuffer msaa");
            backend.backbuffer.msaa_color = Some(backend.create_texture(&msaa)?);
        }
        if size.depth_stencil {
            let depth = target(PixelFormat::Depth24Stencil8, size.msaa, "backbuffer depth");
            backend.backbuffer.depth_stencil = Some(backend.create_texture(&depth)?);
        }

        info!(
            "Vulkan backend ready: {}x{} backbuffer, msaa {}",
            size.width, size.height, size.msaa
        );
        Ok(backend)
    }

    /// Completed presents
    pub const fn presents(&self) -> u64 {
        self.presents
    }

    fn check_alive(&self) -> RenderResult<()> {
        if self.lost {
            Err(RenderError::DeviceLost("Vulkan device lost".to_string()))
        } else {
            Ok(())
        }
    }

    /// Convert a device error, latching device loss
    fn fail(&mut self, error: VulkanError) -> RenderError {
        if matches!(error, VulkanError::Api(vk::Result::ERROR_DEVICE_LOST)) && !self.lost {
            error!("Vulkan device lost");
            self.lost = true;
        }
        error.into()
    }

    /// Native format, falling back when the device lacks packed depth/stencil
    fn native_format(&self, format: PixelFormat) -> vk::Format {
        let native = vk_format(format);
        if native == vk::Format::D24_UNORM_S8_UINT
            && !self
                .context
                .supports_format(native, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return vk::Format::D32_SFLOAT_S8_UINT;
        }
        native
    }

    /// Command buffer behind `encoder` when it is open with one of `kinds`
    fn encoder_cmd(&self, encoder: EncoderId, kinds: &[EncoderKind]) -> Option<vk::CommandBuffer> {
        if self.lost {
            return None;
        }
        let Some(state) = self.encoders.get(encoder) else {
            error!("Recording into unknown encoder {encoder:?}");
            return None;
        };
        if !kinds.contains(&state.kind) {
            error!("{:?} encoder cannot record this command", state.kind);
            return None;
        }
        self.frames.get(state.cmd).map(|frame| frame.cmd)
    }

    fn image_copy(texture: &VulkanTexture, region: &BufferTextureCopy) -> vk::BufferImageCopy {
        let bytes_per_pixel = texture.desc.format.bytes_per_pixel().max(1);
        let (layer, z) = if texture.desc.texture_type == TextureType::Volume {
            (0, region.slice as i32)
        } else {
            (region.slice, 0)
        };
        let aspect = if texture.desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        vk::BufferImageCopy {
            buffer_offset: region.buffer_offset,
            buffer_row_length: region.bytes_per_row / bytes_per_pixel,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: region.mip,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: region.region.x,
                y: region.region.y,
                z,
            },
            image_extent: vk::Extent3D {
                width: region.region.w,
                height: region.region.h,
                depth: 1,
            },
        }
    }

    fn begin_rendering(&mut self, cmd: CommandBufferId, pass: &RenderPassDesc) -> RenderResult<PassLayout> {
        let device = self.context.raw();
        let Some(frame) = self.frames.get_mut(cmd) else {
            return Err(RenderError::BackendError(format!("Command buffer {cmd:?} is not recording")));
        };
        let missing = |texture: TextureId| RenderError::InvalidResourceState(format!("render pass uses unknown texture {texture:?}"));

        let mut color_attachments = Vec::with_capacity(pass.colors.len());
        let mut color_formats = Vec::with_capacity(pass.colors.len());
        let mut samples = vk::SampleCountFlags::TYPE_1;
        for color in &pass.colors {
            let texture = self.textures.get(color.texture).ok_or_else(|| missing(color.texture))?;
            let view = texture.attachment_view(device, color.slice, color.mip)?;
            frame.transient_views.push(view);
            samples = sample_count(texture.desc.samples);
            color_formats.push(texture.format);

            let mut attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL)
                .load_op(convert::load_op(color.load))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: color.clear.to_array(),
                    },
                });
            if let Some(resolve) = color.resolve {
                let target = self.textures.get(resolve).ok_or_else(|| missing(resolve))?;
                let resolve_view = target.attachment_view(device, color.slice, color.mip)?;
                frame.transient_views.push(resolve_view);
                attachment = attachment
                    .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                    .resolve_image_view(resolve_view)
                    .resolve_image_layout(vk::ImageLayout::GENERAL);
            }
            color_attachments.push(attachment.build());
        }

        let mut depth_format = vk::Format::UNDEFINED;
        let mut stencil_format = vk::Format::UNDEFINED;
        let mut depth_attachment = None;
        let mut stencil_attachment = None;
        if let Some(ds) = &pass.depth_stencil {
            let texture = self.textures.get(ds.texture).ok_or_else(|| missing(ds.texture))?;
            let view = texture.attachment_view(device, 0, 0)?;
            frame.transient_views.push(view);
            if pass.colors.is_empty() {
                samples = sample_count(texture.desc.samples);
            }
            depth_format = texture.format;
            depth_attachment = Some(
                vk::RenderingAttachmentInfo::builder()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::GENERAL)
                    .load_op(convert::load_op(ds.depth_load))
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: ds.clear_depth as f32,
                            stencil: 0,
                        },
                    })
                    .build(),
            );
            if texture.desc.format.has_stencil() {
                stencil_format = texture.format;
                stencil_attachment = Some(
                    vk::RenderingAttachmentInfo::builder()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::GENERAL)
                        .load_op(convert::load_op(ds.stencil_load))
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(vk::ClearValue {
                            depth_stencil: vk::ClearDepthStencilValue {
                                depth: 0.0,
                                stencil: ds.clear_stencil,
                            },
                        })
                        .build(),
                );
            }
        }

        let extent = vk::Extent2D {
            width: pass.width,
            height: pass.height,
        };
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        if let Some(stencil) = stencil_attachment.as_ref() {
            rendering_info = rendering_info.stencil_attachment(stencil);
        }
        unsafe { device.cmd_begin_rendering(frame.cmd, &rendering_info) };

        Ok(PassLayout {
            color_formats,
            depth_format,
            stencil_format,
            samples,
            extent,
        })
    }

    /// Write and bind a descriptor set when bindings changed since the encoder last bound one
    fn bind_descriptors(&mut self, encoder: EncoderId, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint) -> bool {
        let device = self.context.raw();
        let Some(state) = self.encoders.get_mut(encoder) else {
            return false;
        };
        if state.bound_generation == Some(self.bindings.generation) {
            return true;
        }
        let Some(frame) = self.frames.get_mut(state.cmd) else {
            return false;
        };
        let set = match frame.descriptors.allocate(device, self.layouts.set_layout) {
            Ok(set) => set,
            Err(e) => {
                error!("Descriptor set allocation failed: {e}");
                return false;
            }
        };

        let mut images: Vec<(u32, vk::DescriptorType, vk::DescriptorImageInfo)> = Vec::new();
        let mut texel_views: Vec<(u32, vk::BufferView)> = Vec::new();
        let mut buffers: Vec<(u32, vk::DescriptorBufferInfo)> = Vec::new();

        for (unit, binding) in self.bindings.units.iter().enumerate() {
            match binding {
                Some(UnitBinding::Texture { texture, sampler, .. }) => {
                    if let (Some(texture), Some(&sampler)) = (self.textures.get(*texture), self.samplers.get(*sampler)) {
                        images.push((
                            unit as u32,
                            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                            vk::DescriptorImageInfo {
                                sampler,
                                image_view: texture.view,
                                image_layout: vk::ImageLayout::GENERAL,
                            },
                        ));
                    }
                }
                Some(UnitBinding::TexelBuffer(buffer)) => {
                    if let Some(view) = self.buffers.get(*buffer).and_then(|b| b.texel_view) {
                        texel_views.push((TEXEL_BUFFER_BINDING + unit as u32, view));
                    }
                }
                None => {}
            }
        }
        for (slot, buffer) in self.bindings.storage_buffers.iter().enumerate() {
            if let Some(buffer) = buffer.and_then(|id| self.buffers.get(id)) {
                buffers.push((
                    STORAGE_BUFFER_BINDING + slot as u32,
                    vk::DescriptorBufferInfo {
                        buffer: buffer.buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    },
                ));
            }
        }
        for (slot, texture) in self.bindings.storage_textures.iter().enumerate() {
            if let Some(texture) = texture.and_then(|id| self.textures.get(id)) {
                images.push((
                    STORAGE_TEXTURE_BINDING + slot as u32,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: texture.view,
                        image_layout: vk::ImageLayout::GENERAL,
                    },
                ));
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = images
            .iter()
            .map(|(binding, ty, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info))
                    .build()
            })
            .chain(texel_views.iter().map(|(binding, view)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_TEXEL_BUFFER)
                    .texel_buffer_view(std::slice::from_ref(view))
                    .build()
            }))
            .chain(buffers.iter().map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            }))
            .collect();

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
            device.cmd_bind_descriptor_sets(cmd, bind_point, self.layouts.pipeline_layout, 0, &[set], &[]);
        }
        state.bound_generation = Some(self.bindings.generation);
        true
    }

    /// Bind pipeline, descriptors and uniforms for a draw; `None` skips the draw
    fn prepare_draw(&mut self, encoder: EncoderId, primitive: PrimitiveType) -> Option<vk::CommandBuffer> {
        let cmd = self.encoder_cmd(encoder, &[EncoderKind::Render])?;
        let supports_wireframe = self.context.supports_wireframe();
        let state = self.encoders.get(encoder)?;
        let Some(program_id) = state.program else {
            error!("Draw recorded without a bound program");
            return None;
        };
        let pass = state.pass.as_ref()?;
        let mut wireframe = state.wireframe;
        if wireframe && !supports_wireframe {
            if !self.wireframe_warned {
                warn!("Wireframe requested but the device lacks fillModeNonSolid");
                self.wireframe_warned = true;
            }
            wireframe = false;
        }
        let key = PipelineKey {
            blend: state.blend,
            mask: state.mask,
            wireframe,
            topology: convert::topology(primitive),
            color_formats: pass.color_formats.clone(),
            depth_format: pass.depth_format,
            stencil_format: pass.stencil_format,
            samples: pass.samples,
        };

        let device = self.context.raw();
        let Some(program) = self.programs.get_mut(program_id) else {
            error!("Draw uses destroyed program {program_id:?}");
            return None;
        };
        let pipeline = match program.graphics_pipeline(device, &self.layouts, &key) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!("Pipeline creation for '{}' failed: {e}", program.label);
                return None;
            }
        };
        let state = self.encoders.get_mut(encoder)?;
        if state.bound_pipeline != pipeline {
            unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) };
            state.bound_pipeline = pipeline;
        }

        if !self.bind_descriptors(encoder, cmd, vk::PipelineBindPoint::GRAPHICS) {
            return None;
        }
        let program = self.programs.get(program_id)?;
        self.layouts.push(self.context.raw(), cmd, &program.block);
        Some(cmd)
    }

    fn bind_vertex_buffers(&self, cmd: vk::CommandBuffer, bindings: &[VertexBufferBinding]) {
        let device = self.context.raw();
        for binding in bindings {
            if let Some(buffer) = self.buffers.get(binding.buffer) {
                unsafe { device.cmd_bind_vertex_buffers(cmd, binding.slot, &[buffer.buffer], &[binding.offset]) };
            } else {
                error!("Vertex buffer {:?} is not alive", binding.buffer);
            }
        }
    }

    fn mapped_ptr(&self, buffer: BufferId, offset: u64, size: u64) -> Option<*mut u8> {
        let buffer = self.buffers.get(buffer)?;
        let ptr = buffer.mapped?;
        if offset.checked_add(size)? > buffer.size {
            return None;
        }
        // In bounds of the mapping checked above.
        Some(unsafe { ptr.add(offset as usize) })
    }

    fn mapped_memory_range(&self, buffer: BufferId, offset: u64) -> Option<vk::MappedMemoryRange> {
        let buffer = self.buffers.get(buffer)?;
        if buffer.coherent || buffer.mapped.is_none() {
            return None;
        }
        let atom = self.context.non_coherent_atom_size();
        Some(
            vk::MappedMemoryRange::builder()
                .memory(buffer.memory)
                .offset(offset - offset % atom)
                .size(vk::WHOLE_SIZE)
                .build(),
        )
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn backbuffer(&self) -> Backbuffer {
        self.backbuffer
    }

    fn begin_command_buffer(&mut self) -> RenderResult<CommandBufferId> {
        self.check_alive()?;
        let device = self.context.raw().clone();
        let frame = match self.spare_frames.pop() {
            Some(frame) => frame,
            None => FrameCommands::new(&self.pool, &device).map_err(|e| self.fail(e))?,
        };
        if let Err(e) = frame.begin(&device) {
            frame.destroy(&self.pool, &device);
            return Err(self.fail(e));
        }
        Ok(self.frames.insert(frame))
    }

    fn submit_command_buffer(&mut self, cmd: CommandBufferId, index: u64, mode: SubmitMode) -> RenderResult<()> {
        self.check_alive()?;
        let device = self.context.raw();
        let queue = self.context.device.queue;
        let Some(frame) = self.frames.get_mut(cmd) else {
            return Err(RenderError::BackendError(format!("Command buffer {cmd:?} is not recording")));
        };

        let command_buffers = [frame.cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        let result = unsafe {
            device
                .end_command_buffer(frame.cmd)
                .and_then(|()| device.queue_submit(queue, &[submit_info.build()], frame.fence.handle()))
        };
        if let Err(e) = result {
            return Err(self.fail(VulkanError::Api(e)));
        }
        frame.index = Some(index);
        self.in_flight.push_back(cmd);

        if mode == SubmitMode::Present {
            self.presents += 1;
            trace!("Presented offscreen backbuffer (submission {})", index);
        }
        Ok(())
    }

    fn completed_index(&mut self) -> RenderResult<u64> {
        self.check_alive()?;
        while let Some(&front) = self.in_flight.front() {
            let status = match self.frames.get(front) {
                Some(frame) => frame.fence.is_signaled().map(|done| done.then_some(frame.index)),
                None => Ok(Some(None)),
            };
            match status {
                Ok(Some(index)) => {
                    self.completed = self.completed.max(index.unwrap_or(0));
                    self.in_flight.pop_front();
                }
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(self.completed)
    }

    fn release_command_buffer(&mut self, cmd: CommandBufferId) {
        self.in_flight.retain(|&id| id != cmd);
        let Some(mut frame) = self.frames.remove(cmd) else {
            warn!("Released unknown command buffer {cmd:?}");
            return;
        };
        let device = self.context.raw();
        match frame.recycle(device) {
            Ok(()) => self.spare_frames.push(frame),
            Err(e) => {
                warn!("Could not recycle command buffer: {e}");
                frame.destroy(&self.pool, device);
            }
        }
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.check_alive()?;
        if let Err(e) = unsafe { self.context.raw().device_wait_idle() } {
            return Err(self.fail(VulkanError::Api(e)));
        }
        self.completed_index().map(|_| ())
    }

    fn begin_encoder(
        &mut self,
        cmd: CommandBufferId,
        kind: EncoderKind,
        pass: Option<&RenderPassDesc>,
    ) -> RenderResult<EncoderId> {
        self.check_alive()?;
        let Some(native) = self.frames.get(cmd).map(|frame| frame.cmd) else {
            return Err(RenderError::BackendError(format!("Command buffer {cmd:?} is not recording")));
        };
        full_barrier(self.context.raw(), native);

        let layout = match (kind, pass) {
            (EncoderKind::Render, None) => {
                return Err(RenderError::BackendError("Render encoder needs a pass".to_string()));
            }
            (EncoderKind::Render, Some(pass)) => Some(self.begin_rendering(cmd, pass)?),
            _ => None,
        };

        Ok(self.encoders.insert(EncoderState {
            cmd,
            kind,
            pass: layout,
            program: None,
            bound_pipeline: vk::Pipeline::null(),
            bound_generation: None,
            blend: BlendState::default(),
            mask: ColorChannelMask::all(),
            wireframe: false,
        }))
    }

    fn end_encoder(&mut self, encoder: EncoderId, store: Option<&AttachmentStoreActions>) {
        let Some(state) = self.encoders.remove(encoder) else {
            error!("Unknown encoder {encoder:?} ended");
            return;
        };
        if state.kind != EncoderKind::Render || self.lost {
            return;
        }
        if let Some(store) = store {
            trace!("Render pass ended with store actions {:?}", store);
        }
        if let Some(frame) = self.frames.get(state.cmd) {
            unsafe { self.context.raw().cmd_end_rendering(frame.cmd) };
        }
    }

    fn set_viewport(&mut self, encoder: EncoderId, viewport: &Viewport) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) else {
            return;
        };
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.context.raw().cmd_set_viewport(cmd, 0, &[viewport]) };
    }

    fn set_scissor(&mut self, encoder: EncoderId, scissor: Option<Rect>) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) else {
            return;
        };
        let Some(extent) = self.encoders.get(encoder).and_then(|s| s.pass.as_ref()).map(|p| p.extent) else {
            return;
        };
        let rect = scissor.map_or(
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            |r| {
                let x = r.x.max(0);
                let y = r.y.max(0);
                vk::Rect2D {
                    offset: vk::Offset2D { x, y },
                    extent: vk::Extent2D {
                        width: r.w.saturating_sub((x - r.x) as u32),
                        height: r.h.saturating_sub((y - r.y) as u32),
                    },
                }
            },
        );
        unsafe { self.context.raw().cmd_set_scissor(cmd, 0, &[rect]) };
    }

    fn set_blend_state(&mut self, encoder: EncoderId, blend: &BlendState) {
        if let Some(state) = self.encoders.get_mut(encoder) {
            state.blend = *blend;
        }
    }

    fn set_color_mask(&mut self, encoder: EncoderId, mask: ColorChannelMask) {
        if let Some(state) = self.encoders.get_mut(encoder) {
            state.mask = mask;
        }
    }

    fn set_depth_stencil_state(&mut self, encoder: EncoderId, state: DepthStencilId, reference: u32) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) else {
            return;
        };
        let Some(desc) = self.depth_stencil_states.get(state).copied() else {
            error!("Depth/stencil state {state:?} is not alive");
            return;
        };
        let device = self.context.raw();
        let depth_test = desc.depth.compare != CompareMode::Always || desc.depth.write;
        let stencil_test = desc.stencil_compare != CompareMode::Always || desc.stencil_action != StencilAction::Keep;
        let faces = vk::StencilFaceFlags::FRONT_AND_BACK;
        unsafe {
            device.cmd_set_depth_test_enable(cmd, depth_test);
            device.cmd_set_depth_write_enable(cmd, desc.depth.write);
            device.cmd_set_depth_compare_op(cmd, convert::compare_op(desc.depth.compare));
            device.cmd_set_stencil_test_enable(cmd, stencil_test);
            device.cmd_set_stencil_op(
                cmd,
                faces,
                vk::StencilOp::KEEP,
                convert::stencil_op(desc.stencil_action),
                vk::StencilOp::KEEP,
                convert::compare_op(desc.stencil_compare),
            );
            device.cmd_set_stencil_compare_mask(cmd, faces, u32::from(desc.stencil_read_mask));
            device.cmd_set_stencil_write_mask(cmd, faces, u32::from(desc.stencil_write_mask));
            device.cmd_set_stencil_reference(cmd, faces, reference);
        }
    }

    fn set_cull_mode(&mut self, encoder: EncoderId, mode: CullMode) {
        if let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) {
            unsafe { self.context.raw().cmd_set_cull_mode(cmd, convert::cull_mode(mode)) };
        }
    }

    fn set_front_face(&mut self, encoder: EncoderId, winding: Winding) {
        if let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) {
            unsafe { self.context.raw().cmd_set_front_face(cmd, convert::front_face(winding)) };
        }
    }

    fn set_wireframe(&mut self, encoder: EncoderId, enabled: bool) {
        if let Some(state) = self.encoders.get_mut(encoder) {
            state.wireframe = enabled;
        }
    }

    fn bind_program(&mut self, encoder: EncoderId, program: ProgramId) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render, EncoderKind::Compute]) else {
            return;
        };
        let compute_pipeline = self.programs.get(program).map(|p| p.compute_pipeline);
        let Some(state) = self.encoders.get_mut(encoder) else {
            return;
        };
        match (state.kind, compute_pipeline) {
            (_, None) => error!("Binding destroyed program {program:?}"),
            (EncoderKind::Compute, Some(Some(pipeline))) => {
                unsafe {
                    self.context
                        .raw()
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
                }
                state.program = Some(program);
                state.bound_pipeline = pipeline;
            }
            (EncoderKind::Compute, Some(None)) => error!("Program {program:?} has no compute stage"),
            (_, Some(_)) => state.program = Some(program),
        }
    }

    fn draw(&mut self, encoder: EncoderId, draw: &DrawCommand) {
        let Some(cmd) = self.prepare_draw(encoder, draw.primitive) else {
            return;
        };
        self.bind_vertex_buffers(cmd, &draw.vertex_buffers);
        unsafe {
            self.context
                .raw()
                .cmd_draw(cmd, draw.vertex_count, draw.instance_count, draw.vertex_start, 0);
        }
    }

    fn draw_indexed(&mut self, encoder: EncoderId, draw: &DrawIndexedCommand) {
        let Some(index_buffer) = self.buffers.get(draw.index_buffer).map(|b| b.buffer) else {
            error!("Index buffer {:?} is not alive", draw.index_buffer);
            return;
        };
        let Some(cmd) = self.prepare_draw(encoder, draw.primitive) else {
            return;
        };
        self.bind_vertex_buffers(cmd, &draw.vertex_buffers);
        let device = self.context.raw();
        unsafe {
            device.cmd_bind_index_buffer(cmd, index_buffer, draw.index_offset, convert::index_type(draw.index_format));
            device.cmd_draw_indexed(
                cmd,
                draw.index_count,
                draw.instance_count,
                draw.index_start,
                draw.base_vertex,
                0,
            );
        }
    }

    fn clear_attachments(&mut self, encoder: EncoderId, clear: &ClearValues) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Render]) else {
            return;
        };
        let Some(pass) = self.encoders.get(encoder).and_then(|s| s.pass.as_ref()) else {
            return;
        };

        let mut attachments: Vec<vk::ClearAttachment> = clear
            .colors
            .iter()
            .enumerate()
            .take(pass.color_formats.len())
            .filter_map(|(i, color)| {
                color.map(|color| vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: i as u32,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: color.to_array(),
                        },
                    },
                })
            })
            .collect();

        let mut aspect = vk::ImageAspectFlags::empty();
        if clear.depth.is_some() && pass.depth_format != vk::Format::UNDEFINED {
            aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if clear.stencil.is_some() && pass.stencil_format != vk::Format::UNDEFINED {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        if !aspect.is_empty() {
            attachments.push(vk::ClearAttachment {
                aspect_mask: aspect,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear.depth.unwrap_or(1.0) as f32,
                        stencil: clear.stencil.unwrap_or(0),
                    },
                },
            });
        }
        if attachments.is_empty() {
            return;
        }

        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: pass.extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { self.context.raw().cmd_clear_attachments(cmd, &attachments, &[rect]) };
    }

    fn dispatch(&mut self, encoder: EncoderId, groups: [u32; 3]) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Compute]) else {
            return;
        };
        let Some(program_id) = self.encoders.get(encoder).and_then(|s| s.program) else {
            error!("Dispatch recorded without a bound program");
            return;
        };
        if !self.bind_descriptors(encoder, cmd, vk::PipelineBindPoint::COMPUTE) {
            return;
        }
        let Some(program) = self.programs.get(program_id) else {
            return;
        };
        let device = self.context.raw();
        self.layouts.push(device, cmd, &program.block);
        unsafe { device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]) };
    }

    fn copy_buffer(&mut self, encoder: EncoderId, src: BufferId, dst: BufferId, region: &BufferCopy) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Blit]) else {
            return;
        };
        let (Some(src), Some(dst)) = (self.buffers.get(src), self.buffers.get(dst)) else {
            error!("Buffer copy between {src:?} and {dst:?} references a dead buffer");
            return;
        };
        let copy = vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        };
        unsafe { self.context.raw().cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[copy]) };
    }

    fn fill_buffer_zero(&mut self, encoder: EncoderId, dst: BufferId, offset: u64, size: u64) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Blit]) else {
            return;
        };
        let Some(buffer) = self.buffers.get(dst) else {
            error!("Zero fill of dead buffer {dst:?}");
            return;
        };
        // vkCmdFillBuffer works in whole words.
        let start = offset.next_multiple_of(4);
        let end = (offset + size) & !3;
        if end > start {
            unsafe { self.context.raw().cmd_fill_buffer(cmd, buffer.buffer, start, end - start, 0) };
        }
    }

    fn copy_buffer_to_texture(&mut self, encoder: EncoderId, src: BufferId, dst: TextureId, region: &BufferTextureCopy) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Blit]) else {
            return;
        };
        let (Some(buffer), Some(texture)) = (self.buffers.get(src), self.textures.get(dst)) else {
            error!("Upload from {src:?} to {dst:?} references a dead resource");
            return;
        };
        let copy = Self::image_copy(texture, region);
        unsafe {
            self.context.raw().cmd_copy_buffer_to_image(
                cmd,
                buffer.buffer,
                texture.image,
                vk::ImageLayout::GENERAL,
                &[copy],
            );
        }
    }

    fn copy_texture_to_buffer(&mut self, encoder: EncoderId, src: TextureId, dst: BufferId, region: &BufferTextureCopy) {
        let Some(cmd) = self.encoder_cmd(encoder, &[EncoderKind::Blit]) else {
            return;
        };
        let (Some(texture), Some(buffer)) = (self.textures.get(src), self.buffers.get(dst)) else {
            error!("Readback from {src:?} to {dst:?} references a dead resource");
            return;
        };
        let copy = Self::image_copy(texture, region);
        unsafe {
            self.context.raw().cmd_copy_image_to_buffer(
                cmd,
                texture.image,
                vk::ImageLayout::GENERAL,
                buffer.buffer,
                &[copy],
            );
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        self.check_alive()?;
        let buffer = VulkanBuffer::new(&self.context, desc).map_err(|e| self.fail(e))?;
        debug!(
            "Created buffer {:?}: {} bytes, {:?}, coherent {}",
            desc.label, desc.size, desc.location, buffer.coherent
        );
        Ok(self.buffers.insert(buffer))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        match self.buffers.remove(buffer) {
            Some(removed) => {
                trace!("Destroying buffer {:?}", removed.label);
                removed.destroy(self.context.raw());
            }
            None => warn!("Buffer {buffer:?} destroyed twice"),
        }
    }

    fn is_coherent(&self, buffer: BufferId) -> bool {
        self.buffers.get(buffer).map_or(true, |b| b.coherent)
    }

    fn mapped_range(&self, buffer: BufferId, offset: u64, size: u64) -> Option<&[u8]> {
        let ptr = self.mapped_ptr(buffer, offset, size)?;
        // The mapping lives as long as the buffer, which `&self` keeps alive.
        Some(unsafe { std::slice::from_raw_parts(ptr, size as usize) })
    }

    fn mapped_range_mut(&mut self, buffer: BufferId, offset: u64, size: u64) -> Option<&mut [u8]> {
        let ptr = self.mapped_ptr(buffer, offset, size)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, size as usize) })
    }

    fn flush_mapped_range(&mut self, buffer: BufferId, offset: u64, _size: u64) {
        if let Some(range) = self.mapped_memory_range(buffer, offset) {
            if let Err(e) = unsafe { self.context.raw().flush_mapped_memory_ranges(&[range]) } {
                error!("Flushing mapped memory failed: {e:?}");
            }
        }
    }

    fn invalidate_mapped_range(&mut self, buffer: BufferId, offset: u64, _size: u64) {
        if let Some(range) = self.mapped_memory_range(buffer, offset) {
            if let Err(e) = unsafe { self.context.raw().invalidate_mapped_memory_ranges(&[range]) } {
                error!("Invalidating mapped memory failed: {e:?}");
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId> {
        self.check_alive()?;
        let format = self.native_format(desc.format);
        let texture = VulkanTexture::new(&self.context, desc, format).map_err(|e| self.fail(e))?;

        let (image, range) = (texture.image, texture.full_range());
        let transition = self
            .pool
            .run_one_time(self.context.device.queue, |device, cmd| initialize_layout(device, cmd, image, range));
        if let Err(e) = transition {
            texture.destroy(self.context.raw());
            return Err(self.fail(e));
        }

        debug!(
            "Created texture {:?}: {:?} {}x{}x{} {:?}, {} mips, {} samples",
            desc.label, desc.texture_type, desc.width, desc.height, desc.layers, format, desc.mip_levels, desc.samples
        );
        Ok(self.textures.insert(texture))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        match self.textures.remove(texture) {
            Some(removed) => {
                trace!("Destroying texture {:?}", removed.desc.label);
                removed.destroy(self.context.raw());
            }
            None => warn!("Texture {texture:?} destroyed twice"),
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RenderResult<SamplerId> {
        self.check_alive()?;
        let info = convert::sampler_info(desc, self.context.max_anisotropy());
        let sampler = unsafe { self.context.raw().create_sampler(&info, None) }
            .map_err(|e| self.fail(VulkanError::Api(e)))?;
        Ok(self.samplers.insert(sampler))
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        if let Some(sampler) = self.samplers.remove(sampler) {
            unsafe { self.context.raw().destroy_sampler(sampler, None) };
        }
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDescriptor) -> RenderResult<DepthStencilId> {
        self.check_alive()?;
        Ok(self.depth_stencil_states.insert(*desc))
    }

    fn destroy_depth_stencil_state(&mut self, state: DepthStencilId) {
        self.depth_stencil_states.remove(state);
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> RenderResult<LinkedProgram> {
        self.check_alive()?;
        let output = VulkanProgram::link(self.context.raw(), &self.layouts, desc).map_err(|log| {
            RenderError::LinkFailure {
                shader: desc.label.to_string(),
                log,
            }
        })?;
        debug!(
            "Linked Vulkan program '{}': {} uniforms, {} push constant words",
            desc.label,
            output.uniforms.len(),
            output.program.block.len()
        );
        let program = self.programs.insert(output.program);
        Ok(LinkedProgram {
            program,
            uniforms: output.uniforms,
            storage_blocks: output.storage_blocks,
            log: String::new(),
        })
    }

    fn destroy_program(&mut self, program: ProgramId) {
        if let Some(mut removed) = self.programs.remove(program) {
            debug!("Destroying Vulkan program '{}'", removed.label);
            removed.destroy(self.context.raw());
        }
    }

    fn set_uniform(&mut self, program: ProgramId, location: i32, upload: &UniformUpload<'_>) {
        if let Some(program) = self.programs.get_mut(program) {
            program.set_uniform(location, upload);
        }
    }

    fn bind_texture_unit(&mut self, unit: u32, binding: UnitBinding) {
        match self.bindings.units.get_mut(unit as usize) {
            Some(slot) => {
                *slot = Some(binding);
                self.bindings.generation += 1;
            }
            None => warn!("Texture unit {unit} exceeds the {MAX_TEXTURE_UNITS} supported units"),
        }
    }

    fn bind_storage_texture(&mut self, binding: u32, texture: Option<TextureId>, access: Access, format: PixelFormat) {
        match self.bindings.storage_textures.get_mut(binding as usize) {
            Some(slot) => {
                trace!("Storage texture {binding}: {texture:?} ({access:?}, {format:?})");
                *slot = texture;
                self.bindings.generation += 1;
            }
            None => warn!("Storage texture binding {binding} exceeds the {MAX_STORAGE_TEXTURES} supported slots"),
        }
    }

    fn bind_storage_buffer(&mut self, binding: u32, buffer: Option<BufferId>) {
        match self.bindings.storage_buffers.get_mut(binding as usize) {
            Some(slot) => {
                *slot = buffer;
                self.bindings.generation += 1;
            }
            None => warn!("Storage buffer binding {binding} exceeds the {MAX_STORAGE_BUFFERS} supported slots"),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = self.context.raw().clone();
        unsafe {
            let _ = device.device_wait_idle();
        }

        for (_, frame) in self.frames.drain() {
            frame.destroy(&self.pool, &device);
        }
        for frame in self.spare_frames.drain(..) {
            frame.destroy(&self.pool, &device);
        }
        for (_, mut program) in self.programs.drain() {
            program.destroy(&device);
        }
        for (_, sampler) in self.samplers.drain() {
            unsafe { device.destroy_sampler(sampler, None) };
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(&device);
        }
        for (_, texture) in self.textures.drain() {
            texture.destroy(&device);
        }
        self.layouts.destroy(&device);
        debug!("Vulkan backend destroyed after {} presents", self.presents);
    }
}

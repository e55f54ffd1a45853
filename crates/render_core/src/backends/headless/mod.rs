//! # Headless Backend
//!
//! An in-process simulated GPU. Buffers and textures are plain byte vectors,
//! command buffers are lists of recorded commands executed when they retire,
//! and every call the core makes is appended to a call log.
//!
//! ## Simulation Knobs
//!
//! - [`CompletionMode::Manual`] holds submitted command buffers until the test
//!   retires them, so completion-gated behavior can be observed.
//! - Non-coherent memory keeps a separate host copy per host-visible buffer;
//!   writes only reach the device after a flush, device writes only reach the
//!   host after an invalidate.
//! - [`HeadlessBackend::lose_device`] makes every later device call fail.
//! - Use of a destroyed object, at record or execution time, is logged to
//!   [`HeadlessBackend::hazards`].

mod calls;
mod memory;

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use slotmap::SlotMap;

pub use calls::BackendCall;
pub use memory::ExecutionStats;
use memory::{Executor, GpuCommand, HeadlessBuffer, HeadlessTexture};

use crate::core::{BackbufferConfig, GraphicsConfig};
use crate::render::backend::{
    ActiveUniform, AttachmentStoreActions, Backbuffer, BufferCopy, BufferDesc, BufferId,
    BufferTextureCopy, ClearValues, CommandBufferId, DepthStencilDescriptor, DepthStencilId,
    DrawCommand, DrawIndexedCommand, EncoderId, EncoderKind, GpuBackend, LinkedProgram,
    ProgramDesc, ProgramId, RenderPassDesc, SamplerDescriptor, SamplerId,
    ShaderCode, SubmitMode, TextureDesc, TextureId, UniformUpload, UnitBinding,
};
use crate::render::types::{
    Access, BlendState, BufferUsageFlags, ColorChannelMask, CullMode, PixelFormat, Rect,
    TextureType, Viewport, Winding,
};
use crate::render::{RenderError, RenderResult};

/// When submitted command buffers complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Execute and complete at submission
    #[default]
    Immediate,
    /// Stay in flight until retired by the caller
    Manual,
}

/// Headless backend settings
#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    /// Default render target
    pub backbuffer: BackbufferConfig,
    /// Completion behavior
    pub completion: CompletionMode,
    /// Whether host-visible memory is coherent
    pub coherent_memory: bool,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            backbuffer: BackbufferConfig {
                width: 64,
                height: 64,
                msaa: 1,
                depth_stencil: true,
            },
            completion: CompletionMode::Immediate,
            coherent_memory: true,
        }
    }
}

impl HeadlessOptions {
    /// Options matching a graphics configuration
    pub fn from_config(config: &GraphicsConfig) -> Self {
        Self {
            backbuffer: config.backbuffer.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Recording,
    Submitted(u64),
    Completed,
}

#[derive(Debug)]
struct HeadlessCommandBuffer {
    commands: Vec<GpuCommand>,
    state: CommandBufferState,
    open_encoder: Option<EncoderId>,
}

#[derive(Debug, Clone, Copy)]
struct HeadlessEncoder {
    cmd: CommandBufferId,
    kind: EncoderKind,
    open: bool,
}

#[derive(Debug)]
struct HeadlessProgram {
    label: String,
    uniforms: HashMap<i32, Vec<u32>>,
}

/// Simulated GPU
pub struct HeadlessBackend {
    options: HeadlessOptions,
    buffers: SlotMap<BufferId, HeadlessBuffer>,
    textures: SlotMap<TextureId, HeadlessTexture>,
    samplers: SlotMap<SamplerId, SamplerDescriptor>,
    depth_stencil_states: SlotMap<DepthStencilId, DepthStencilDescriptor>,
    programs: SlotMap<ProgramId, HeadlessProgram>,
    command_buffers: SlotMap<CommandBufferId, HeadlessCommandBuffer>,
    encoders: SlotMap<EncoderId, HeadlessEncoder>,
    in_flight: VecDeque<(u64, CommandBufferId)>,
    completed: u64,
    presents: u64,
    lost: bool,
    refuse_command_buffers: bool,
    backbuffer: Backbuffer,
    calls: Vec<BackendCall>,
    hazards: Vec<String>,
    execution: ExecutionStats,
    stripped_uniforms: HashSet<String>,
    injected_uniforms: Vec<String>,
    texture_units: HashMap<u32, UnitBinding>,
    storage_buffers: HashMap<u32, Option<BufferId>>,
    storage_textures: HashMap<u32, Option<TextureId>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(HeadlessOptions::default())
    }
}

impl std::fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("in_flight", &self.in_flight.len())
            .field("completed", &self.completed)
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

impl HeadlessBackend {
    /// Create the backend and its backbuffer
    pub fn new(options: HeadlessOptions) -> Self {
        let config = options.backbuffer.clone();
        let mut textures = SlotMap::with_key();
        let target = |format: PixelFormat, samples: u32, label: &str| TextureDesc {
            texture_type: TextureType::Tex2D,
            format,
            width: config.width,
            height: config.height,
            layers: 1,
            mip_levels: 1,
            samples,
            render_target: true,
            storage: false,
            label: Some(label.to_string()),
        };

        let color = textures.insert(HeadlessTexture::new(target(PixelFormat::Rgba8Unorm, 1, "backbuffer")));
        let msaa_color = (config.msaa > 1).then(|| {
            textures.insert(HeadlessTexture::new(target(
                PixelFormat::Rgba8Unorm,
                config.msaa,
                "backbuffer msaa",
            )))
        });
        let depth_stencil = config.depth_stencil.then(|| {
            textures.insert(HeadlessTexture::new(target(
                PixelFormat::Depth24Stencil8,
                config.msaa,
                "backbuffer depth",
            )))
        });

        info!(
            "Headless backend ready: {}x{} backbuffer, msaa {}, {:?} completion",
            config.width, config.height, config.msaa, options.completion
        );

        Self {
            backbuffer: Backbuffer {
                color,
                msaa_color,
                depth_stencil,
                width: config.width,
                height: config.height,
            },
            options,
            buffers: SlotMap::with_key(),
            textures,
            samplers: SlotMap::with_key(),
            depth_stencil_states: SlotMap::with_key(),
            programs: SlotMap::with_key(),
            command_buffers: SlotMap::with_key(),
            encoders: SlotMap::with_key(),
            in_flight: VecDeque::new(),
            completed: 0,
            presents: 0,
            lost: false,
            refuse_command_buffers: false,
            calls: Vec::new(),
            hazards: Vec::new(),
            execution: ExecutionStats::default(),
            stripped_uniforms: HashSet::new(),
            injected_uniforms: Vec::new(),
            texture_units: HashMap::new(),
            storage_buffers: HashMap::new(),
            storage_textures: HashMap::new(),
        }
    }

    /// Every call so far
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    /// Forget recorded calls
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of recorded calls matching `predicate`
    pub fn count_calls(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    /// Detected misuse: destroyed objects referenced, encoders misused
    pub fn hazards(&self) -> &[String] {
        &self.hazards
    }

    /// Work executed by retired command buffers
    pub const fn execution_stats(&self) -> ExecutionStats {
        self.execution
    }

    /// Completed presents
    pub const fn presents(&self) -> u64 {
        self.presents
    }

    /// Command buffers submitted but not retired
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Live object counts: buffers, textures, samplers, programs
    pub fn live_objects(&self) -> (usize, usize, usize, usize) {
        (self.buffers.len(), self.textures.len(), self.samplers.len(), self.programs.len())
    }

    /// Whether a buffer still exists
    pub fn buffer_alive(&self, buffer: BufferId) -> bool {
        self.buffers.contains_key(buffer)
    }

    /// Whether a texture still exists
    pub fn texture_alive(&self, texture: TextureId) -> bool {
        self.textures.contains_key(texture)
    }

    /// Device-side contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.device.as_slice())
    }

    /// Contents of a texture, mip 0 of every layer
    pub fn texture_contents(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(texture).map(|t| t.data.as_slice())
    }

    /// Last words uploaded to a program location
    pub fn uniform_value(&self, program: ProgramId, location: i32) -> Option<&[u32]> {
        self.programs
            .get(program)
            .and_then(|p| p.uniforms.get(&location))
            .map(Vec::as_slice)
    }

    /// Resource bound to a texture unit
    pub fn texture_unit(&self, unit: u32) -> Option<UnitBinding> {
        self.texture_units.get(&unit).copied()
    }

    /// Buffer bound to a storage binding
    pub fn storage_buffer(&self, binding: u32) -> Option<BufferId> {
        self.storage_buffers.get(&binding).copied().flatten()
    }

    /// Texture bound to a storage texture binding
    pub fn storage_texture(&self, binding: u32) -> Option<TextureId> {
        self.storage_textures.get(&binding).copied().flatten()
    }

    /// Have the linker drop `name` from the active uniform and block lists
    pub fn strip_uniform(&mut self, name: &str) {
        self.stripped_uniforms.insert(name.to_string());
    }

    /// Have the linker report an active uniform no declaration mentions
    pub fn inject_uniform(&mut self, name: &str) {
        self.injected_uniforms.push(name.to_string());
    }

    /// Simulate device loss
    pub fn lose_device(&mut self) {
        warn!("Headless device lost");
        self.lost = true;
    }

    /// Make command buffer allocation fail as if the device went away mid-call
    ///
    /// Resource creation keeps working, so a failure lands between creating a
    /// resource and recording the command that uses it.
    pub fn refuse_command_buffers(&mut self) {
        self.refuse_command_buffers = true;
    }

    /// Retire the oldest in-flight command buffer, returns its index
    pub fn retire_next(&mut self) -> Option<u64> {
        if self.lost {
            return None;
        }
        let (index, cmd) = self.in_flight.pop_front()?;
        self.execute(index, cmd);
        Some(index)
    }

    /// Retire every command buffer up to and including `index`
    pub fn retire_through(&mut self, index: u64) {
        while self.in_flight.front().is_some_and(|(i, _)| *i <= index) {
            if self.retire_next().is_none() {
                break;
            }
        }
    }

    /// Retire everything in flight
    pub fn retire_all(&mut self) {
        while self.retire_next().is_some() {}
    }

    fn execute(&mut self, index: u64, cmd: CommandBufferId) {
        let Some(buffer) = self.command_buffers.get_mut(cmd) else {
            self.hazards.push(format!("[{index}] command buffer vanished before execution"));
            return;
        };
        let commands = std::mem::take(&mut buffer.commands);
        buffer.state = CommandBufferState::Completed;

        Executor {
            buffers: &mut self.buffers,
            textures: &mut self.textures,
            hazards: &mut self.hazards,
            stats: &mut self.execution,
            pass: None,
        }
        .run(index, &commands);

        self.completed = self.completed.max(index);
    }

    fn check_alive(&self) -> RenderResult<()> {
        if self.lost {
            Err(RenderError::DeviceLost("headless device lost".to_string()))
        } else {
            Ok(())
        }
    }

    fn hazard(&mut self, message: String) {
        log::error!("{}", message);
        self.hazards.push(message);
    }

    /// Append `command` to the command buffer behind `encoder` if the encoder
    /// is open and of the required kind
    fn record(&mut self, encoder: EncoderId, kinds: &[EncoderKind], command: GpuCommand) {
        if self.lost {
            return;
        }
        let Some(state) = self.encoders.get(encoder).copied() else {
            self.hazard(format!("recording into unknown encoder {encoder:?}"));
            return;
        };
        if !state.open {
            self.hazard(format!("recording into ended {:?} encoder", state.kind));
            return;
        }
        if !kinds.contains(&state.kind) {
            self.hazard(format!("{command:?} recorded into {:?} encoder", state.kind));
            return;
        }
        match self.command_buffers.get_mut(state.cmd) {
            Some(cmd) if cmd.state == CommandBufferState::Recording => cmd.commands.push(command),
            _ => self.hazard("recording into a submitted command buffer".to_string()),
        }
    }

    fn require_buffer(&mut self, buffer: BufferId, what: &str) -> bool {
        let alive = self.buffers.contains_key(buffer);
        if !alive {
            self.hazard(format!("{what} references destroyed buffer {buffer:?}"));
        }
        alive
    }

    fn require_texture(&mut self, texture: TextureId, what: &str) -> bool {
        let alive = self.textures.contains_key(texture);
        if !alive {
            self.hazard(format!("{what} references destroyed texture {texture:?}"));
        }
        alive
    }

    fn buffer_range(&self, buffer: BufferId, offset: u64, size: u64) -> Option<std::ops::Range<usize>> {
        let stored = self.buffers.get(buffer)?;
        let end = offset.checked_add(size)?;
        (stored.location.is_host_visible() && end <= stored.device.len() as u64)
            .then(|| offset as usize..end as usize)
    }

    fn link_log(desc: &ProgramDesc<'_>) -> Result<(), String> {
        if desc.stages.is_empty() {
            return Err("program has no stages".to_string());
        }
        for stage in desc.stages {
            if stage.code.is_empty() {
                return Err(format!("{:?} stage has no code", stage.stage));
            }
            if let ShaderCode::Source(source) = &stage.code {
                if let Some(line) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
                    return Err(format!("{:?} stage: {}", stage.stage, line.trim()));
                }
            }
        }
        Ok(())
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn backbuffer(&self) -> Backbuffer {
        self.backbuffer
    }

    fn begin_command_buffer(&mut self) -> RenderResult<CommandBufferId> {
        self.check_alive()?;
        if self.refuse_command_buffers {
            return Err(RenderError::DeviceLost("command buffer allocation failed".to_string()));
        }
        self.calls.push(BackendCall::BeginCommandBuffer);
        Ok(self.command_buffers.insert(HeadlessCommandBuffer {
            commands: Vec::new(),
            state: CommandBufferState::Recording,
            open_encoder: None,
        }))
    }

    fn submit_command_buffer(&mut self, cmd: CommandBufferId, index: u64, mode: SubmitMode) -> RenderResult<()> {
        self.check_alive()?;
        self.calls.push(BackendCall::Submit { index, mode });

        let Some(buffer) = self.command_buffers.get_mut(cmd) else {
            return Err(RenderError::BackendError(format!("Unknown command buffer {cmd:?}")));
        };
        if buffer.state != CommandBufferState::Recording {
            return Err(RenderError::BackendError("Command buffer submitted twice".to_string()));
        }
        if buffer.open_encoder.is_some() {
            self.hazard(format!("command buffer {index} submitted with an open encoder"));
        }
        if let Some(buffer) = self.command_buffers.get_mut(cmd) {
            buffer.state = CommandBufferState::Submitted(index);
        }
        if mode == SubmitMode::Present {
            self.presents += 1;
        }

        self.in_flight.push_back((index, cmd));
        if self.options.completion == CompletionMode::Immediate {
            self.retire_all();
        }
        Ok(())
    }

    fn completed_index(&mut self) -> RenderResult<u64> {
        self.check_alive()?;
        Ok(self.completed)
    }

    fn release_command_buffer(&mut self, cmd: CommandBufferId) {
        match self.command_buffers.get(cmd).map(|b| b.state) {
            Some(CommandBufferState::Completed) => {
                self.command_buffers.remove(cmd);
            }
            Some(state) => self.hazard(format!("command buffer released in state {state:?}")),
            None => self.hazard(format!("unknown command buffer {cmd:?} released")),
        }
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.check_alive()?;
        self.retire_all();
        Ok(())
    }

    fn begin_encoder(
        &mut self,
        cmd: CommandBufferId,
        kind: EncoderKind,
        pass: Option<&RenderPassDesc>,
    ) -> RenderResult<EncoderId> {
        self.check_alive()?;
        self.calls.push(BackendCall::BeginEncoder { kind });

        let pass = match (kind, pass) {
            (EncoderKind::Render, None) => {
                return Err(RenderError::BackendError("Render encoder needs a pass".to_string()));
            }
            (EncoderKind::Render, Some(pass)) => Some(pass.clone()),
            _ => None,
        };
        if let Some(pass) = &pass {
            let targets: Vec<TextureId> = pass
                .colors
                .iter()
                .flat_map(|c| std::iter::once(c.texture).chain(c.resolve))
                .chain(pass.depth_stencil.as_ref().map(|d| d.texture))
                .collect();
            for texture in targets {
                self.require_texture(texture, "render pass");
            }
        }

        let open = match self.command_buffers.get(cmd) {
            Some(buffer) if buffer.state == CommandBufferState::Recording => buffer.open_encoder,
            _ => return Err(RenderError::BackendError(format!("Command buffer {cmd:?} is not recording"))),
        };
        if open.is_some() {
            self.hazard(format!("{kind:?} encoder began while another encoder is open"));
        }

        let id = self.encoders.insert(HeadlessEncoder { cmd, kind, open: true });
        if let Some(buffer) = self.command_buffers.get_mut(cmd) {
            buffer.open_encoder = Some(id);
            if let Some(pass) = pass {
                buffer.commands.push(GpuCommand::BeginPass(pass));
            }
        }
        Ok(id)
    }

    fn end_encoder(&mut self, encoder: EncoderId, store: Option<&AttachmentStoreActions>) {
        let Some(state) = self.encoders.get_mut(encoder) else {
            self.hazard(format!("unknown encoder {encoder:?} ended"));
            return;
        };
        state.open = false;
        let state = *state;
        self.calls.push(BackendCall::EndEncoder {
            kind: state.kind,
            store: store.cloned(),
        });

        if let Some(buffer) = self.command_buffers.get_mut(state.cmd) {
            buffer.open_encoder = None;
            if state.kind == EncoderKind::Render {
                buffer
                    .commands
                    .push(GpuCommand::EndPass(store.cloned().unwrap_or_default()));
            }
        }
        self.encoders.remove(encoder);
    }

    fn set_viewport(&mut self, encoder: EncoderId, viewport: &Viewport) {
        self.calls.push(BackendCall::SetViewport(*viewport));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_scissor(&mut self, encoder: EncoderId, scissor: Option<Rect>) {
        self.calls.push(BackendCall::SetScissor(scissor));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_blend_state(&mut self, encoder: EncoderId, blend: &BlendState) {
        self.calls.push(BackendCall::SetBlend(*blend));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_color_mask(&mut self, encoder: EncoderId, mask: ColorChannelMask) {
        self.calls.push(BackendCall::SetColorMask(mask));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_depth_stencil_state(&mut self, encoder: EncoderId, state: DepthStencilId, reference: u32) {
        self.calls.push(BackendCall::SetDepthStencil { state, reference });
        if !self.depth_stencil_states.contains_key(state) {
            self.hazard(format!("unknown depth/stencil object {state:?}"));
        }
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_cull_mode(&mut self, encoder: EncoderId, mode: CullMode) {
        self.calls.push(BackendCall::SetCullMode(mode));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_front_face(&mut self, encoder: EncoderId, winding: Winding) {
        self.calls.push(BackendCall::SetFrontFace(winding));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn set_wireframe(&mut self, encoder: EncoderId, enabled: bool) {
        self.calls.push(BackendCall::SetWireframe(enabled));
        self.require_open(encoder, EncoderKind::Render);
    }

    fn bind_program(&mut self, encoder: EncoderId, program: ProgramId) {
        self.calls.push(BackendCall::BindProgram(program));
        let kind = self.encoders.get(encoder).map(|e| e.kind);
        if !matches!(kind, Some(EncoderKind::Render | EncoderKind::Compute)) {
            self.hazard(format!("program bound to {kind:?} encoder"));
        }
    }

    fn draw(&mut self, encoder: EncoderId, draw: &DrawCommand) {
        self.calls.push(BackendCall::Draw {
            vertex_count: draw.vertex_count,
            instance_count: draw.instance_count,
        });
        for binding in &draw.vertex_buffers {
            self.require_buffer(binding.buffer, "draw");
        }
        self.record(encoder, &[EncoderKind::Render], GpuCommand::Draw);
    }

    fn draw_indexed(&mut self, encoder: EncoderId, draw: &DrawIndexedCommand) {
        self.calls.push(BackendCall::DrawIndexed {
            index_count: draw.index_count,
            instance_count: draw.instance_count,
        });
        self.require_buffer(draw.index_buffer, "indexed draw");
        for binding in &draw.vertex_buffers {
            self.require_buffer(binding.buffer, "indexed draw");
        }
        self.record(encoder, &[EncoderKind::Render], GpuCommand::Draw);
    }

    fn clear_attachments(&mut self, encoder: EncoderId, clear: &ClearValues) {
        self.calls.push(BackendCall::ClearAttachments);
        self.record(encoder, &[EncoderKind::Render], GpuCommand::ClearAttachments(clear.clone()));
    }

    fn dispatch(&mut self, encoder: EncoderId, groups: [u32; 3]) {
        self.calls.push(BackendCall::Dispatch(groups));
        self.record(encoder, &[EncoderKind::Compute], GpuCommand::Dispatch);
    }

    fn copy_buffer(&mut self, encoder: EncoderId, src: BufferId, dst: BufferId, region: &BufferCopy) {
        self.calls.push(BackendCall::CopyBuffer {
            src,
            dst,
            region: *region,
        });
        if self.require_buffer(src, "copy") && self.require_buffer(dst, "copy") {
            self.record(
                encoder,
                &[EncoderKind::Blit],
                GpuCommand::CopyBuffer {
                    src,
                    dst,
                    region: *region,
                },
            );
        }
    }

    fn fill_buffer_zero(&mut self, encoder: EncoderId, dst: BufferId, offset: u64, size: u64) {
        self.calls.push(BackendCall::FillZero { dst, offset, size });
        if self.require_buffer(dst, "fill") {
            self.record(encoder, &[EncoderKind::Blit], GpuCommand::FillZero { dst, offset, size });
        }
    }

    fn copy_buffer_to_texture(
        &mut self,
        encoder: EncoderId,
        src: BufferId,
        dst: TextureId,
        region: &BufferTextureCopy,
    ) {
        self.calls.push(BackendCall::CopyBufferToTexture { dst, region: *region });
        if self.require_buffer(src, "upload") && self.require_texture(dst, "upload") {
            self.record(
                encoder,
                &[EncoderKind::Blit],
                GpuCommand::BufferToTexture {
                    src,
                    dst,
                    region: *region,
                },
            );
        }
    }

    fn copy_texture_to_buffer(
        &mut self,
        encoder: EncoderId,
        src: TextureId,
        dst: BufferId,
        region: &BufferTextureCopy,
    ) {
        self.calls.push(BackendCall::CopyTextureToBuffer { src, region: *region });
        if self.require_texture(src, "readback") && self.require_buffer(dst, "readback") {
            self.record(
                encoder,
                &[EncoderKind::Blit],
                GpuCommand::TextureToBuffer {
                    src,
                    dst,
                    region: *region,
                },
            );
        }
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RenderResult<BufferId> {
        self.check_alive()?;
        if desc.usage.contains(BufferUsageFlags::TEXEL) && desc.texel_format.is_none() {
            return Err(RenderError::ResourceCreationFailed(
                "Texel buffer without a view format".to_string(),
            ));
        }
        let id = self.buffers.insert(HeadlessBuffer::new(
            desc.size,
            desc.location,
            self.options.coherent_memory,
        ));
        self.calls.push(BackendCall::CreateBuffer {
            id,
            size: desc.size,
            location: desc.location,
            dedicated: desc.dedicated,
        });
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.calls.push(BackendCall::DestroyBuffer(buffer));
        if self.buffers.remove(buffer).is_none() {
            self.hazard(format!("buffer {buffer:?} destroyed twice"));
        }
    }

    fn is_coherent(&self, buffer: BufferId) -> bool {
        self.buffers.get(buffer).map_or(true, HeadlessBuffer::is_coherent)
    }

    fn mapped_range(&self, buffer: BufferId, offset: u64, size: u64) -> Option<&[u8]> {
        let range = self.buffer_range(buffer, offset, size)?;
        self.buffers.get(buffer).map(|b| &b.host_view()[range])
    }

    fn mapped_range_mut(&mut self, buffer: BufferId, offset: u64, size: u64) -> Option<&mut [u8]> {
        let range = self.buffer_range(buffer, offset, size)?;
        self.buffers.get_mut(buffer).map(|b| &mut b.host_view_mut()[range])
    }

    fn flush_mapped_range(&mut self, buffer: BufferId, offset: u64, size: u64) {
        self.calls.push(BackendCall::FlushMapped { buffer, offset, size });
        if let Some(range) = self.buffer_range(buffer, offset, size) {
            if let Some(stored) = self.buffers.get_mut(buffer) {
                stored.flush(range.start, range.len());
            }
        }
    }

    fn invalidate_mapped_range(&mut self, buffer: BufferId, offset: u64, size: u64) {
        self.calls.push(BackendCall::InvalidateMapped { buffer, offset, size });
        if let Some(range) = self.buffer_range(buffer, offset, size) {
            if let Some(stored) = self.buffers.get_mut(buffer) {
                stored.invalidate(range.start, range.len());
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> RenderResult<TextureId> {
        self.check_alive()?;
        let id = self.textures.insert(HeadlessTexture::new(desc.clone()));
        self.calls.push(BackendCall::CreateTexture(id));
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.calls.push(BackendCall::DestroyTexture(texture));
        if self.textures.remove(texture).is_none() {
            self.hazard(format!("texture {texture:?} destroyed twice"));
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> RenderResult<SamplerId> {
        self.check_alive()?;
        let id = self.samplers.insert(*desc);
        self.calls.push(BackendCall::CreateSampler(id));
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        self.calls.push(BackendCall::DestroySampler(sampler));
        self.samplers.remove(sampler);
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDescriptor) -> RenderResult<DepthStencilId> {
        self.check_alive()?;
        let id = self.depth_stencil_states.insert(*desc);
        self.calls.push(BackendCall::CreateDepthStencil(id));
        Ok(id)
    }

    fn destroy_depth_stencil_state(&mut self, state: DepthStencilId) {
        self.calls.push(BackendCall::DestroyDepthStencil(state));
        self.depth_stencil_states.remove(state);
    }

    fn create_program(&mut self, desc: &ProgramDesc<'_>) -> RenderResult<LinkedProgram> {
        self.check_alive()?;
        if let Err(log) = Self::link_log(desc) {
            return Err(RenderError::LinkFailure {
                shader: desc.label.to_string(),
                log,
            });
        }

        let mut uniforms: Vec<ActiveUniform> = desc
            .reflection
            .uniforms()
            .filter(|info| !self.stripped_uniforms.contains(&info.name))
            .map(|info| ActiveUniform {
                name: if info.count > 1 {
                    format!("{}[0]", info.name)
                } else {
                    info.name.clone()
                },
                location: 0,
                count: info.count,
            })
            .collect();
        uniforms.extend(self.injected_uniforms.iter().map(|name| ActiveUniform {
            name: name.clone(),
            location: 0,
            count: 1,
        }));
        for (location, uniform) in uniforms.iter_mut().enumerate() {
            uniform.location = location as i32;
        }

        let storage_blocks = desc
            .reflection
            .storage_blocks()
            .filter(|info| !self.stripped_uniforms.contains(&info.name))
            .map(|info| info.name.clone())
            .collect();

        let program = self.programs.insert(HeadlessProgram {
            label: desc.label.to_string(),
            uniforms: HashMap::new(),
        });
        self.calls.push(BackendCall::CreateProgram(program));
        debug!("Linked headless program '{}'", desc.label);

        Ok(LinkedProgram {
            program,
            uniforms,
            storage_blocks,
            log: String::new(),
        })
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.calls.push(BackendCall::DestroyProgram(program));
        match self.programs.remove(program) {
            Some(removed) => debug!("Destroyed headless program '{}'", removed.label),
            None => self.hazard(format!("program {program:?} destroyed twice")),
        }
    }

    fn set_uniform(&mut self, program: ProgramId, location: i32, upload: &UniformUpload<'_>) {
        self.calls.push(BackendCall::SetUniform {
            program,
            location,
            words: upload.words.to_vec(),
        });
        match self.programs.get_mut(program) {
            Some(stored) => {
                stored.uniforms.insert(location, upload.words.to_vec());
            }
            None => self.hazard(format!("uniform upload to destroyed program {program:?}")),
        }
    }

    fn bind_texture_unit(&mut self, unit: u32, binding: UnitBinding) {
        self.calls.push(BackendCall::BindTextureUnit { unit, binding });
        match binding {
            UnitBinding::Texture { texture, .. } => {
                self.require_texture(texture, "texture unit");
            }
            UnitBinding::TexelBuffer(buffer) => {
                self.require_buffer(buffer, "texel buffer unit");
            }
        }
        self.texture_units.insert(unit, binding);
    }

    fn bind_storage_texture(
        &mut self,
        binding: u32,
        texture: Option<TextureId>,
        _access: Access,
        _format: PixelFormat,
    ) {
        self.calls.push(BackendCall::BindStorageTexture { binding, texture });
        if let Some(texture) = texture {
            self.require_texture(texture, "storage texture");
        }
        self.storage_textures.insert(binding, texture);
    }

    fn bind_storage_buffer(&mut self, binding: u32, buffer: Option<BufferId>) {
        self.calls.push(BackendCall::BindStorageBuffer { binding, buffer });
        if let Some(buffer) = buffer {
            self.require_buffer(buffer, "storage buffer");
        }
        self.storage_buffers.insert(binding, buffer);
    }
}

impl HeadlessBackend {
    fn require_open(&mut self, encoder: EncoderId, kind: EncoderKind) {
        match self.encoders.get(encoder) {
            Some(state) if state.open && state.kind == kind => {}
            Some(state) => {
                let message = format!("{kind:?} state set on {:?} encoder (open: {})", state.kind, state.open);
                self.hazard(message);
            }
            None => self.hazard(format!("state set on unknown encoder {encoder:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::MemoryLocation;

    #[test]
    fn test_manual_completion_holds_work() {
        let mut backend = HeadlessBackend::new(HeadlessOptions {
            completion: CompletionMode::Manual,
            ..HeadlessOptions::default()
        });
        let cmd = backend.begin_command_buffer().unwrap();
        backend.submit_command_buffer(cmd, 1, SubmitMode::Standard).unwrap();

        assert_eq!(backend.completed_index().unwrap(), 0);
        assert_eq!(backend.retire_next(), Some(1));
        assert_eq!(backend.completed_index().unwrap(), 1);
        backend.release_command_buffer(cmd);
        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn test_lost_device_fails_device_calls() {
        let mut backend = HeadlessBackend::default();
        backend.lose_device();
        assert!(matches!(backend.begin_command_buffer(), Err(RenderError::DeviceLost(_))));
        assert!(matches!(backend.completed_index(), Err(RenderError::DeviceLost(_))));
    }

    #[test]
    fn test_copy_executes_at_retirement() {
        let mut backend = HeadlessBackend::new(HeadlessOptions {
            completion: CompletionMode::Manual,
            ..HeadlessOptions::default()
        });
        let desc = |location| BufferDesc {
            size: 4,
            usage: BufferUsageFlags::COPY_SOURCE | BufferUsageFlags::COPY_DEST,
            location,
            dedicated: false,
            texel_format: None,
            label: None,
        };
        let src = backend.create_buffer(&desc(MemoryLocation::HostUpload)).unwrap();
        let dst = backend.create_buffer(&desc(MemoryLocation::DeviceLocal)).unwrap();
        backend.mapped_range_mut(src, 0, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);

        let cmd = backend.begin_command_buffer().unwrap();
        let blit = backend.begin_encoder(cmd, EncoderKind::Blit, None).unwrap();
        backend.copy_buffer(
            blit,
            src,
            dst,
            &BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            },
        );
        backend.end_encoder(blit, None);
        backend.submit_command_buffer(cmd, 1, SubmitMode::Standard).unwrap();

        assert_eq!(backend.buffer_contents(dst).unwrap(), &[0, 0, 0, 0]);
        backend.retire_all();
        assert_eq!(backend.buffer_contents(dst).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_destroyed_source_is_a_hazard() {
        let mut backend = HeadlessBackend::new(HeadlessOptions {
            completion: CompletionMode::Manual,
            ..HeadlessOptions::default()
        });
        let desc = BufferDesc {
            size: 4,
            usage: BufferUsageFlags::COPY_SOURCE,
            location: MemoryLocation::HostUpload,
            dedicated: false,
            texel_format: None,
            label: None,
        };
        let src = backend.create_buffer(&desc).unwrap();
        let dst = backend.create_buffer(&desc).unwrap();

        let cmd = backend.begin_command_buffer().unwrap();
        let blit = backend.begin_encoder(cmd, EncoderKind::Blit, None).unwrap();
        backend.copy_buffer(
            blit,
            src,
            dst,
            &BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            },
        );
        backend.end_encoder(blit, None);
        backend.submit_command_buffer(cmd, 1, SubmitMode::Standard).unwrap();
        backend.destroy_buffer(src);
        backend.retire_all();

        assert_eq!(backend.hazards().len(), 1);
    }
}

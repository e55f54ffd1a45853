//! # Graphics Facade
//!
//! [`Graphics`] ties the rendering core together behind the operations a
//! drawing API issues: state setters, draws and dispatches, clears, presents,
//! and buffer/texture/shader/readback factories.
//!
//! ## Frame Flow
//!
//! ```text
//! set_* ──► DirtyStateTracker ─┐
//! send_uniform ──► Shader ─────┤
//!                              ▼
//! draw ──► render encoder ──► apply dirty state ──► built-in uniforms ──► backend.draw
//! fill/replace ──► blit encoder (staging copy) ──► deferred staging release
//! present ──► submit(Present) ──► poll completion ──► drain deferred cleanup
//! ```
//!
//! Handles returned by the factories stay valid until released. Releasing a
//! resource removes it from every shader slot immediately and destroys it
//! once the GPU has finished the command buffer being recorded.
//!
//! ## Device Loss
//!
//! When the backend reports [`RenderError::DeviceLost`] the current frame is
//! abandoned, every pending cleanup runs, and every later call fails with
//! `DeviceLost`. Recovery means building a new `Graphics` on a new backend.

use std::collections::HashMap;

use log::{debug, error, info, trace, warn};
use nalgebra::{Matrix3, Matrix4};
use slotmap::SlotMap;

use super::backend::{
    Backbuffer, BufferId, ClearValues, ColorAttachment, DepthStencilAttachment, DepthStencilId,
    DrawCommand, DrawIndexedCommand, EncoderId, EncoderKind, GpuBackend, LoadAction, ProgramId,
    RenderPassDesc, SamplerDescriptor, SamplerId, ShaderStageSource, SubmitMode, TextureId,
    VertexBufferBinding,
};
use super::commands::CommandStream;
use super::resources::{
    Buffer, BufferSettings, DefaultResources, DeferredQueue, MapType, Readback, ReadbackId,
    ReadbackStatus, Texture, TextureSettings, TransferContext,
};
use super::shader::{BoundBuffer, BoundTexture, BuiltinUniform, Shader, ShaderReflection, UniformId, UniformValues};
use super::state::{CacheStats, DirtyStateTracker, StateObjectCache};
use super::types::{
    BlendState, BufferUsageFlags, Color, ColorChannelMask, CullMode, DepthState, PixelFormat, Rect,
    StencilState, TextureType, Viewport, Winding,
};
use super::{RenderError, RenderResult};
use crate::core::GraphicsConfig;

slotmap::new_key_type! {
    /// Handle to a linked shader
    pub struct ShaderId;
}

/// Color attachment of a render target set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTarget {
    /// Texture rendered into
    pub texture: TextureId,
    /// Array layer, cube face or volume slice
    pub slice: u32,
    /// Mip level
    pub mip: u32,
    /// Single-sampled texture receiving the resolve of a multisampled target
    pub resolve: Option<TextureId>,
}

impl ColorTarget {
    /// Slice 0, mip 0, no resolve
    pub const fn new(texture: TextureId) -> Self {
        Self {
            texture,
            slice: 0,
            mip: 0,
            resolve: None,
        }
    }

    /// Resolve into `target` when the pass ends
    #[must_use]
    pub const fn with_resolve(mut self, target: TextureId) -> Self {
        self.resolve = Some(target);
        self
    }
}

/// Textures drawn into instead of the backbuffer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderTargets {
    /// Color attachments
    pub colors: Vec<ColorTarget>,
    /// Depth/stencil attachment
    pub depth_stencil: Option<TextureId>,
}

/// Counters describing the work done so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphicsStats {
    /// Draws recorded
    pub draw_calls: u64,
    /// Dispatches recorded
    pub dispatches: u64,
    /// Active shader changes
    pub shader_switches: u64,
    /// State categories applied to encoders
    pub state_applications: u64,
    /// Encoders opened
    pub encoder_transitions: u64,
    /// Sampler cache counters
    pub sampler_cache: CacheStats,
    /// Depth/stencil cache counters
    pub depth_stencil_cache: CacheStats,
    /// Cleanups waiting on GPU completion
    pub pending_cleanups: usize,
    /// Cleanups run so far
    pub executed_cleanups: u64,
    /// Index of the last submitted command buffer
    pub last_submitted: u64,
    /// Highest completed index
    pub completed: u64,
}

#[derive(Debug, Clone, Default)]
struct PendingClear {
    colors: Vec<Option<Color>>,
    depth: Option<f64>,
    stencil: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    draw_calls: u64,
    dispatches: u64,
    shader_switches: u64,
}

/// The rendering core driving one backend
pub struct Graphics<B: GpuBackend> {
    backend: B,
    config: GraphicsConfig,
    stream: CommandStream,
    state: DirtyStateTracker,
    samplers: StateObjectCache<SamplerId>,
    depth_stencil_states: StateObjectCache<DepthStencilId>,
    deferred: DeferredQueue<B>,
    buffers: HashMap<BufferId, Buffer>,
    textures: HashMap<TextureId, Texture>,
    shaders: SlotMap<ShaderId, Shader>,
    active_shader: Option<ShaderId>,
    compute_program: Option<ProgramId>,
    readbacks: SlotMap<ReadbackId, Readback>,
    targets: Option<RenderTargets>,
    pending_clear: Option<PendingClear>,
    defaults: DefaultResources,
    counters: Counters,
    device_lost: bool,
    shut_down: bool,
    builtins_dirty: bool,
    transform: Matrix4<f32>,
    projection: Matrix4<f32>,
    color: Color,
    point_size: f32,
}

impl<B: GpuBackend> std::fmt::Debug for Graphics<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graphics")
            .field("backend", &self.backend.name())
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("shaders", &self.shaders.len())
            .field("device_lost", &self.device_lost)
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend> Graphics<B> {
    /// Take ownership of `backend` and create the default resources
    pub fn new(backend: B, config: GraphicsConfig) -> RenderResult<Self> {
        config.validate().map_err(|reason| {
            RenderError::ResourceCreationFailed(format!("Invalid graphics configuration: {reason}"))
        })?;
        info!(
            "Creating graphics for '{}' on the {} backend",
            config.application_name,
            backend.name()
        );

        let mut backend = backend;
        let mut stream = CommandStream::new();
        let mut deferred = DeferredQueue::new();
        let mut samplers = StateObjectCache::new();
        let mut buffers = HashMap::new();
        let mut textures = HashMap::new();

        let sampler_desc = SamplerDescriptor::default();
        let sampler = samplers.get_or_create(&sampler_desc, |d| backend.create_sampler(d))?;

        let defaults = {
            let mut ctx = TransferContext::new(&mut backend, &mut stream, &mut deferred);
            let mut bound = Vec::with_capacity(TextureType::ALL.len());
            for texture_type in TextureType::ALL {
                let settings = TextureSettings::new_2d(1, 1, PixelFormat::Rgba8Unorm)
                    .with_type(texture_type, 1)
                    .compute_write()
                    .with_label(format!("default {texture_type:?}"));
                let white = vec![255u8; 4 * settings.layers as usize];
                let texture = Texture::create(&mut ctx, settings, sampler, Some(&white))?;
                bound.push(texture.bound());
                textures.insert(texture.id(), texture);
            }
            let bound: [BoundTexture; 4] = bound
                .try_into()
                .map_err(|_| RenderError::ResourceCreationFailed("Default texture set is incomplete".to_string()))?;

            let texel = Buffer::create(
                &mut ctx,
                16,
                BufferSettings::new(BufferUsageFlags::TEXEL)
                    .with_texel_format(PixelFormat::Rgba8Unorm)
                    .with_label("default texel buffer"),
                None,
            )?;
            let storage = Buffer::create(
                &mut ctx,
                16,
                BufferSettings::new(BufferUsageFlags::SHADER_STORAGE).with_label("default storage buffer"),
                None,
            )?;
            let defaults = DefaultResources::new(bound, texel.bound(), storage.bound());
            buffers.insert(texel.id(), texel);
            buffers.insert(storage.id(), storage);
            defaults
        };

        let backbuffer = backend.backbuffer();
        let mut state = DirtyStateTracker::new();
        state.set_viewport(Viewport::from_size(backbuffer.width, backbuffer.height));

        Ok(Self {
            backend,
            config,
            stream,
            state,
            samplers,
            depth_stencil_states: StateObjectCache::new(),
            deferred,
            buffers,
            textures,
            shaders: SlotMap::with_key(),
            active_shader: None,
            compute_program: None,
            readbacks: SlotMap::with_key(),
            targets: None,
            pending_clear: None,
            defaults,
            counters: Counters::default(),
            device_lost: false,
            shut_down: false,
            builtins_dirty: true,
            transform: Matrix4::identity(),
            projection: Matrix4::identity(),
            color: Color::WHITE,
            point_size: 1.0,
        })
    }

    /// Backend in use
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend, for backend-specific controls
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Configuration this instance was created with
    pub const fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    /// Whether the device has been lost
    pub const fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// Placeholder resources bound to empty shader slots
    pub const fn default_resources(&self) -> &DefaultResources {
        &self.defaults
    }

    fn check_lost(&self) -> RenderResult<()> {
        if self.device_lost || self.shut_down {
            Err(RenderError::DeviceLost(
                "the device is gone; create a new Graphics instance".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Pass a result through, switching to the lost state on device loss
    fn guard<T>(&mut self, result: RenderResult<T>) -> RenderResult<T> {
        if let Err(RenderError::DeviceLost(reason)) = &result {
            if !self.device_lost {
                error!("Device lost: {}", reason);
                self.device_lost = true;
                self.pending_clear = None;
                self.stream.abandon();
                let ran = self.deferred.force_drain(&mut self.backend);
                debug!("Force-ran {} pending cleanups after device loss", ran);
            }
        }
        result
    }

    // ----------------------------------------------------------------------
    // Render state
    // ----------------------------------------------------------------------

    /// Set the blend equation
    pub fn set_blend_state(&mut self, blend: BlendState) {
        self.state.set_blend(blend);
    }

    /// Set the viewport
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.state.set_viewport(viewport);
    }

    /// Set or clear the scissor rectangle
    pub fn set_scissor(&mut self, scissor: Option<Rect>) {
        self.state.set_scissor(scissor);
    }

    /// Set the stencil test
    pub fn set_stencil(&mut self, stencil: StencilState) {
        self.state.set_stencil(stencil);
    }

    /// Set the depth test
    pub fn set_depth(&mut self, depth: DepthState) {
        self.state.set_depth(depth);
    }

    /// Set the color write mask
    pub fn set_color_mask(&mut self, mask: ColorChannelMask) {
        self.state.set_color_mask(mask);
    }

    /// Set face culling
    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.state.set_cull_mode(mode);
    }

    /// Set the front face winding
    pub fn set_front_face(&mut self, winding: Winding) {
        self.state.set_winding(winding);
    }

    /// Toggle wireframe rasterization
    pub fn set_wireframe(&mut self, enabled: bool) {
        self.state.set_wireframe(enabled);
    }

    /// Set the model-view transform sent to shaders declaring `TransformMatrix`
    pub fn set_transform(&mut self, transform: Matrix4<f32>) {
        self.transform = transform;
        self.builtins_dirty = true;
    }

    /// Set the projection sent to shaders declaring `ProjectionMatrix`
    pub fn set_projection(&mut self, projection: Matrix4<f32>) {
        self.projection = projection;
        self.builtins_dirty = true;
    }

    /// Set the constant color sent to shaders declaring `ConstantColor`
    pub fn set_color(&mut self, color: Color) {
        self.color = color;
        self.builtins_dirty = true;
    }

    /// Set the point size sent to shaders declaring `PointSize`
    pub fn set_point_size(&mut self, size: f32) {
        self.point_size = size;
        self.builtins_dirty = true;
    }

    /// Logical state as last set
    pub const fn state(&self) -> &DirtyStateTracker {
        &self.state
    }

    // ----------------------------------------------------------------------
    // Render targets
    // ----------------------------------------------------------------------

    /// Draw into textures instead of the backbuffer
    ///
    /// Every texture must be a live render target; resolve targets must be
    /// single-sampled and the same size. The current render pass ends.
    pub fn set_render_targets(&mut self, targets: RenderTargets) -> RenderResult<()> {
        self.check_lost()?;
        let (width, height) = self.validate_targets(&targets)?;
        let result = self.switch_targets(Some(targets), width, height);
        self.guard(result)
    }

    /// Draw into the backbuffer again
    pub fn reset_render_targets(&mut self) -> RenderResult<()> {
        self.check_lost()?;
        if self.targets.is_none() {
            return Ok(());
        }
        let backbuffer = self.backend.backbuffer();
        let result = self.switch_targets(None, backbuffer.width, backbuffer.height);
        self.guard(result)
    }

    /// Current render targets, `None` for the backbuffer
    pub const fn render_targets(&self) -> Option<&RenderTargets> {
        self.targets.as_ref()
    }

    fn switch_targets(&mut self, targets: Option<RenderTargets>, width: u32, height: u32) -> RenderResult<()> {
        self.realize_pending_clear()?;
        if self.stream.active_encoder().kind() == Some(EncoderKind::Render) {
            self.stream.end_encoder(&mut self.backend);
        }
        debug!("Render targets changed to {}x{}", width, height);
        self.targets = targets;
        self.state.set_viewport(Viewport::from_size(width, height));
        self.builtins_dirty = true;
        Ok(())
    }

    fn validate_targets(&self, targets: &RenderTargets) -> RenderResult<(u32, u32)> {
        let refuse = |reason: String| Err(RenderError::InvalidResourceState(reason));
        let lookup = |id: TextureId| {
            self.textures
                .get(&id)
                .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown texture {id:?}")))
        };

        if targets.colors.is_empty() && targets.depth_stencil.is_none() {
            return refuse("A render target set needs at least one attachment".to_string());
        }

        let mut size = None;
        for target in &targets.colors {
            let texture = lookup(target.texture)?;
            let settings = texture.settings();
            if !settings.render_target || settings.format.is_depth() {
                return refuse(format!("Texture {:?} is not a color render target", target.texture));
            }
            if target.mip >= settings.mip_levels || target.slice >= settings.layers {
                return refuse(format!("Slice {} mip {} does not exist", target.slice, target.mip));
            }
            let dims = texture.mip_size(target.mip);
            if let Some(resolve) = target.resolve {
                let resolve = lookup(resolve)?;
                if resolve.settings().msaa > 1 || resolve.mip_size(0) != dims {
                    return refuse("Resolve targets must be single-sampled and match the target size".to_string());
                }
            }
            if size.is_some_and(|s| s != dims) {
                return refuse("Render targets must all be the same size".to_string());
            }
            size = Some(dims);
        }

        if let Some(id) = targets.depth_stencil {
            let texture = lookup(id)?;
            if !texture.settings().format.is_depth() || !texture.settings().render_target {
                return refuse(format!("Texture {id:?} is not a depth/stencil render target"));
            }
            let dims = texture.mip_size(0);
            if size.is_some_and(|s| s != dims) {
                return refuse("Depth/stencil target size does not match the color targets".to_string());
            }
            size = Some(dims);
        }

        size.ok_or_else(|| RenderError::InvalidResourceState("Empty render target set".to_string()))
    }

    fn target_size(&self) -> (u32, u32) {
        let from_targets = self.targets.as_ref().and_then(|targets| {
            let color = targets
                .colors
                .first()
                .and_then(|c| self.textures.get(&c.texture).map(|t| t.mip_size(c.mip)));
            color.or_else(|| {
                targets
                    .depth_stencil
                    .and_then(|id| self.textures.get(&id).map(|t| t.mip_size(0)))
            })
        });
        from_targets.unwrap_or_else(|| {
            let backbuffer = self.backend.backbuffer();
            (backbuffer.width, backbuffer.height)
        })
    }

    /// Build the pass for the current targets, consuming any pending clear
    fn pass_desc(&mut self) -> RenderPassDesc {
        let clear = self.pending_clear.take().unwrap_or_default();
        let color_load = |index: usize| match clear.colors.get(index).copied().flatten() {
            Some(color) => (LoadAction::Clear, color),
            None => (LoadAction::Load, Color::TRANSPARENT),
        };
        let depth_stencil = |texture: TextureId| DepthStencilAttachment {
            texture,
            depth_load: if clear.depth.is_some() { LoadAction::Clear } else { LoadAction::Load },
            clear_depth: clear.depth.unwrap_or(1.0),
            stencil_load: if clear.stencil.is_some() { LoadAction::Clear } else { LoadAction::Load },
            clear_stencil: clear.stencil.unwrap_or(0),
        };
        let (width, height) = self.target_size();

        match &self.targets {
            Some(targets) => RenderPassDesc {
                colors: targets
                    .colors
                    .iter()
                    .enumerate()
                    .map(|(index, target)| {
                        let (load, clear) = color_load(index);
                        ColorAttachment {
                            texture: target.texture,
                            slice: target.slice,
                            mip: target.mip,
                            resolve: target.resolve,
                            load,
                            clear,
                        }
                    })
                    .collect(),
                depth_stencil: targets.depth_stencil.map(depth_stencil),
                width,
                height,
            },
            None => {
                let Backbuffer {
                    color,
                    msaa_color,
                    depth_stencil: depth,
                    ..
                } = self.backend.backbuffer();
                let (load, clear) = color_load(0);
                RenderPassDesc {
                    colors: vec![ColorAttachment {
                        texture: msaa_color.unwrap_or(color),
                        slice: 0,
                        mip: 0,
                        resolve: msaa_color.map(|_| color),
                        load,
                        clear,
                    }],
                    depth_stencil: depth.map(depth_stencil),
                    width,
                    height,
                }
            }
        }
    }

    fn render_encoder(&mut self) -> RenderResult<EncoderId> {
        if let (Some(EncoderKind::Render), Some(id)) =
            (self.stream.active_encoder().kind(), self.stream.active_encoder().id())
        {
            return Ok(id);
        }

        let pass = self.pass_desc();
        let used = self
            .stream
            .use_encoder(&mut self.backend, EncoderKind::Render, Some(&pass))?;
        if used.began {
            self.state.mark_all_dirty();
        }
        Ok(used.id)
    }

    fn realize_pending_clear(&mut self) -> RenderResult<()> {
        if self.pending_clear.is_some() {
            self.render_encoder()?;
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Clears and passes
    // ----------------------------------------------------------------------

    /// Clear color attachments (one entry per target, `None` skips), depth and stencil
    ///
    /// Inside a render pass this records an attachment clear; otherwise the
    /// clear becomes the load action of the next pass on the current targets.
    pub fn clear(&mut self, colors: &[Option<Color>], depth: Option<f64>, stencil: Option<u32>) -> RenderResult<()> {
        self.check_lost()?;

        if let (Some(EncoderKind::Render), Some(encoder)) =
            (self.stream.active_encoder().kind(), self.stream.active_encoder().id())
        {
            self.backend.clear_attachments(
                encoder,
                &ClearValues {
                    colors: colors.to_vec(),
                    depth,
                    stencil,
                },
            );
            return Ok(());
        }

        let pending = self.pending_clear.get_or_insert_with(PendingClear::default);
        if pending.colors.len() < colors.len() {
            pending.colors.resize(colors.len(), None);
        }
        for (slot, color) in pending.colors.iter_mut().zip(colors) {
            if color.is_some() {
                *slot = *color;
            }
        }
        pending.depth = depth.or(pending.depth);
        pending.stencil = stencil.or(pending.stencil);
        Ok(())
    }

    /// Mark attachments of the current pass as not needed once it ends
    ///
    /// Returns false when no render pass is open.
    pub fn discard(&mut self, colors: &[bool], depth_stencil: bool) -> bool {
        self.stream.discard(colors, depth_stencil)
    }

    // ----------------------------------------------------------------------
    // Shaders
    // ----------------------------------------------------------------------

    /// Link a shader from backend code and its declared interface
    pub fn new_shader(
        &mut self,
        name: &str,
        stages: &[ShaderStageSource],
        reflection: &ShaderReflection,
    ) -> RenderResult<ShaderId> {
        self.check_lost()?;
        let result = Shader::link(&mut self.backend, name, stages, reflection, &self.defaults);
        let shader = self.guard(result)?;
        Ok(self.shaders.insert(shader))
    }

    /// Shader by handle
    pub fn shader(&self, id: ShaderId) -> Option<&Shader> {
        self.shaders.get(id)
    }

    /// Currently active shader
    pub const fn active_shader(&self) -> Option<ShaderId> {
        self.active_shader
    }

    /// Make `id` the active shader
    ///
    /// Every binding slot is re-applied and uniform updates queued while the
    /// shader was inactive are flushed.
    pub fn set_shader(&mut self, id: ShaderId) -> RenderResult<()> {
        self.check_lost()?;
        if self.active_shader == Some(id) {
            return Ok(());
        }
        let shader = self
            .shaders
            .get_mut(id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown shader {id:?}")))?;

        let flushed = shader.attach(&mut self.backend);
        trace!("Shader '{}' attached, {} queued updates flushed", shader.name(), flushed);
        let program = (!shader.is_compute()).then(|| shader.program());

        self.state.set_program(program);
        self.active_shader = Some(id);
        self.builtins_dirty = true;
        self.counters.shader_switches += 1;
        Ok(())
    }

    /// Release a shader once the GPU is done with it
    pub fn release_shader(&mut self, id: ShaderId) -> RenderResult<()> {
        let shader = self
            .shaders
            .remove(id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown shader {id:?}")))?;
        if self.active_shader == Some(id) {
            self.active_shader = None;
            self.state.set_program(None);
        }
        let index = self.stream.pending_index();
        self.deferred
            .queue_cleanup(index, move |backend: &mut B| shader.destroy(backend));
        Ok(())
    }

    /// Uniform handle by name
    pub fn uniform_id(&self, shader: ShaderId, name: &str) -> Option<UniformId> {
        self.shaders.get(shader).and_then(|s| s.uniform_id(name))
    }

    /// Write uniform values; uploaded now if `shader` is active, otherwise when it next becomes active
    pub fn send_uniform(&mut self, shader: ShaderId, uniform: UniformId, values: UniformValues<'_>) -> RenderResult<()> {
        self.check_lost()?;
        let is_current = self.active_shader == Some(shader);
        let target = self
            .shaders
            .get_mut(shader)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown shader {shader:?}")))?;
        let count = target.write_uniform(uniform, values)?;
        target.update_uniform(&mut self.backend, uniform, count, is_current);
        Ok(())
    }

    /// Assign textures to a sampler or storage texture uniform; `None` binds the default
    pub fn send_textures(&mut self, shader: ShaderId, uniform: UniformId, textures: &[Option<TextureId>]) -> RenderResult<()> {
        self.check_lost()?;
        let bound = textures
            .iter()
            .map(|entry| {
                entry
                    .map(|id| {
                        self.textures
                            .get(&id)
                            .map(Texture::bound)
                            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown texture {id:?}")))
                    })
                    .transpose()
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let is_current = self.active_shader == Some(shader);
        let target = self
            .shaders
            .get_mut(shader)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown shader {shader:?}")))?;
        let displaced = target.send_textures(&mut self.backend, uniform, &bound, &self.defaults, is_current)?;
        trace!("{} textures displaced from shader slots", displaced.len());
        Ok(())
    }

    /// Assign buffers to a texel buffer or storage buffer uniform; `None` binds the default
    pub fn send_buffers(&mut self, shader: ShaderId, uniform: UniformId, buffers: &[Option<BufferId>]) -> RenderResult<()> {
        self.check_lost()?;
        let bound: Vec<Option<BoundBuffer>> = buffers
            .iter()
            .map(|entry| {
                entry
                    .map(|id| {
                        self.buffers
                            .get(&id)
                            .map(Buffer::bound)
                            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown buffer {id:?}")))
                    })
                    .transpose()
            })
            .collect::<RenderResult<_>>()?;

        let is_current = self.active_shader == Some(shader);
        let target = self
            .shaders
            .get_mut(shader)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown shader {shader:?}")))?;
        let displaced = target.send_buffers(&mut self.backend, uniform, &bound, &self.defaults, is_current)?;
        trace!("{} buffers displaced from shader slots", displaced.len());
        Ok(())
    }

    fn apply_builtins(&mut self) {
        if !self.builtins_dirty {
            return;
        }
        let Some(active) = self.active_shader else {
            return;
        };

        let (width, height) = self.target_size();
        let (flip, offset) = if self.targets.is_some() {
            (-1.0, height as f32)
        } else {
            (1.0, 0.0)
        };
        let normal = self
            .transform
            .fixed_view::<3, 3>(0, 0)
            .into_owned()
            .try_inverse()
            .map_or_else(Matrix3::identity, |m| m.transpose());

        let values: [(BuiltinUniform, Vec<f32>); 6] = [
            (BuiltinUniform::TransformMatrix, self.transform.as_slice().to_vec()),
            (BuiltinUniform::ProjectionMatrix, self.projection.as_slice().to_vec()),
            (BuiltinUniform::NormalMatrix, normal.as_slice().to_vec()),
            (BuiltinUniform::ConstantColor, self.color.to_array().to_vec()),
            (BuiltinUniform::ScreenSize, vec![width as f32, height as f32, flip, offset]),
            (BuiltinUniform::PointSize, vec![self.point_size]),
        ];

        let Some(shader) = self.shaders.get_mut(active) else {
            return;
        };
        for (builtin, floats) in values {
            let Some(id) = shader.builtin(builtin) else {
                continue;
            };
            match shader.write_uniform(id, UniformValues::Float(&floats)) {
                Ok(count) => shader.update_uniform(&mut self.backend, id, count, true),
                Err(err) => warn!("Built-in {} skipped: {}", builtin.name(), err),
            }
        }
        self.builtins_dirty = false;
    }

    // ----------------------------------------------------------------------
    // Buffers
    // ----------------------------------------------------------------------

    /// Create a buffer of `size` bytes, optionally filled with `data` from offset 0
    pub fn new_buffer(&mut self, size: u64, settings: BufferSettings, data: Option<&[u8]>) -> RenderResult<BufferId> {
        self.check_lost()?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = Buffer::create(&mut ctx, size, settings, data);
        let buffer = self.guard(result)?;
        let id = buffer.id();
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    /// Buffer by handle
    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    fn lookup_buffer(buffers: &mut HashMap<BufferId, Buffer>, id: BufferId) -> RenderResult<&mut Buffer> {
        buffers
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown buffer {id:?}")))
    }

    /// Write `data` at `offset` through a staging copy
    pub fn fill_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> RenderResult<()> {
        self.check_lost()?;
        let buffer = Self::lookup_buffer(&mut self.buffers, id)?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = buffer.fill(&mut ctx, offset, data);
        self.guard(result)
    }

    /// Map `size` bytes at `offset`
    ///
    /// Write mappings hand out staging memory that is copied into the buffer
    /// by [`Graphics::unmap_buffer`]; read mappings of readback buffers expose
    /// the buffer's own memory.
    pub fn map_buffer(&mut self, id: BufferId, map_type: MapType, offset: u64, size: u64) -> RenderResult<&mut [u8]> {
        self.check_lost()?;
        let buffer = Self::lookup_buffer(&mut self.buffers, id)?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = buffer.begin_map(&mut ctx, map_type, offset, size);
        let target = match result {
            Ok(target) => target,
            Err(err) => {
                warn!("Map of buffer {:?} refused: {}", id, err);
                return self.guard(Err(err));
            }
        };

        self.backend
            .mapped_range_mut(target.buffer, target.offset, target.size)
            .ok_or_else(|| RenderError::BackendError(format!("Buffer {:?} has no host mapping", target.buffer)))
    }

    /// Close a mapping, committing `used_size` bytes written at `used_offset` (buffer coordinates)
    pub fn unmap_buffer(&mut self, id: BufferId, used_offset: u64, used_size: u64) -> RenderResult<()> {
        self.check_lost()?;
        let buffer = Self::lookup_buffer(&mut self.buffers, id)?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = buffer.end_map(&mut ctx, used_offset, used_size);
        self.guard(result)
    }

    /// Record a GPU copy of `size` bytes between buffers
    pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, src_offset: u64, dst_offset: u64, size: u64) -> RenderResult<()> {
        self.check_lost()?;
        let unknown = |id: BufferId| RenderError::InvalidResourceState(format!("Unknown buffer {id:?}"));
        let source = self.buffers.get(&src).ok_or_else(|| unknown(src))?;
        let target = self.buffers.get(&dst).ok_or_else(|| unknown(dst))?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = source.copy_to(&mut ctx, target, src_offset, dst_offset, size);
        self.guard(result)
    }

    /// Release a buffer; it leaves every shader slot now and is destroyed once the GPU is done with it
    pub fn release_buffer(&mut self, id: BufferId) -> RenderResult<()> {
        if self.defaults.is_default_buffer(id) {
            return Err(RenderError::InvalidResourceState("Default buffers cannot be released".to_string()));
        }
        let buffer = self
            .buffers
            .remove(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown buffer {id:?}")))?;

        let active = self.active_shader;
        for (shader_id, shader) in &mut self.shaders {
            let scrubbed = shader.scrub_buffer(&mut self.backend, id, &self.defaults, active == Some(shader_id));
            if scrubbed > 0 {
                debug!("Buffer {:?} removed from {} slots of '{}'", id, scrubbed, shader.name());
            }
        }

        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        buffer.release(&mut ctx);
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Textures
    // ----------------------------------------------------------------------

    /// Create a texture, optionally uploading mip 0 of every layer
    pub fn new_texture(&mut self, settings: TextureSettings, data: Option<&[u8]>) -> RenderResult<TextureId> {
        self.check_lost()?;
        let sampler = self.sampler(&settings.sampler)?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = Texture::create(&mut ctx, settings, sampler, data);
        let texture = self.guard(result)?;
        let id = texture.id();
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn sampler(&mut self, desc: &SamplerDescriptor) -> RenderResult<SamplerId> {
        let result = self
            .samplers
            .get_or_create(desc, |d| self.backend.create_sampler(d));
        self.guard(result)
    }

    /// Texture by handle
    pub fn texture(&self, id: TextureId) -> Option<&Texture> {
        self.textures.get(&id)
    }

    /// Change a texture's sampler state; shaders pick it up on the next send
    pub fn set_texture_sampler(&mut self, id: TextureId, desc: SamplerDescriptor) -> RenderResult<()> {
        self.check_lost()?;
        let sampler = self.sampler(&desc)?;
        let texture = self
            .textures
            .get_mut(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown texture {id:?}")))?;
        texture.set_sampler(sampler, desc);
        Ok(())
    }

    /// Upload tightly packed pixels into `region` of `slice`/`mip`
    pub fn replace_pixels(&mut self, id: TextureId, data: &[u8], region: Rect, slice: u32, mip: u32) -> RenderResult<()> {
        self.check_lost()?;
        let texture = self
            .textures
            .get(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown texture {id:?}")))?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = texture.replace_pixels(&mut ctx, data, region, slice, mip);
        self.guard(result)
    }

    /// Release a texture; it leaves every shader slot and render target now and
    /// is destroyed once the GPU is done with it
    pub fn release_texture(&mut self, id: TextureId) -> RenderResult<()> {
        if self.defaults.is_default_texture(id) {
            return Err(RenderError::InvalidResourceState("Default textures cannot be released".to_string()));
        }
        if !self.textures.contains_key(&id) {
            return Err(RenderError::InvalidResourceState(format!("Unknown texture {id:?}")));
        }

        let targeted = self.targets.as_ref().is_some_and(|targets| {
            targets.depth_stencil == Some(id)
                || targets
                    .colors
                    .iter()
                    .any(|c| c.texture == id || c.resolve == Some(id))
        });
        if targeted && !self.device_lost {
            warn!("Texture {:?} released while bound as a render target", id);
            let backbuffer = self.backend.backbuffer();
            let result = self.switch_targets(None, backbuffer.width, backbuffer.height);
            self.guard(result)?;
        } else if targeted {
            self.targets = None;
        }

        let active = self.active_shader;
        for (shader_id, shader) in &mut self.shaders {
            let scrubbed = shader.scrub_texture(&mut self.backend, id, &self.defaults, active == Some(shader_id));
            if scrubbed > 0 {
                debug!("Texture {:?} removed from {} slots of '{}'", id, scrubbed, shader.name());
            }
        }

        if let Some(texture) = self.textures.remove(&id) {
            let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
            texture.release(&mut ctx);
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Readback
    // ----------------------------------------------------------------------

    /// Start copying `size` bytes at `offset` of a buffer back to the CPU
    ///
    /// The result becomes available once the command buffer being recorded
    /// has been submitted and has completed.
    pub fn readback_buffer(&mut self, id: BufferId, offset: u64, size: u64) -> RenderResult<ReadbackId> {
        self.check_lost()?;
        let buffer = self
            .buffers
            .get(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown buffer {id:?}")))?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = Readback::from_buffer(&mut ctx, buffer, offset, size);
        let readback = self.guard(result)?;
        Ok(self.readbacks.insert(readback))
    }

    /// Start copying a texture region back to the CPU
    pub fn readback_texture(&mut self, id: TextureId, region: Rect, slice: u32, mip: u32) -> RenderResult<ReadbackId> {
        self.check_lost()?;
        let texture = self
            .textures
            .get(&id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown texture {id:?}")))?;
        let mut ctx = TransferContext::new(&mut self.backend, &mut self.stream, &mut self.deferred);
        let result = Readback::from_texture(&mut ctx, texture, region, slice, mip);
        let readback = self.guard(result)?;
        Ok(self.readbacks.insert(readback))
    }

    /// Poll a readback; a completed readback is consumed
    pub fn readback_status(&mut self, id: ReadbackId) -> RenderResult<ReadbackStatus> {
        let completed = self.poll()?;
        let readback = self
            .readbacks
            .get(id)
            .ok_or_else(|| RenderError::InvalidResourceState(format!("Unknown readback {id:?}")))?;

        let status = readback.try_read(&mut self.backend, completed);
        if matches!(status, ReadbackStatus::Complete(_)) {
            if let Some(done) = self.readbacks.remove(id) {
                self.backend.destroy_buffer(done.staging());
            }
        }
        Ok(status)
    }

    // ----------------------------------------------------------------------
    // Work
    // ----------------------------------------------------------------------

    fn graphics_shader(&self) -> RenderResult<&Shader> {
        let shader = self
            .active_shader
            .and_then(|id| self.shaders.get(id))
            .ok_or_else(|| RenderError::InvalidResourceState("No shader is active".to_string()))?;
        if shader.is_compute() {
            return Err(RenderError::InvalidResourceState(format!(
                "Compute shader '{}' cannot draw",
                shader.name()
            )));
        }
        Ok(shader)
    }

    fn check_vertex_buffers(&self, bindings: &[VertexBufferBinding]) -> RenderResult<()> {
        match bindings.iter().find(|b| !self.buffers.contains_key(&b.buffer)) {
            Some(missing) => Err(RenderError::InvalidResourceState(format!(
                "Vertex buffer {:?} does not exist",
                missing.buffer
            ))),
            None => Ok(()),
        }
    }

    fn prepare_draw(&mut self) -> RenderResult<EncoderId> {
        let encoder = self.render_encoder()?;
        self.apply_builtins();
        self.state
            .apply(&mut self.backend, encoder, &mut self.depth_stencil_states)?;
        Ok(encoder)
    }

    /// Draw with the active shader into the current targets
    ///
    /// Refused without an active graphics shader or with unknown buffers;
    /// zero vertices or instances draws nothing.
    pub fn draw(&mut self, draw: &DrawCommand) -> RenderResult<()> {
        self.check_lost()?;
        self.graphics_shader()?;
        self.check_vertex_buffers(&draw.vertex_buffers)?;
        if draw.vertex_count == 0 || draw.instance_count == 0 {
            return Ok(());
        }

        let result = self.prepare_draw();
        let encoder = self.guard(result)?;
        self.backend.draw(encoder, draw);
        self.counters.draw_calls += 1;
        Ok(())
    }

    /// Indexed draw with the active shader into the current targets
    pub fn draw_indexed(&mut self, draw: &DrawIndexedCommand) -> RenderResult<()> {
        self.check_lost()?;
        self.graphics_shader()?;
        self.check_vertex_buffers(&draw.vertex_buffers)?;
        let index_buffer = self.buffers.get(&draw.index_buffer).ok_or_else(|| {
            RenderError::InvalidResourceState(format!("Index buffer {:?} does not exist", draw.index_buffer))
        })?;
        if !index_buffer.settings().usage.contains(BufferUsageFlags::INDEX) {
            return Err(RenderError::InvalidResourceState(format!(
                "Buffer {:?} was not created for index data",
                draw.index_buffer
            )));
        }
        if draw.index_count == 0 || draw.instance_count == 0 {
            return Ok(());
        }

        let result = self.prepare_draw();
        let encoder = self.guard(result)?;
        self.backend.draw_indexed(encoder, draw);
        self.counters.draw_calls += 1;
        Ok(())
    }

    /// Dispatch the active compute shader; any group count of zero does nothing
    pub fn dispatch(&mut self, groups: [u32; 3]) -> RenderResult<()> {
        self.check_lost()?;
        let shader = self
            .active_shader
            .and_then(|id| self.shaders.get(id))
            .ok_or_else(|| RenderError::InvalidResourceState("No shader is active".to_string()))?;
        if !shader.is_compute() {
            return Err(RenderError::InvalidResourceState(format!(
                "Shader '{}' has no compute stage",
                shader.name()
            )));
        }
        let program = shader.program();
        if groups.contains(&0) {
            return Ok(());
        }

        let result = self.stream.use_encoder(&mut self.backend, EncoderKind::Compute, None);
        let used = self.guard(result)?;
        if used.began || self.compute_program != Some(program) {
            self.backend.bind_program(used.id, program);
            self.compute_program = Some(program);
        }
        self.backend.dispatch(used.id, groups);
        self.counters.dispatches += 1;
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Submission and completion
    // ----------------------------------------------------------------------

    /// Submit the frame and present the backbuffer, returns the submission index
    pub fn present(&mut self) -> RenderResult<u64> {
        self.check_lost()?;
        let result = self.present_inner();
        self.guard(result)
    }

    fn present_inner(&mut self) -> RenderResult<u64> {
        self.realize_pending_clear()?;
        let index = self
            .stream
            .submit(&mut self.backend, SubmitMode::Present)?
            .unwrap_or_else(|| self.stream.last_submitted());
        self.compute_program = None;
        self.retire()?;

        let pending = self.deferred.len();
        if pending > self.config.pending_cleanup_warning {
            warn!(
                "{} cleanups pending after frame {}, the GPU may be falling behind",
                pending, index
            );
        }
        Ok(index)
    }

    /// Submit recorded work without presenting; `None` when nothing was recorded
    pub fn flush(&mut self) -> RenderResult<Option<u64>> {
        self.check_lost()?;
        let result = self
            .realize_pending_clear()
            .and_then(|()| self.stream.submit(&mut self.backend, SubmitMode::Standard));
        let submitted = self.guard(result)?;
        if submitted.is_some() {
            self.compute_program = None;
        }
        Ok(submitted)
    }

    /// Refresh the completed index and run cleanups it unblocks
    pub fn poll(&mut self) -> RenderResult<u64> {
        self.check_lost()?;
        let result = self.retire();
        self.guard(result)
    }

    fn retire(&mut self) -> RenderResult<u64> {
        let completed = self.stream.poll(&mut self.backend)?;
        self.deferred.drain_completed(completed, &mut self.backend);
        Ok(completed)
    }

    /// Highest completed index as of the last poll
    pub const fn completed_index(&self) -> u64 {
        self.stream.completed()
    }

    /// Index of the last submitted command buffer
    pub const fn last_submitted_index(&self) -> u64 {
        self.stream.last_submitted()
    }

    /// Index the command buffer being recorded will carry
    pub const fn pending_index(&self) -> u64 {
        self.stream.pending_index()
    }

    /// Counters
    pub fn stats(&self) -> GraphicsStats {
        GraphicsStats {
            draw_calls: self.counters.draw_calls,
            dispatches: self.counters.dispatches,
            shader_switches: self.counters.shader_switches,
            state_applications: self.state.applied_categories(),
            encoder_transitions: self.stream.encoder_transitions(),
            sampler_cache: self.samplers.stats(),
            depth_stencil_cache: self.depth_stencil_states.stats(),
            pending_cleanups: self.deferred.len(),
            executed_cleanups: self.deferred.executed(),
            last_submitted: self.stream.last_submitted(),
            completed: self.stream.completed(),
        }
    }

    // ----------------------------------------------------------------------
    // Teardown
    // ----------------------------------------------------------------------

    /// Finish outstanding work and destroy every object
    ///
    /// Blocks until the GPU is idle. After a device loss nothing is waited
    /// for. Safe to call more than once; `Drop` calls it.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        info!("Shutting down graphics on the {} backend", self.backend.name());

        let mut outcome = Ok(());
        if !self.device_lost {
            let result = self
                .stream
                .submit(&mut self.backend, SubmitMode::Standard)
                .and_then(|_| self.stream.wait_idle(&mut self.backend));
            if let Err(err) = self.guard(result) {
                outcome = Err(err);
            }
        }
        self.pending_clear = None;
        self.stream.abandon();
        self.deferred.force_drain(&mut self.backend);
        self.shut_down = true;

        for (_, readback) in self.readbacks.drain() {
            self.backend.destroy_buffer(readback.staging());
        }
        for (_, shader) in self.shaders.drain() {
            shader.destroy(&mut self.backend);
        }
        for (id, _) in self.buffers.drain() {
            self.backend.destroy_buffer(id);
        }
        for (id, _) in self.textures.drain() {
            self.backend.destroy_texture(id);
        }
        for sampler in self.samplers.drain() {
            self.backend.destroy_sampler(sampler);
        }
        for state in self.depth_stencil_states.drain() {
            self.backend.destroy_depth_stencil_state(state);
        }
        self.active_shader = None;
        self.targets = None;

        debug!("Graphics shut down");
        outcome
    }
}

impl<B: GpuBackend> Drop for Graphics<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("Graphics shutdown failed: {}", err);
        }
    }
}

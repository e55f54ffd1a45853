//! Lazy application of logical render state
//!
//! Setters only record the new value and raise a dirty bit. The native
//! commands are emitted right before a draw, once per dirty category, in a
//! fixed order. A freshly opened render encoder starts with no state, so every
//! bit is raised again when one begins.

use bitflags::bitflags;
use log::trace;

use super::cache::StateObjectCache;
use crate::render::backend::{DepthStencilDescriptor, DepthStencilId, EncoderId, GpuBackend, ProgramId};
use crate::render::types::{
    BlendState, ColorChannelMask, CullMode, DepthState, Rect, StencilState, Viewport, Winding,
};
use crate::render::RenderResult;

bitflags! {
    /// Categories of render state that need re-applying
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateBits: u32 {
        /// Blend equation
        const BLEND = 1 << 0;
        /// Viewport
        const VIEWPORT = 1 << 1;
        /// Scissor rectangle
        const SCISSOR = 1 << 2;
        /// Stencil test and reference
        const STENCIL = 1 << 3;
        /// Depth test
        const DEPTH = 1 << 4;
        /// Bound program
        const SHADER = 1 << 5;
        /// Color write mask
        const COLOR_MASK = 1 << 6;
        /// Face culling
        const CULL_MODE = 1 << 7;
        /// Front face winding
        const FACE_WINDING = 1 << 8;
        /// Wireframe rasterization
        const WIREFRAME = 1 << 9;
    }
}

/// Logical render state as last set by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    /// Blend equation
    pub blend: BlendState,
    /// Viewport
    pub viewport: Viewport,
    /// Scissor, `None` disables
    pub scissor: Option<Rect>,
    /// Stencil
    pub stencil: StencilState,
    /// Depth
    pub depth: DepthState,
    /// Program for draws
    pub program: Option<ProgramId>,
    /// Color write mask
    pub color_mask: ColorChannelMask,
    /// Face culling
    pub cull_mode: CullMode,
    /// Front face
    pub winding: Winding,
    /// Wireframe
    pub wireframe: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            blend: BlendState::default(),
            viewport: Viewport::default(),
            scissor: None,
            stencil: StencilState::default(),
            depth: DepthState::default(),
            program: None,
            color_mask: ColorChannelMask::all(),
            cull_mode: CullMode::None,
            winding: Winding::CounterClockwise,
            wireframe: false,
        }
    }
}

impl RenderState {
    /// Depth/stencil object matching the current depth and stencil state
    pub fn depth_stencil_descriptor(&self) -> DepthStencilDescriptor {
        DepthStencilDescriptor {
            depth: self.depth,
            stencil_action: self.stencil.action,
            stencil_compare: self.stencil.compare,
            stencil_read_mask: self.stencil.read_mask,
            stencil_write_mask: self.stencil.write_mask,
        }
    }
}

/// Current logical state plus the categories not yet applied to the encoder
#[derive(Debug)]
pub struct DirtyStateTracker {
    state: RenderState,
    dirty: StateBits,
    applied_categories: u64,
}

impl Default for DirtyStateTracker {
    fn default() -> Self {
        Self {
            state: RenderState::default(),
            dirty: StateBits::all(),
            applied_categories: 0,
        }
    }
}

impl DirtyStateTracker {
    /// Default state, everything dirty
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical state
    pub const fn state(&self) -> &RenderState {
        &self.state
    }

    /// Categories waiting to be applied
    pub const fn dirty(&self) -> StateBits {
        self.dirty
    }

    /// Total categories applied so far
    pub const fn applied_categories(&self) -> u64 {
        self.applied_categories
    }

    /// Raise every bit; called when a render encoder begins
    pub fn mark_all_dirty(&mut self) {
        self.dirty = StateBits::all();
    }

    /// Set the blend equation
    pub fn set_blend(&mut self, blend: BlendState) {
        self.state.blend = blend;
        self.dirty |= StateBits::BLEND;
    }

    /// Set the viewport
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.state.viewport = viewport;
        self.dirty |= StateBits::VIEWPORT;
    }

    /// Set or clear the scissor rectangle
    pub fn set_scissor(&mut self, scissor: Option<Rect>) {
        self.state.scissor = scissor;
        self.dirty |= StateBits::SCISSOR;
    }

    /// Set the stencil state
    pub fn set_stencil(&mut self, stencil: StencilState) {
        self.state.stencil = stencil;
        self.dirty |= StateBits::STENCIL;
    }

    /// Set the depth state
    pub fn set_depth(&mut self, depth: DepthState) {
        self.state.depth = depth;
        self.dirty |= StateBits::DEPTH;
    }

    /// Set the program used by draws
    pub fn set_program(&mut self, program: Option<ProgramId>) {
        self.state.program = program;
        self.dirty |= StateBits::SHADER;
    }

    /// Set the color write mask
    pub fn set_color_mask(&mut self, mask: ColorChannelMask) {
        self.state.color_mask = mask;
        self.dirty |= StateBits::COLOR_MASK;
    }

    /// Set face culling
    pub fn set_cull_mode(&mut self, mode: CullMode) {
        self.state.cull_mode = mode;
        self.dirty |= StateBits::CULL_MODE;
    }

    /// Set the front face winding
    pub fn set_winding(&mut self, winding: Winding) {
        self.state.winding = winding;
        self.dirty |= StateBits::FACE_WINDING;
    }

    /// Toggle wireframe
    pub fn set_wireframe(&mut self, wireframe: bool) {
        self.state.wireframe = wireframe;
        self.dirty |= StateBits::WIREFRAME;
    }

    /// Emit native commands for every dirty category and clear the applied bits
    ///
    /// Order: viewport, scissor, blend, color mask, depth+stencil, cull mode,
    /// winding, wireframe, shader. Depth and stencil share one cached object.
    /// The shader bit stays raised while no program is set.
    pub fn apply<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        encoder: EncoderId,
        depth_stencil_cache: &mut StateObjectCache<DepthStencilId>,
    ) -> RenderResult<StateBits> {
        let dirty = self.dirty;
        let mut applied = StateBits::empty();
        let state = &self.state;

        if dirty.contains(StateBits::VIEWPORT) {
            backend.set_viewport(encoder, &state.viewport);
            applied |= StateBits::VIEWPORT;
        }

        if dirty.contains(StateBits::SCISSOR) {
            backend.set_scissor(encoder, state.scissor);
            applied |= StateBits::SCISSOR;
        }

        if dirty.contains(StateBits::BLEND) {
            backend.set_blend_state(encoder, &state.blend);
            applied |= StateBits::BLEND;
        }

        if dirty.contains(StateBits::COLOR_MASK) {
            backend.set_color_mask(encoder, state.color_mask);
            applied |= StateBits::COLOR_MASK;
        }

        if dirty.intersects(StateBits::DEPTH | StateBits::STENCIL) {
            let desc = state.depth_stencil_descriptor();
            let object = depth_stencil_cache
                .get_or_create(&desc, |d| backend.create_depth_stencil_state(d))?;
            backend.set_depth_stencil_state(encoder, object, state.stencil.value);
            applied |= dirty & (StateBits::DEPTH | StateBits::STENCIL);
        }

        if dirty.contains(StateBits::CULL_MODE) {
            backend.set_cull_mode(encoder, state.cull_mode);
            applied |= StateBits::CULL_MODE;
        }

        if dirty.contains(StateBits::FACE_WINDING) {
            backend.set_front_face(encoder, state.winding);
            applied |= StateBits::FACE_WINDING;
        }

        if dirty.contains(StateBits::WIREFRAME) {
            backend.set_wireframe(encoder, state.wireframe);
            applied |= StateBits::WIREFRAME;
        }

        if dirty.contains(StateBits::SHADER) {
            if let Some(program) = state.program {
                backend.bind_program(encoder, program);
                applied |= StateBits::SHADER;
            }
        }

        if !applied.is_empty() {
            trace!("Applied render state {:?}", applied);
        }
        self.dirty.remove(applied);
        self.applied_categories += u64::from(applied.bits().count_ones());
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::headless::{BackendCall, HeadlessBackend};
    use crate::render::backend::{EncoderKind, RenderPassDesc};
    use crate::render::types::{CompareMode, StencilAction};

    fn render_encoder(backend: &mut HeadlessBackend) -> EncoderId {
        let cmd = backend.begin_command_buffer().unwrap();
        let backbuffer = backend.backbuffer();
        let pass = RenderPassDesc {
            colors: Vec::new(),
            depth_stencil: None,
            width: backbuffer.width,
            height: backbuffer.height,
        };
        backend.begin_encoder(cmd, EncoderKind::Render, Some(&pass)).unwrap()
    }

    #[test]
    fn test_starts_all_dirty() {
        let tracker = DirtyStateTracker::new();
        assert_eq!(tracker.dirty(), StateBits::all());
    }

    #[test]
    fn test_repeated_setter_applies_once() {
        let mut backend = HeadlessBackend::default();
        let encoder = render_encoder(&mut backend);
        let mut cache = StateObjectCache::new();
        let mut tracker = DirtyStateTracker::new();
        tracker.set_program(Some(ProgramId::default()));
        tracker.apply(&mut backend, encoder, &mut cache).unwrap();
        backend.clear_calls();

        for _ in 0..5 {
            tracker.set_blend(BlendState::replace());
        }
        let applied = tracker.apply(&mut backend, encoder, &mut cache).unwrap();

        assert_eq!(applied, StateBits::BLEND);
        assert_eq!(backend.count_calls(|c| matches!(c, BackendCall::SetBlend(_))), 1);
        assert_eq!(backend.calls().len(), 1);
    }

    #[test]
    fn test_clean_state_emits_nothing() {
        let mut backend = HeadlessBackend::default();
        let encoder = render_encoder(&mut backend);
        let mut cache = StateObjectCache::new();
        let mut tracker = DirtyStateTracker::new();
        tracker.set_program(Some(ProgramId::default()));

        tracker.apply(&mut backend, encoder, &mut cache).unwrap();
        backend.clear_calls();

        assert!(tracker.apply(&mut backend, encoder, &mut cache).unwrap().is_empty());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_application_order() {
        let mut backend = HeadlessBackend::default();
        let encoder = render_encoder(&mut backend);
        let mut cache = StateObjectCache::new();
        let mut tracker = DirtyStateTracker::new();
        tracker.set_program(Some(ProgramId::default()));
        backend.clear_calls();

        tracker.apply(&mut backend, encoder, &mut cache).unwrap();

        let order: Vec<&str> = backend
            .calls()
            .iter()
            .filter_map(|call| match call {
                BackendCall::SetViewport(_) => Some("viewport"),
                BackendCall::SetScissor(_) => Some("scissor"),
                BackendCall::SetBlend(_) => Some("blend"),
                BackendCall::SetColorMask(_) => Some("mask"),
                BackendCall::SetDepthStencil { .. } => Some("depth_stencil"),
                BackendCall::SetCullMode(_) => Some("cull"),
                BackendCall::SetFrontFace(_) => Some("winding"),
                BackendCall::SetWireframe(_) => Some("wireframe"),
                BackendCall::BindProgram(_) => Some("shader"),
                _ => None,
            })
            .collect();

        assert_eq!(
            order,
            vec!["viewport", "scissor", "blend", "mask", "depth_stencil", "cull", "winding", "wireframe", "shader"]
        );
    }

    #[test]
    fn test_depth_and_stencil_share_one_object() {
        let mut backend = HeadlessBackend::default();
        let encoder = render_encoder(&mut backend);
        let mut cache = StateObjectCache::new();
        let mut tracker = DirtyStateTracker::new();

        tracker.set_depth(DepthState {
            compare: CompareMode::LessEqual,
            write: true,
        });
        tracker.set_stencil(StencilState {
            action: StencilAction::Replace,
            value: 3,
            ..StencilState::default()
        });
        tracker.apply(&mut backend, encoder, &mut cache).unwrap();

        let sets: Vec<u32> = backend
            .calls()
            .iter()
            .filter_map(|call| match call {
                BackendCall::SetDepthStencil { reference, .. } => Some(*reference),
                _ => None,
            })
            .collect();
        assert_eq!(sets, vec![3]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shader_bit_waits_for_program() {
        let mut backend = HeadlessBackend::default();
        let encoder = render_encoder(&mut backend);
        let mut cache = StateObjectCache::new();
        let mut tracker = DirtyStateTracker::new();

        tracker.apply(&mut backend, encoder, &mut cache).unwrap();
        assert_eq!(tracker.dirty(), StateBits::SHADER);
    }
}

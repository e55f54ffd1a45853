//! Active encoder tracking and render pass store-action policy

use log::trace;

use crate::render::backend::{
    AttachmentStoreActions, CommandBufferId, EncoderId, EncoderKind, GpuBackend, RenderPassDesc,
    StoreAction,
};
use crate::render::RenderResult;

/// Encoder currently recording into the open command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveEncoder {
    /// Nothing is recording
    #[default]
    None,
    /// Render pass encoder
    Render(EncoderId),
    /// Copy/fill encoder
    Blit(EncoderId),
    /// Compute encoder
    Compute(EncoderId),
}

impl ActiveEncoder {
    /// Kind of the active encoder
    pub const fn kind(self) -> Option<EncoderKind> {
        match self {
            Self::None => None,
            Self::Render(_) => Some(EncoderKind::Render),
            Self::Blit(_) => Some(EncoderKind::Blit),
            Self::Compute(_) => Some(EncoderKind::Compute),
        }
    }

    /// Handle of the active encoder
    pub const fn id(self) -> Option<EncoderId> {
        match self {
            Self::None => None,
            Self::Render(id) | Self::Blit(id) | Self::Compute(id) => Some(id),
        }
    }

    const fn from_kind(kind: EncoderKind, id: EncoderId) -> Self {
        match kind {
            EncoderKind::Render => Self::Render(id),
            EncoderKind::Blit => Self::Blit(id),
            EncoderKind::Compute => Self::Compute(id),
        }
    }
}

/// Result of requesting an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderUse {
    /// Encoder to record into
    pub id: EncoderId,
    /// Whether the encoder was opened by this request
    pub began: bool,
}

#[derive(Debug, Clone, Default)]
struct PassPlan {
    resolves: Vec<bool>,
    discard_colors: Vec<bool>,
    has_depth_stencil: bool,
    discard_depth_stencil: bool,
}

impl PassPlan {
    fn from_desc(desc: &RenderPassDesc) -> Self {
        Self {
            resolves: desc.colors.iter().map(|c| c.resolve.is_some()).collect(),
            discard_colors: vec![false; desc.colors.len()],
            has_depth_stencil: desc.depth_stencil.is_some(),
            discard_depth_stencil: false,
        }
    }

    fn store_actions(&self) -> AttachmentStoreActions {
        let colors = self
            .resolves
            .iter()
            .zip(&self.discard_colors)
            .map(|(resolve, discard)| match (resolve, discard) {
                (_, true) => StoreAction::DontCare,
                (true, false) => StoreAction::MultisampleResolve,
                (false, false) => StoreAction::Store,
            })
            .collect();

        let depth_stencil = if self.discard_depth_stencil || !self.has_depth_stencil {
            StoreAction::DontCare
        } else {
            StoreAction::Store
        };

        AttachmentStoreActions {
            colors,
            depth: depth_stencil,
            stencil: depth_stencil,
        }
    }
}

/// At most one encoder is open at a time; switching kinds ends the old one
#[derive(Debug, Default)]
pub struct EncoderStateMachine {
    active: ActiveEncoder,
    pass: PassPlan,
    transitions: u64,
}

impl EncoderStateMachine {
    /// No encoder active
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder currently recording
    pub const fn active(&self) -> ActiveEncoder {
        self.active
    }

    /// Number of encoders opened so far
    pub const fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Return the active encoder if it matches `kind`, otherwise end it and open one
    ///
    /// Render encoders require `pass`; it is ignored for other kinds and when
    /// a render encoder is already open.
    pub fn use_encoder<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        cmd: CommandBufferId,
        kind: EncoderKind,
        pass: Option<&RenderPassDesc>,
    ) -> RenderResult<EncoderUse> {
        if self.active.kind() == Some(kind) {
            if let Some(id) = self.active.id() {
                return Ok(EncoderUse { id, began: false });
            }
        }

        self.end(backend);

        let id = backend.begin_encoder(cmd, kind, pass)?;
        if kind == EncoderKind::Render {
            self.pass = pass.map(PassPlan::from_desc).unwrap_or_default();
        }
        self.active = ActiveEncoder::from_kind(kind, id);
        self.transitions += 1;
        trace!("Began {:?} encoder", kind);

        Ok(EncoderUse { id, began: true })
    }

    /// End the active encoder, if any
    ///
    /// Render encoders receive their store actions here: resolved color
    /// targets resolve, discarded attachments are not stored, everything else
    /// is stored.
    pub fn end<B: GpuBackend>(&mut self, backend: &mut B) {
        match std::mem::take(&mut self.active) {
            ActiveEncoder::None => {}
            ActiveEncoder::Render(id) => {
                let actions = std::mem::take(&mut self.pass).store_actions();
                backend.end_encoder(id, Some(&actions));
            }
            ActiveEncoder::Blit(id) | ActiveEncoder::Compute(id) => {
                backend.end_encoder(id, None);
            }
        }
    }

    /// Mark attachments of the active render pass as not needing to be stored
    ///
    /// Returns false when no render encoder is active.
    pub fn discard(&mut self, colors: &[bool], depth_stencil: bool) -> bool {
        if self.active.kind() != Some(EncoderKind::Render) {
            return false;
        }
        for (flag, discard) in self.pass.discard_colors.iter_mut().zip(colors) {
            *flag |= *discard;
        }
        self.pass.discard_depth_stencil |= depth_stencil;
        true
    }

    /// Forget the active encoder without telling the backend
    pub fn abandon(&mut self) {
        self.active = ActiveEncoder::None;
        self.pass = PassPlan::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::headless::{BackendCall, HeadlessBackend};
    use crate::render::backend::{ColorAttachment, DepthStencilAttachment, LoadAction};
    use crate::render::types::Color;

    fn pass_for(backend: &HeadlessBackend, resolve: bool) -> RenderPassDesc {
        let backbuffer = backend.backbuffer();
        RenderPassDesc {
            colors: vec![ColorAttachment {
                texture: backbuffer.color,
                slice: 0,
                mip: 0,
                resolve: resolve.then_some(backbuffer.color),
                load: LoadAction::Load,
                clear: Color::TRANSPARENT,
            }],
            depth_stencil: backbuffer.depth_stencil.map(|texture| DepthStencilAttachment {
                texture,
                depth_load: LoadAction::Load,
                clear_depth: 1.0,
                stencil_load: LoadAction::Load,
                clear_stencil: 0,
            }),
            width: backbuffer.width,
            height: backbuffer.height,
        }
    }

    fn last_store(backend: &HeadlessBackend) -> Option<AttachmentStoreActions> {
        backend.calls().iter().rev().find_map(|call| match call {
            BackendCall::EndEncoder {
                store: Some(store), ..
            } => Some(store.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_same_kind_reuses_encoder() {
        let mut backend = HeadlessBackend::default();
        let cmd = backend.begin_command_buffer().unwrap();
        let mut encoders = EncoderStateMachine::new();

        let first = encoders.use_encoder(&mut backend, cmd, EncoderKind::Blit, None).unwrap();
        let second = encoders.use_encoder(&mut backend, cmd, EncoderKind::Blit, None).unwrap();

        assert!(first.began);
        assert!(!second.began);
        assert_eq!(first.id, second.id);
        assert_eq!(encoders.transitions(), 1);
    }

    #[test]
    fn test_switching_kind_ends_previous() {
        let mut backend = HeadlessBackend::default();
        let cmd = backend.begin_command_buffer().unwrap();
        let mut encoders = EncoderStateMachine::new();
        let pass = pass_for(&backend, false);

        let render = encoders
            .use_encoder(&mut backend, cmd, EncoderKind::Render, Some(&pass))
            .unwrap();
        let blit = encoders.use_encoder(&mut backend, cmd, EncoderKind::Blit, None).unwrap();

        assert_ne!(render.id, blit.id);
        assert_eq!(encoders.active(), ActiveEncoder::Blit(blit.id));
        assert_eq!(
            backend.count_calls(|c| matches!(c, BackendCall::EndEncoder { kind: EncoderKind::Render, .. })),
            1
        );
    }

    #[test]
    fn test_store_actions_default_to_store() {
        let mut backend = HeadlessBackend::default();
        let cmd = backend.begin_command_buffer().unwrap();
        let mut encoders = EncoderStateMachine::new();
        let pass = pass_for(&backend, false);

        encoders
            .use_encoder(&mut backend, cmd, EncoderKind::Render, Some(&pass))
            .unwrap();
        encoders.end(&mut backend);

        let store = last_store(&backend).unwrap();
        assert_eq!(store.colors, vec![StoreAction::Store]);
        assert_eq!(store.depth, StoreAction::Store);
    }

    #[test]
    fn test_resolve_and_discard_policy() {
        let mut backend = HeadlessBackend::default();
        let cmd = backend.begin_command_buffer().unwrap();
        let mut encoders = EncoderStateMachine::new();
        let pass = pass_for(&backend, true);

        encoders
            .use_encoder(&mut backend, cmd, EncoderKind::Render, Some(&pass))
            .unwrap();
        encoders.end(&mut backend);
        assert_eq!(last_store(&backend).unwrap().colors, vec![StoreAction::MultisampleResolve]);

        encoders
            .use_encoder(&mut backend, cmd, EncoderKind::Render, Some(&pass))
            .unwrap();
        assert!(encoders.discard(&[true], true));
        encoders.end(&mut backend);

        let store = last_store(&backend).unwrap();
        assert_eq!(store.colors, vec![StoreAction::DontCare]);
        assert_eq!(store.stencil, StoreAction::DontCare);
    }

    #[test]
    fn test_discard_without_render_pass() {
        let mut encoders = EncoderStateMachine::new();
        assert!(!encoders.discard(&[true], false));
    }
}

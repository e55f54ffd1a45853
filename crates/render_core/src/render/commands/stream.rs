//! Command buffer lifecycle and completion tracking

use std::collections::VecDeque;

use log::{debug, trace};

use super::encoder::{ActiveEncoder, EncoderStateMachine, EncoderUse};
use crate::render::backend::{CommandBufferId, EncoderKind, GpuBackend, RenderPassDesc, SubmitMode};
use crate::render::RenderResult;

/// The single open command buffer plus everything submitted and not yet retired
///
/// Submission indices start at 1 and increase by one per submission. The
/// cached completed index only ever moves forward, even if a backend reports
/// a stale value.
#[derive(Debug, Default)]
pub struct CommandStream {
    current: Option<CommandBufferId>,
    encoders: EncoderStateMachine,
    last_submitted: u64,
    completed: u64,
    in_flight: VecDeque<(u64, CommandBufferId)>,
}

impl CommandStream {
    /// No command buffer open, nothing submitted
    pub fn new() -> Self {
        Self::default()
    }

    /// The open command buffer, beginning one if needed
    pub fn command_buffer<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<CommandBufferId> {
        if let Some(cmd) = self.current {
            return Ok(cmd);
        }

        let cmd = backend.begin_command_buffer()?;
        trace!("Began command buffer for index {}", self.pending_index());
        self.current = Some(cmd);
        Ok(cmd)
    }

    /// Whether a command buffer is open
    pub const fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// Encoder currently recording
    pub const fn active_encoder(&self) -> ActiveEncoder {
        self.encoders.active()
    }

    /// Number of encoders opened so far
    pub const fn encoder_transitions(&self) -> u64 {
        self.encoders.transitions()
    }

    /// Get an encoder of `kind`, ending any other active encoder first
    pub fn use_encoder<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        kind: EncoderKind,
        pass: Option<&RenderPassDesc>,
    ) -> RenderResult<EncoderUse> {
        let cmd = self.command_buffer(backend)?;
        self.encoders.use_encoder(backend, cmd, kind, pass)
    }

    /// End the active encoder, if any
    pub fn end_encoder<B: GpuBackend>(&mut self, backend: &mut B) {
        self.encoders.end(backend);
    }

    /// Mark attachments of the active render pass as discardable
    pub fn discard(&mut self, colors: &[bool], depth_stencil: bool) -> bool {
        self.encoders.discard(colors, depth_stencil)
    }

    /// Submit the open command buffer, returns its index
    ///
    /// With nothing recorded a [`SubmitMode::Standard`] submission is a no-op;
    /// a [`SubmitMode::Present`] submission always goes through so the
    /// backbuffer is presented.
    pub fn submit<B: GpuBackend>(&mut self, backend: &mut B, mode: SubmitMode) -> RenderResult<Option<u64>> {
        if self.current.is_none() && mode == SubmitMode::Standard {
            return Ok(None);
        }

        let cmd = self.command_buffer(backend)?;
        self.encoders.end(backend);

        let index = self.pending_index();
        self.current = None;
        backend.submit_command_buffer(cmd, index, mode)?;

        self.last_submitted = index;
        self.in_flight.push_back((index, cmd));
        debug!("Submitted command buffer {} ({:?})", index, mode);
        Ok(Some(index))
    }

    /// Index the next submitted command buffer will carry
    pub const fn pending_index(&self) -> u64 {
        self.last_submitted + 1
    }

    /// Index of the last submitted command buffer, 0 before the first submission
    pub const fn last_submitted(&self) -> u64 {
        self.last_submitted
    }

    /// Cached completed index
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Command buffers submitted but not yet retired
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Refresh the completed index and recycle finished command buffers
    pub fn poll<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<u64> {
        let reported = backend.completed_index()?;
        self.advance(backend, reported);
        Ok(self.completed)
    }

    /// Block until everything submitted has completed
    pub fn wait_idle<B: GpuBackend>(&mut self, backend: &mut B) -> RenderResult<u64> {
        backend.wait_idle()?;
        let last = self.last_submitted;
        self.advance(backend, last);
        Ok(self.completed)
    }

    fn advance<B: GpuBackend>(&mut self, backend: &mut B, reported: u64) {
        self.completed = self.completed.max(reported.min(self.last_submitted));
        while self.in_flight.front().is_some_and(|(index, _)| *index <= self.completed) {
            if let Some((_, cmd)) = self.in_flight.pop_front() {
                backend.release_command_buffer(cmd);
            }
        }
    }

    /// Drop all recording state without touching the backend; used after device loss
    pub fn abandon(&mut self) {
        self.current = None;
        self.encoders.abandon();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::headless::{BackendCall, CompletionMode, HeadlessBackend, HeadlessOptions};

    fn manual_backend() -> HeadlessBackend {
        HeadlessBackend::new(HeadlessOptions {
            completion: CompletionMode::Manual,
            ..HeadlessOptions::default()
        })
    }

    #[test]
    fn test_indices_increase_from_one() {
        let mut backend = HeadlessBackend::default();
        let mut stream = CommandStream::new();
        assert_eq!(stream.pending_index(), 1);

        stream.use_encoder(&mut backend, EncoderKind::Blit, None).unwrap();
        assert_eq!(stream.submit(&mut backend, SubmitMode::Standard).unwrap(), Some(1));

        stream.use_encoder(&mut backend, EncoderKind::Compute, None).unwrap();
        assert_eq!(stream.submit(&mut backend, SubmitMode::Standard).unwrap(), Some(2));
        assert_eq!(stream.pending_index(), 3);
    }

    #[test]
    fn test_empty_standard_submit_is_noop() {
        let mut backend = HeadlessBackend::default();
        let mut stream = CommandStream::new();

        assert_eq!(stream.submit(&mut backend, SubmitMode::Standard).unwrap(), None);
        assert_eq!(stream.last_submitted(), 0);
        assert_eq!(stream.submit(&mut backend, SubmitMode::Present).unwrap(), Some(1));
    }

    #[test]
    fn test_submit_ends_active_encoder_first() {
        let mut backend = HeadlessBackend::default();
        let mut stream = CommandStream::new();

        stream.use_encoder(&mut backend, EncoderKind::Blit, None).unwrap();
        stream.submit(&mut backend, SubmitMode::Standard).unwrap();

        let calls = backend.calls();
        let end = calls
            .iter()
            .position(|c| matches!(c, BackendCall::EndEncoder { .. }))
            .unwrap();
        let submit = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Submit { .. }))
            .unwrap();
        assert!(end < submit);
        assert_eq!(stream.active_encoder(), ActiveEncoder::None);
    }

    #[test]
    fn test_completed_index_is_monotonic() {
        let mut backend = manual_backend();
        let mut stream = CommandStream::new();

        for _ in 0..3 {
            stream.use_encoder(&mut backend, EncoderKind::Blit, None).unwrap();
            stream.submit(&mut backend, SubmitMode::Standard).unwrap();
        }
        assert_eq!(stream.poll(&mut backend).unwrap(), 0);
        assert_eq!(stream.in_flight(), 3);

        backend.retire_through(2);
        assert_eq!(stream.poll(&mut backend).unwrap(), 2);
        assert_eq!(stream.in_flight(), 1);

        stream.advance(&mut backend, 1);
        assert_eq!(stream.completed(), 2);

        assert_eq!(stream.wait_idle(&mut backend).unwrap(), 3);
        assert_eq!(stream.in_flight(), 0);
    }
}

//! Destruction deferred until the GPU is done with a resource
//!
//! Every entry carries the index of the command buffer that may still use the
//! resource. [`DeferredQueue::drain_completed`] runs entries whose index the
//! backend reports complete, in the order they were queued.

use std::collections::VecDeque;
use std::fmt;

use log::trace;

/// Cleanup action run against the backend
pub type CleanupAction<B> = Box<dyn FnOnce(&mut B)>;

struct DeferredCleanup<B> {
    index: u64,
    action: CleanupAction<B>,
}

/// Queue of cleanup actions keyed by command buffer index
pub struct DeferredQueue<B> {
    entries: VecDeque<DeferredCleanup<B>>,
    executed: u64,
}

impl<B> Default for DeferredQueue<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> fmt::Debug for DeferredQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("pending", &self.entries.len())
            .field("executed", &self.executed)
            .finish()
    }
}

impl<B> DeferredQueue<B> {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            executed: 0,
        }
    }

    /// Run `action` once command buffer `index` has completed
    pub fn queue_cleanup(&mut self, index: u64, action: impl FnOnce(&mut B) + 'static) {
        self.entries.push_back(DeferredCleanup {
            index,
            action: Box::new(action),
        });
    }

    /// Run every entry whose index is at or below `completed`, returns how many ran
    ///
    /// Due entries run in the order they were queued, whatever their index.
    pub fn drain_completed(&mut self, completed: u64, backend: &mut B) -> usize {
        if self.entries.iter().all(|e| e.index > completed) {
            return 0;
        }

        let mut ran = 0;
        let mut waiting = VecDeque::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_front() {
            if entry.index <= completed {
                (entry.action)(backend);
                ran += 1;
            } else {
                waiting.push_back(entry);
            }
        }
        self.entries = waiting;

        if ran > 0 {
            trace!("Ran {} deferred cleanups through index {}", ran, completed);
        }
        self.executed += ran as u64;
        ran
    }

    /// Run every entry regardless of completion; used at teardown and on device loss
    pub fn force_drain(&mut self, backend: &mut B) -> usize {
        let ran = self.entries.len();
        while let Some(entry) = self.entries.pop_front() {
            (entry.action)(backend);
        }
        self.executed += ran as u64;
        ran
    }

    /// Entries not yet run
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries run so far
    pub const fn executed(&self) -> u64 {
        self.executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        log: Vec<&'static str>,
    }

    #[test]
    fn test_gated_on_completion() {
        let mut queue = DeferredQueue::<Recorder>::new();
        let mut recorder = Recorder::default();

        queue.queue_cleanup(5, |r: &mut Recorder| r.log.push("staging"));

        assert_eq!(queue.drain_completed(4, &mut recorder), 0);
        assert!(recorder.log.is_empty());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain_completed(5, &mut recorder), 1);
        assert_eq!(recorder.log, vec!["staging"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_runs_in_enqueue_order() {
        let mut queue = DeferredQueue::<Recorder>::new();
        let mut recorder = Recorder::default();

        queue.queue_cleanup(2, |r: &mut Recorder| r.log.push("a"));
        queue.queue_cleanup(2, |r: &mut Recorder| r.log.push("b"));
        queue.queue_cleanup(3, |r: &mut Recorder| r.log.push("c"));

        queue.drain_completed(3, &mut recorder);
        assert_eq!(recorder.log, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lower_index_queued_later_keeps_enqueue_order() {
        let mut queue = DeferredQueue::<Recorder>::new();
        let mut recorder = Recorder::default();

        queue.queue_cleanup(7, |r: &mut Recorder| r.log.push("first"));
        queue.queue_cleanup(3, |r: &mut Recorder| r.log.push("second"));

        queue.drain_completed(7, &mut recorder);
        assert_eq!(recorder.log, vec!["first", "second"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_drain_skips_entries_not_yet_due() {
        let mut queue = DeferredQueue::<Recorder>::new();
        let mut recorder = Recorder::default();

        queue.queue_cleanup(7, |r: &mut Recorder| r.log.push("late"));
        queue.queue_cleanup(3, |r: &mut Recorder| r.log.push("early"));
        queue.queue_cleanup(9, |r: &mut Recorder| r.log.push("last"));

        assert_eq!(queue.drain_completed(3, &mut recorder), 1);
        assert_eq!(recorder.log, vec!["early"]);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.drain_completed(9, &mut recorder), 2);
        assert_eq!(recorder.log, vec!["early", "late", "last"]);
        assert_eq!(queue.executed(), 3);
    }

    #[test]
    fn test_force_drain_runs_everything() {
        let mut queue = DeferredQueue::<Recorder>::new();
        let mut recorder = Recorder::default();

        queue.queue_cleanup(100, |r: &mut Recorder| r.log.push("x"));
        queue.queue_cleanup(200, |r: &mut Recorder| r.log.push("y"));

        assert_eq!(queue.force_drain(&mut recorder), 2);
        assert_eq!(recorder.log, vec!["x", "y"]);
        assert_eq!(queue.executed(), 2);
    }
}

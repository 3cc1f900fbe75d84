//! Shared run state
//!
//! One `RunState` is shared between the orchestrator, the output marshaller
//! and the transport. It replaces loose global flags with a single object
//! whose transitions are checked: phases only move forward, the stop flag is
//! observable through a watch channel, and the failure flag is sticky.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Phases of a build, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildPhase {
    CacheSetup,
    RepoClone,
    ImageSetup,
    BuildRun,
    Finalize,
    Done,
}

impl BuildPhase {
    /// Phases that do work, in order. `Finalize` and `Done` are handled by the orchestrator itself.
    pub const WORK: [BuildPhase; 4] = [
        BuildPhase::CacheSetup,
        BuildPhase::RepoClone,
        BuildPhase::ImageSetup,
        BuildPhase::BuildRun,
    ];

    /// Human readable label, used for section names
    pub fn label(&self) -> &'static str {
        match self {
            BuildPhase::CacheSetup => "Restoring cache",
            BuildPhase::RepoClone => "Checking out source",
            BuildPhase::ImageSetup => "Preparing build image",
            BuildPhase::BuildRun => "Running build",
            BuildPhase::Finalize => "Finalizing",
            BuildPhase::Done => "Done",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// State shared by every component of a single agent run
#[derive(Debug)]
pub struct RunState {
    phase: Mutex<Option<BuildPhase>>,
    stop: watch::Sender<bool>,
    section_open: AtomicBool,
    failed: AtomicBool,
    finished: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            phase: Mutex::new(None),
            stop,
            section_open: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Current phase, `None` before the first phase starts
    pub fn phase(&self) -> Option<BuildPhase> {
        *self.phase.lock()
    }

    /// Move to `next`. Returns false and leaves the phase unchanged if that would go backwards.
    pub fn advance(&self, next: BuildPhase) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            Some(current) if next <= current => {
                warn!("Refusing phase transition {} -> {}", current, next);
                false
            }
            _ => {
                debug!("Entering phase {}", next);
                *phase = Some(next);
                true
            }
        }
    }

    /// Ask every component to wind down
    pub fn request_stop(&self) {
        if !self.stop.send_replace(true) {
            debug!("Stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Watch the stop flag
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Record that a section was opened. Returns true if another section was still open.
    pub fn open_section(&self) -> bool {
        self.section_open.swap(true, Ordering::SeqCst)
    }

    /// Record that the open section was closed. Returns true if a section was open.
    pub fn close_section(&self) -> bool {
        self.section_open.swap(false, Ordering::SeqCst)
    }

    pub fn section_open(&self) -> bool {
        self.section_open.load(Ordering::SeqCst)
    }

    /// Sticky: once failed, a run never becomes successful again
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record that the final status was produced. Returns false if it already was.
    pub fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_move_forward() {
        let state = RunState::new();
        assert_eq!(state.phase(), None);

        assert!(state.advance(BuildPhase::CacheSetup));
        assert!(state.advance(BuildPhase::ImageSetup));
        assert!(!state.advance(BuildPhase::RepoClone));
        assert!(!state.advance(BuildPhase::ImageSetup));
        assert_eq!(state.phase(), Some(BuildPhase::ImageSetup));

        assert!(state.advance(BuildPhase::Done));
        assert_eq!(state.phase(), Some(BuildPhase::Done));
    }

    #[test]
    fn test_failure_is_sticky() {
        let state = RunState::new();
        assert!(!state.has_failed());
        state.mark_failed();
        state.mark_failed();
        assert!(state.has_failed());
    }

    #[test]
    fn test_section_tracking() {
        let state = RunState::new();
        assert!(!state.close_section());
        assert!(!state.open_section());
        assert!(state.section_open());
        assert!(state.close_section());
        assert!(!state.section_open());
    }

    #[test]
    fn test_finished_only_once() {
        let state = RunState::new();
        assert!(state.mark_finished());
        assert!(!state.mark_finished());
        assert!(state.is_finished());
    }

    #[tokio::test]
    async fn test_stop_is_observable() {
        let state = RunState::new();
        let mut rx = state.subscribe_stop();
        assert!(!state.stop_requested());

        state.request_stop();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(state.stop_requested());
    }
}

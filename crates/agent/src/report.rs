//! Producer side of the message queue

use std::sync::Arc;

use kiln_common::Message;
use tracing::{debug, warn};

use crate::batcher::MessageBatcher;
use crate::state::RunState;

/// Enqueues protocol messages and keeps the run state in step with them
///
/// Every component that talks to the controller goes through a `Reporter`,
/// so section bookkeeping and the failure flag cannot drift from what was
/// actually sent.
#[derive(Debug, Clone)]
pub struct Reporter {
    queue: Arc<MessageBatcher>,
    state: Arc<RunState>,
}

impl Reporter {
    pub fn new(queue: Arc<MessageBatcher>, state: Arc<RunState>) -> Self {
        Self { queue, state }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Plain build output. Callers include the trailing newline.
    pub fn output(&self, text: impl Into<String>) {
        self.queue.push(Message::output(text));
    }

    /// A single line of output, newline appended
    pub fn line(&self, text: impl AsRef<str>) {
        self.output(format!("{}\n", text.as_ref()));
    }

    pub fn section_start(&self, name: impl Into<String>) {
        let name = name.into();
        if self.state.open_section() {
            warn!("Section `{}` started while another section was open", name);
        }
        debug!(section = %name, "Section started");
        self.queue.push(Message::section_start(name));
    }

    pub fn section_end(&self, was_successful: bool) {
        if !self.state.close_section() {
            warn!("Section end reported with no open section");
        }
        if !was_successful {
            self.state.mark_failed();
        }
        debug!(was_successful, "Section ended");
        self.queue.push(Message::section_end(was_successful));
    }

    /// Close the open section, if any, as failed
    pub fn close_open_section(&self) -> bool {
        if self.state.section_open() {
            self.section_end(false);
            true
        } else {
            false
        }
    }

    /// Report the outcome of the run. Only the first call has any effect.
    pub fn final_status(&self, was_successful: bool) -> bool {
        if !self.state.mark_finished() {
            debug!("Final status already reported");
            return false;
        }
        if !was_successful {
            self.state.mark_failed();
        }
        self.queue.push(Message::final_status(was_successful));
        true
    }
}

//! Build output classification
//!
//! Lines beginning with [`CONTROL_SENTINEL`] are control events emitted by
//! the generated script; everything else is forwarded verbatim.

use tracing::{debug, warn};

use crate::report::Reporter;
use crate::script::{CONTROL_SENTINEL, OP_SECTION_END, OP_SECTION_START};

/// A parsed control line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent<'a> {
    SectionStart { name: &'a str },
    SectionEnd { was_successful: bool },
    Unknown { opcode: &'a str },
}

/// Classify a line. Returns `None` for ordinary build output.
pub fn parse_control(line: &str) -> Option<ControlEvent<'_>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.strip_prefix(CONTROL_SENTINEL)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim_start();
    let (opcode, operands) = match rest.split_once(char::is_whitespace) {
        Some((opcode, operands)) => (opcode, operands.trim()),
        None => (rest, ""),
    };

    let event = match opcode {
        OP_SECTION_START => ControlEvent::SectionStart { name: operands },
        OP_SECTION_END => ControlEvent::SectionEnd {
            was_successful: operands.split_whitespace().next() == Some("0"),
        },
        other => ControlEvent::Unknown { opcode: other },
    };
    Some(event)
}

/// Turns build output lines into protocol messages
#[derive(Debug, Clone)]
pub struct OutputMarshaller {
    reporter: Reporter,
}

impl OutputMarshaller {
    pub fn new(reporter: Reporter) -> Self {
        Self { reporter }
    }

    /// Handle one line of output, including its trailing newline if it had one
    pub fn handle_line(&self, line: &str) {
        match parse_control(line) {
            None => self.reporter.output(line),
            Some(ControlEvent::SectionStart { name }) => {
                if self.reporter.state().section_open() {
                    warn!("Section `{}` opened before the previous one closed", name);
                    self.reporter.section_end(false);
                }
                self.reporter.section_start(name);
            }
            Some(ControlEvent::SectionEnd { was_successful }) => {
                self.reporter.section_end(was_successful);
            }
            Some(ControlEvent::Unknown { opcode }) => {
                warn!(opcode, "Unrecognized control command");
                self.reporter.state().mark_failed();
                self.reporter.line(format!(
                    "Warning: unrecognized control command `{}`; marking build as failed",
                    opcode
                ));
            }
        }
    }

    /// Close the section that was open while the build process was starting
    pub fn process_started(&self) {
        if self.reporter.state().section_open() {
            self.reporter.section_end(true);
        }
    }

    /// Close a section left open when the build process exited. Returns true if one was closed.
    pub fn finish(&self) -> bool {
        let closed = self.reporter.close_open_section();
        if closed {
            debug!("Closed unterminated section after build exit");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::MessageBatcher;
    use crate::state::RunState;
    use kiln_common::Message;
    use std::sync::Arc;

    fn marshaller() -> (OutputMarshaller, Arc<MessageBatcher>, Arc<RunState>) {
        let queue = Arc::new(MessageBatcher::new());
        let state = Arc::new(RunState::new());
        let reporter = Reporter::new(queue.clone(), state.clone());
        (OutputMarshaller::new(reporter), queue, state)
    }

    fn line(rest: &str) -> String {
        format!("{} {}", CONTROL_SENTINEL, rest)
    }

    #[test]
    fn test_section_start_keeps_full_name() {
        let (m, queue, _) = marshaller();
        m.handle_line(&line("SectionStart Compile step\n"));
        assert_eq!(queue.drain(), vec![Message::section_start("Compile step")]);
    }

    #[test]
    fn test_section_end_exit_codes() {
        let (m, queue, state) = marshaller();
        m.handle_line(&line("SectionStart A"));
        m.handle_line(&line("SectionEnd 0"));
        assert!(!state.has_failed());
        m.handle_line(&line("SectionStart B"));
        m.handle_line(&line("SectionEnd 1"));
        assert!(state.has_failed());

        assert_eq!(
            queue.drain(),
            vec![
                Message::section_start("A"),
                Message::section_end(true),
                Message::section_start("B"),
                Message::section_end(false),
            ]
        );
    }

    #[test]
    fn test_plain_output_is_verbatim() {
        let (m, queue, _) = marshaller();
        m.handle_line("  compiling foo v0.1.0\n");
        m.handle_line("warning: unused variable\n");
        assert_eq!(
            queue.drain(),
            vec![Message::output(
                "  compiling foo v0.1.0\nwarning: unused variable\n"
            )]
        );
    }

    #[test]
    fn test_sentinel_must_be_a_whole_token() {
        assert_eq!(parse_control(&format!("{}X SectionEnd 0", CONTROL_SENTINEL)), None);
        assert_eq!(parse_control("echo ##[kiln-control] SectionEnd 0"), None);
    }

    #[test]
    fn test_unknown_opcode_warns_and_fails() {
        let (m, queue, state) = marshaller();
        m.handle_line(&line("Explode now"));
        m.handle_line("after\n");

        assert!(state.has_failed());
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            Message::BuildOutput { output } => {
                assert!(output.contains("Explode"));
                assert!(output.ends_with("after\n"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_section_end_without_code_is_failure() {
        assert_eq!(
            parse_control(&line("SectionEnd")),
            Some(ControlEvent::SectionEnd {
                was_successful: false
            })
        );
        assert_eq!(
            parse_control(&line("SectionEnd 0\r\n")),
            Some(ControlEvent::SectionEnd {
                was_successful: true
            })
        );
    }

    #[test]
    fn test_finish_closes_unterminated_section() {
        let (m, queue, state) = marshaller();
        m.handle_line(&line("SectionStart Hangs"));
        assert!(m.finish());
        assert!(!m.finish());
        assert!(state.has_failed());
        assert_eq!(
            queue.drain(),
            vec![Message::section_start("Hangs"), Message::section_end(false)]
        );
    }
}

//! Ordered outbound message queue
//!
//! Build output arrives one line at a time, and sending every line as its own
//! message would dominate the connection with framing overhead. The batcher
//! merges adjacent `BuildOutput` messages while they wait to be flushed.

use kiln_common::Message;
use parking_lot::Mutex;

/// Maximum combined length, in characters, of a merged `BuildOutput` entry
pub const BATCH_SIZE: usize = 4096;

/// Thread-safe FIFO of messages waiting to be sent
#[derive(Debug, Default)]
pub struct MessageBatcher {
    queue: Mutex<Vec<Message>>,
}

impl MessageBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, merging build output into the tail entry when it fits
    pub fn push(&self, message: Message) {
        let mut queue = self.queue.lock();

        if let Message::BuildOutput { output: text } = &message {
            if let Some(Message::BuildOutput { output: tail }) = queue.last_mut() {
                if tail.chars().count() + text.chars().count() <= BATCH_SIZE {
                    tail.push_str(text);
                    return;
                }
            }
        }

        queue.push(message);
    }

    /// Take every queued message, leaving the queue empty
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_output_is_merged() {
        let batcher = MessageBatcher::new();
        batcher.push(Message::output("hello "));
        batcher.push(Message::output("world\n"));

        assert_eq!(batcher.drain(), vec![Message::output("hello world\n")]);
    }

    #[test]
    fn test_merge_up_to_batch_size() {
        let batcher = MessageBatcher::new();
        batcher.push(Message::output("a".repeat(2048)));
        batcher.push(Message::output("b".repeat(2048)));
        assert_eq!(batcher.len(), 1);

        let batcher = MessageBatcher::new();
        batcher.push(Message::output("a".repeat(2048)));
        batcher.push(Message::output("b".repeat(2049)));
        let drained = batcher.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], Message::output("a".repeat(2048)));
        assert_eq!(drained[1], Message::output("b".repeat(2049)));
    }

    #[test]
    fn test_batch_size_counts_characters() {
        let batcher = MessageBatcher::new();
        // Each 'é' is two bytes but one character
        batcher.push(Message::output("é".repeat(2048)));
        batcher.push(Message::output("é".repeat(2048)));
        assert_eq!(batcher.len(), 1);
    }

    #[test]
    fn test_control_messages_never_merge() {
        let batcher = MessageBatcher::new();
        batcher.push(Message::output("x"));
        batcher.push(Message::section_start("Compile"));
        batcher.push(Message::section_end(true));
        batcher.push(Message::final_status(true));

        assert_eq!(
            batcher.drain(),
            vec![
                Message::output("x"),
                Message::section_start("Compile"),
                Message::section_end(true),
                Message::final_status(true),
            ]
        );
    }

    #[test]
    fn test_output_after_control_starts_new_entry() {
        let batcher = MessageBatcher::new();
        batcher.push(Message::output("before\n"));
        batcher.push(Message::section_start("Test"));
        batcher.push(Message::output("after\n"));
        batcher.push(Message::output("more\n"));

        assert_eq!(
            batcher.drain(),
            vec![
                Message::output("before\n"),
                Message::section_start("Test"),
                Message::output("after\nmore\n"),
            ]
        );
    }

    #[test]
    fn test_drain_empties_queue() {
        let batcher = MessageBatcher::new();
        assert!(batcher.drain().is_empty());

        batcher.push(Message::output("x"));
        assert!(!batcher.is_empty());
        assert_eq!(batcher.drain().len(), 1);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_concurrent_pushes_keep_every_line() {
        use std::sync::Arc;

        let batcher = Arc::new(MessageBatcher::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let batcher = batcher.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        batcher.push(Message::output(format!("{}-{}\n", t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let text: String = batcher
            .drain()
            .into_iter()
            .map(|m| match m {
                Message::BuildOutput { output } => output,
                other => panic!("unexpected message {:?}", other),
            })
            .collect();
        assert_eq!(text.lines().count(), 1000);
    }
}

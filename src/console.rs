//! Console sink for guest `CONSOLE_WRITE_*` messages.
//!
//! The original tool writes straight to `stdout`/`stderr` depending on
//! which `CONSOLE_WRITE_*_BOTH` variant fired; this core routes the same
//! decoded values through [`log`] instead, and keeps a recording test
//! double so the dispatch in [`crate::protocol`] can be exercised without
//! capturing process output.

use log::info;

/// Decoded payload for one console message, already reassembled from its
/// mailbox words (e.g. the two halves of a `CONSOLE_WRITE_LONG`).
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleMessage {
    Char(u8),
    Int(i32),
    IntHex(u32),
    Long(i64),
    LongHex(u64),
    Double(f64),
}

/// Sink a worker's console output is routed to during the protocol
/// engine's service loop.
pub trait Console: Send + Sync {
    fn write(&self, worker_idx: usize, message: ConsoleMessage);
}

/// Default sink: logs every message at `info`, tagged with the worker
/// index, mirroring the original's per-thread console prefix.
#[derive(Debug, Default)]
pub struct LoggingConsole;

impl Console for LoggingConsole {
    fn write(&self, worker_idx: usize, message: ConsoleMessage) {
        match message {
            ConsoleMessage::Char(c) => info!("[worker {worker_idx}] {}", c as char),
            ConsoleMessage::Int(v) => info!("[worker {worker_idx}] {v}"),
            ConsoleMessage::IntHex(v) => info!("[worker {worker_idx}] {v:#x}"),
            ConsoleMessage::Long(v) => info!("[worker {worker_idx}] {v}"),
            ConsoleMessage::LongHex(v) => info!("[worker {worker_idx}] {v:#x}"),
            ConsoleMessage::Double(v) => info!("[worker {worker_idx}] {v}"),
        }
    }
}

/// Test double recording every message it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    messages: std::sync::Mutex<Vec<(usize, ConsoleMessage)>>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<(usize, ConsoleMessage)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Console for RecordingConsole {
    fn write(&self, worker_idx: usize, message: ConsoleMessage) {
        self.messages.lock().unwrap().push((worker_idx, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_console_preserves_order_and_worker_index() {
        let console = RecordingConsole::new();
        console.write(0, ConsoleMessage::Int(42));
        console.write(1, ConsoleMessage::Char(b'x'));
        let recorded = console.recorded();
        assert_eq!(recorded, vec![
            (0, ConsoleMessage::Int(42)),
            (1, ConsoleMessage::Char(b'x')),
        ]);
    }
}

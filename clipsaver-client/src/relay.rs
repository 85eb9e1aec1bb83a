//! Worker-to-UI messages and the display state they drive.

use std::{
    collections::VecDeque,
    sync::mpsc::{self, Receiver, Sender},
};

use tracing::info;

/// Log view keeps only this many lines; the oldest are dropped first.
pub const MAX_LOG_LINES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Log(String),
    Status(String),
}

/// Sending half handed to background threads.
#[derive(Debug, Clone)]
pub struct LogRelay {
    tx: Sender<UiEvent>,
}

impl LogRelay {
    pub fn channel() -> (Self, Receiver<UiEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Queues a log line and mirrors it into the tracing log.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "clipsaver::ui", "{message}");
        let _ = self.tx.send(UiEvent::Log(message));
    }

    pub fn status(&self, message: impl Into<String>) {
        let _ = self.tx.send(UiEvent::Status(message.into()));
    }
}

#[derive(Debug, Clone)]
pub struct DisplayState {
    lines: VecDeque<String>,
    status: String,
}

impl DisplayState {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            lines: VecDeque::new(),
            status: status.into(),
        }
    }

    /// Applies every queued event without blocking. Status updates are only
    /// taken while the worker is marked running so a late "Saved" cannot
    /// overwrite "Stopped.".
    pub fn drain(&mut self, rx: &Receiver<UiEvent>, running: bool) -> usize {
        let mut applied = 0;
        while let Ok(event) = rx.try_recv() {
            self.apply(event, running);
            applied += 1;
        }
        applied
    }

    pub fn apply(&mut self, event: UiEvent, running: bool) {
        match event {
            UiEvent::Log(line) => self.push_line(line),
            UiEvent::Status(status) => {
                if running {
                    self.status = status;
                }
            }
        }
    }

    pub fn push_line(&mut self, line: String) {
        if self.lines.len() >= MAX_LOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ignored_once_stopped() {
        let (relay, rx) = LogRelay::channel();
        let mut display = DisplayState::new("Stopped.");

        relay.log("Saved: /tmp/img_1.png");
        relay.status("Saved: img_1.png");
        assert_eq!(display.drain(&rx, false), 2);

        assert_eq!(display.status(), "Stopped.");
        assert_eq!(display.lines().collect::<Vec<_>>(), ["Saved: /tmp/img_1.png"]);
    }

    #[test]
    fn status_applies_while_running() {
        let (relay, rx) = LogRelay::channel();
        let mut display = DisplayState::new("Running: watching clipboard…");

        relay.status("Saved: img_3.png");
        display.drain(&rx, true);
        assert_eq!(display.status(), "Saved: img_3.png");
    }

    #[test]
    fn log_view_drops_oldest_lines() {
        let mut display = DisplayState::new("");
        for i in 0..MAX_LOG_LINES + 5 {
            display.push_line(format!("line {i}"));
        }
        assert_eq!(display.line_count(), MAX_LOG_LINES);
        assert_eq!(display.lines().next(), Some("line 5"));
    }

    #[test]
    fn drain_on_empty_queue_returns_immediately() {
        let (_relay, rx) = LogRelay::channel();
        let mut display = DisplayState::new("Ready.");
        assert_eq!(display.drain(&rx, true), 0);
    }
}

//! User-facing output sink
//!
//! Diagnostics go through `tracing`; anything meant for the person at the
//! terminal goes through a [`Printer`] handed to the component explicitly.

use colored::Colorize;
use std::sync::Mutex;

/// Destination for user-facing messages
pub trait Printer: Send + Sync {
    fn println(&self, message: &str);

    fn error(&self, message: &str);

    /// Emphasized line, used for hashes and branch names
    fn highlight(&self, message: &str);
}

/// Writes to stdout/stderr with terminal colours
#[derive(Debug, Default)]
pub struct ConsolePrinter;

impl Printer for ConsolePrinter {
    fn println(&self, message: &str) {
        println!("{}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("{} {}", "error:".red().bold(), message);
    }

    fn highlight(&self, message: &str) {
        println!("{}", message.yellow());
    }
}

/// Which printer method produced a recorded line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Out,
    Error,
    Highlight,
}

/// Test double that keeps every line in memory
#[derive(Debug, Default)]
pub struct RecordingPrinter {
    lines: Mutex<Vec<(Channel, String)>>,
}

impl RecordingPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Channel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Recorded text, regardless of channel
    pub fn text(&self) -> Vec<String> {
        self.lines().into_iter().map(|(_, line)| line).collect()
    }

    fn record(&self, channel: Channel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((channel, message.to_string()));
        }
    }
}

impl Printer for RecordingPrinter {
    fn println(&self, message: &str) {
        self.record(Channel::Out, message);
    }

    fn error(&self, message: &str) {
        self.record(Channel::Error, message);
    }

    fn highlight(&self, message: &str) {
        self.record(Channel::Highlight, message);
    }
}

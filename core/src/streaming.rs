//! Output stream pipeline: bounded complete buffer + tee + coalescing drain.
//!
//! The engine produces text synchronously and can emit it far faster than a
//! consumer needs updates. Every chunk written to the tee lands in three
//! places: a character-budgeted complete buffer, a rolling tail window kept
//! for error context, and a fragment queue drained by a coalescing loop that
//! turns bursts of small chunks into few notifications. All state here is
//! per-command and discarded when the command finishes.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::time::Duration;
use std::time::Instant;

use crate::config::StreamConfig;
use crate::engine::OutputSink;

/// Appended exactly once when the complete buffer exhausts its budget.
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)\n";

/// Bounded complete buffer. Truncation is one-way: once the budget is spent
/// the marker is appended and every later write is dropped.
#[derive(Debug)]
pub struct StreamBuffer {
    value: String,
    total_chars: usize,
    max_total_chars: usize,
    truncated: bool,
}

impl StreamBuffer {
    pub fn new(max_total_chars: usize) -> Self {
        Self {
            value: String::new(),
            total_chars: 0,
            max_total_chars,
            truncated: false,
        }
    }

    pub fn write(&mut self, text: &str) {
        if text.is_empty() || self.truncated {
            return;
        }
        let remaining = self.max_total_chars.saturating_sub(self.total_chars);
        if remaining == 0 {
            self.value.push_str(TRUNCATION_MARKER);
            self.truncated = true;
            return;
        }
        let chars = text.chars().count();
        if chars <= remaining {
            self.value.push_str(text);
            self.total_chars += chars;
            return;
        }
        self.value.extend(text.chars().take(remaining));
        self.value.push_str(TRUNCATION_MARKER);
        self.total_chars += remaining;
        self.truncated = true;
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn into_value(self) -> String {
        self.value
    }
}

/// Fixed-capacity rolling window over the most recent output. Unlike the
/// complete buffer it keeps evolving after truncation, so the latest output
/// stays available for diagnostics.
#[derive(Debug)]
pub struct TailBuffer {
    parts: VecDeque<String>,
    total_chars: usize,
    max_chars: usize,
}

impl TailBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            parts: VecDeque::new(),
            total_chars: 0,
            max_chars,
        }
    }

    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.total_chars += text.chars().count();
        self.parts.push_back(text.to_string());

        let mut over = self.total_chars.saturating_sub(self.max_chars);
        while over > 0 {
            let Some(head) = self.parts.front_mut() else {
                break;
            };
            let head_chars = head.chars().count();
            if head_chars <= over {
                self.total_chars -= head_chars;
                self.parts.pop_front();
                over -= head_chars;
                continue;
            }
            let cut = head
                .char_indices()
                .nth(over)
                .map(|(ix, _)| ix)
                .unwrap_or(head.len());
            head.drain(..cut);
            self.total_chars -= over;
            over = 0;
        }
    }

    pub fn value(&self) -> String {
        self.parts.iter().map(String::as_str).collect()
    }
}

/// Everything the pipeline retained once a command has finished.
#[derive(Debug)]
pub struct CapturedOutput {
    pub output: String,
    pub truncated: bool,
    pub tail: String,
}

/// Writer-side fan-out. Lives on the execution thread; only the fragment
/// queue crosses to the drain loop. `None` on the queue is the end-of-stream
/// sentinel, pushed exactly once by `close()`.
#[derive(Debug)]
pub struct OutputTee {
    buffer: StreamBuffer,
    tail: TailBuffer,
    queue: Sender<Option<String>>,
    max_fragment_chars: usize,
    closed: bool,
}

impl OutputTee {
    pub fn new(config: &StreamConfig, budget_override: Option<usize>, queue: Sender<Option<String>>) -> Self {
        Self {
            buffer: StreamBuffer::new(budget_override.unwrap_or(config.max_total_chars)),
            tail: TailBuffer::new(config.tail_chars),
            queue,
            max_fragment_chars: config.max_fragment_chars.max(1),
            closed: false,
        }
    }

    pub fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer.write(text);
        self.tail.append(text);
        if self.closed {
            return;
        }
        // A send failure means the drain loop is gone; keep buffering so the
        // terminal response still carries the full output.
        for fragment in fragments(text, self.max_fragment_chars) {
            if self.queue.send(Some(fragment.to_string())).is_err() {
                break;
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.queue.send(None);
    }

    pub fn finish(mut self) -> CapturedOutput {
        self.close();
        let tail = self.tail.value();
        let truncated = self.buffer.truncated();
        CapturedOutput {
            output: self.buffer.into_value(),
            truncated,
            tail,
        }
    }
}

impl OutputSink for OutputTee {
    fn write(&mut self, text: &str) {
        OutputTee::write(self, text);
    }
}

fn fragments(text: &str, max_chars: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let cut = rest
            .char_indices()
            .nth(max_chars)
            .map(|(ix, _)| ix)
            .unwrap_or(rest.len());
        let (head, remainder) = rest.split_at(cut);
        rest = remainder;
        Some(head)
    })
}

/// Consumer-side drain loop. Pulls fragments off the queue, coalesces until
/// `flush_interval` elapses or the pending batch reaches
/// `max_chunk_chars`, and hands each batch to `notify`. The sentinel
/// triggers a final flush before returning.
pub fn drain_chunks<F>(
    queue: Receiver<Option<String>>,
    flush_interval: Duration,
    max_chunk_chars: usize,
    mut notify: F,
) where
    F: FnMut(String),
{
    let mut pending = String::new();
    let mut pending_chars = 0usize;
    let mut last_flush = Instant::now();

    loop {
        match queue.recv_timeout(flush_interval) {
            Ok(Some(text)) => {
                pending_chars += text.chars().count();
                pending.push_str(&text);
                if pending_chars >= max_chunk_chars || last_flush.elapsed() >= flush_interval {
                    notify(std::mem::take(&mut pending));
                    pending_chars = 0;
                    last_flush = Instant::now();
                }
            }
            Ok(None) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    notify(std::mem::take(&mut pending));
                    pending_chars = 0;
                    last_flush = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !pending.is_empty() {
        notify(pending);
    }
}

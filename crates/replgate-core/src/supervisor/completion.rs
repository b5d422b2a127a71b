//! Idle-based completion detection.
//!
//! An interactive interpreter gives no end-of-response marker, so a
//! submission is considered finished once output has been seen and then
//! nothing new arrived for `idle`. The detector is a pure state machine over
//! observed lines and clock readings; the supervisor feeds it and sleeps
//! until the instant it reports.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::session::{OutputLine, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep waiting; nothing can change before `wake_at` unless new output arrives.
    Pending { wake_at: Instant },
    Completed,
    /// Stderr produced output and the streams went idle.
    Errored,
    TimedOut,
}

/// Lines attributed to one submission, deduplicated per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Stdout followed by stderr, for error reports.
    pub fn combined(&self) -> Vec<String> {
        self.stdout.iter().chain(self.stderr.iter()).cloned().collect()
    }
}

pub struct CompletionDetector {
    idle: Duration,
    max_wait: Duration,
    started: Instant,
    last_output: Option<Instant>,
    dedupe: bool,
    ignore: Option<String>,
    seen_stdout: HashSet<String>,
    seen_stderr: HashSet<String>,
    captured: CapturedOutput,
}

impl CompletionDetector {
    pub fn new(idle: Duration, max_wait: Duration, started: Instant) -> Self {
        Self {
            idle,
            max_wait,
            started,
            last_output: None,
            dedupe: true,
            ignore: None,
            seen_stdout: HashSet::new(),
            seen_stderr: HashSet::new(),
            captured: CapturedOutput::default(),
        }
    }

    /// Keep repeated lines instead of collapsing them.
    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    /// Drop any line containing `needle` (late buffer-clearing markers).
    pub fn ignoring(mut self, needle: impl Into<String>) -> Self {
        self.ignore = Some(needle.into());
        self
    }

    /// Record a line. Returns false when the line was blank, ignored, or a
    /// duplicate; such lines do not reset the idle clock.
    pub fn observe(&mut self, line: OutputLine) -> bool {
        if line.text.trim().is_empty() {
            return false;
        }
        if let Some(needle) = &self.ignore {
            if line.text.contains(needle.as_str()) {
                return false;
            }
        }

        let (seen, sink) = match line.kind {
            StreamKind::Stdout => (&mut self.seen_stdout, &mut self.captured.stdout),
            StreamKind::Stderr => (&mut self.seen_stderr, &mut self.captured.stderr),
        };
        if self.dedupe && !seen.insert(line.text.clone()) {
            return false;
        }

        sink.push(line.text);
        self.last_output = Some(match self.last_output {
            Some(previous) if previous > line.received_at => previous,
            _ => line.received_at,
        });
        true
    }

    pub fn verdict(&self, now: Instant) -> Verdict {
        let deadline = self.started + self.max_wait;

        if let Some(last) = self.last_output {
            let idle_until = last + self.idle;
            if now >= idle_until {
                if !self.captured.stderr.is_empty() {
                    return Verdict::Errored;
                }
                return Verdict::Completed;
            }
            if now >= deadline {
                return Verdict::TimedOut;
            }
            return Verdict::Pending {
                wake_at: idle_until.min(deadline),
            };
        }

        if now >= deadline {
            Verdict::TimedOut
        } else {
            Verdict::Pending { wake_at: deadline }
        }
    }

    pub fn captured(&self) -> &CapturedOutput {
        &self.captured
    }

    pub fn finish(self) -> CapturedOutput {
        self.captured
    }
}

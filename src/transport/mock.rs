//! Scripted in-memory port for tests and offline development.

use super::PortIo;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Rule {
    needle: String,
    /// One-shot replies consumed front to back.
    queued: VecDeque<String>,
    /// Persistent reply used once the queue is empty.
    standing: Option<String>,
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    writes: Vec<String>,
}

/// Shared script: command substring -> canned reply. Clone it to hand the
/// same script to several [`MockPort`]s and to assert on writes afterwards.
#[derive(Clone, Default)]
pub struct MockScript(Arc<Mutex<Inner>>);

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` every time a written command contains `needle`.
    pub fn on(&self, needle: &str, reply: &str) -> &Self {
        let reply = reply.to_string();
        self.with_rule(needle, |rule| rule.standing = Some(reply));
        self
    }

    /// Reply with `reply` once, then fall back to the standing reply (or
    /// silence) for later matches.
    pub fn on_once(&self, needle: &str, reply: &str) -> &Self {
        let reply = reply.to_string();
        self.with_rule(needle, |rule| rule.queued.push_back(reply));
        self
    }

    /// Every command written to any port sharing this script, in order.
    pub fn writes(&self) -> Vec<String> {
        lock_inner(&self.0).writes.clone()
    }

    /// A port backed by this script.
    pub fn port(&self) -> MockPort {
        MockPort {
            script: self.clone(),
            pending: VecDeque::new(),
        }
    }

    fn with_rule(&self, needle: &str, apply: impl FnOnce(&mut Rule)) {
        let mut inner = lock_inner(&self.0);
        let idx = match inner.rules.iter().position(|r| r.needle == needle) {
            Some(idx) => idx,
            None => {
                inner.rules.push(Rule {
                    needle: needle.to_string(),
                    queued: VecDeque::new(),
                    standing: None,
                });
                inner.rules.len() - 1
            }
        };
        apply(&mut inner.rules[idx]);
    }

    fn reply_for(&self, written: &str) -> Option<String> {
        let mut inner = lock_inner(&self.0);
        inner.writes.push(written.to_string());
        let rule = inner
            .rules
            .iter_mut()
            .find(|r| written.contains(&r.needle))?;
        rule.queued.pop_front().or_else(|| rule.standing.clone())
    }
}

fn lock_inner(m: &Mutex<Inner>) -> std::sync::MutexGuard<'_, Inner> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One scripted port. Writing a command queues the matching reply; reads
/// drain it. Quiet slices sleep for the slice duration like a real line.
pub struct MockPort {
    script: MockScript,
    pending: VecDeque<u8>,
}

impl PortIo for MockPort {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let written = String::from_utf8_lossy(bytes).to_string();
        if let Some(reply) = self.script.reply_for(&written) {
            self.pending.extend(reply.into_bytes());
        }
        Ok(())
    }

    fn read_slice(&mut self, buf: &mut [u8], slice: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            std::thread::sleep(slice);
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        for b in buf.iter_mut().take(n) {
            // Drain front to back.
            *b = self.pending.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

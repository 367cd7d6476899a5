//! Scripted stand-in for a serial device, used by driver tests.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use super::Transport;

#[derive(Default)]
struct MockState {
    raw: String,
    line_buf: String,
    commands: Vec<String>,
    queued: HashMap<String, VecDeque<String>>,
    persistent: HashMap<String, String>,
    rx: VecDeque<u8>,
    failing_writes: usize,
}

/// Cloneable handle; every clone talks to the same simulated device
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for the next time `command` is written
    pub fn reply(&self, command: &str, response: &str) {
        self.state
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
    }

    /// Reply to `command` every time once the queued replies run out
    pub fn always(&self, command: &str, response: &str) {
        self.state
            .lock()
            .persistent
            .insert(command.to_string(), response.to_string());
    }

    /// Push bytes as if the device sent them unprompted
    pub fn feed(&self, bytes: &str) {
        self.state.lock().rx.extend(bytes.bytes());
    }

    /// Make the next `n` writes fail with a broken pipe
    pub fn fail_writes(&self, n: usize) {
        self.state.lock().failing_writes = n;
    }

    /// Every command line written so far, terminators stripped
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    pub fn raw_written(&self) -> String {
        self.state.lock().raw.clone()
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }

        let text = String::from_utf8_lossy(bytes).to_string();
        state.raw.push_str(&text);

        for ch in text.chars() {
            if ch == '\r' || ch == '\n' {
                if state.line_buf.is_empty() {
                    continue;
                }
                let command = std::mem::take(&mut state.line_buf);
                let queued = state.queued.get_mut(&command).and_then(|q| q.pop_front());
                let response = queued.or_else(|| state.persistent.get(&command).cloned());
                if let Some(response) = response {
                    state.rx.extend(response.bytes());
                }
                state.commands.push(command);
            } else {
                state.line_buf.push(ch);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().rx.clear();
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.state.lock().rx.len())
    }
}

use crate::core::domain::{CapturedOutput, OutputCaps};
use crate::core::traits::engine::ExecEvent;

/// Keeps at most `cap` bytes. Anything past the cap is dropped and remembered
/// as truncation; pushing never fails and never blocks.
#[derive(Debug)]
pub struct BoundedBuffer {
    cap: usize,
    data: Vec<u8>,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            data: Vec::with_capacity(cap.min(8 * 1024)),
            truncated: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn finish(self) -> CapturedOutput {
        CapturedOutput {
            data: self.data,
            truncated: self.truncated,
        }
    }
}

#[derive(Debug)]
pub struct OutputCollector {
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
}

impl OutputCollector {
    pub fn new(caps: OutputCaps) -> Self {
        Self {
            stdout: BoundedBuffer::new(caps.stdout_bytes),
            stderr: BoundedBuffer::new(caps.stderr_bytes),
        }
    }

    /// Routes an output chunk to its buffer. Returns the exit status when the
    /// event is the terminal one.
    pub fn observe(&mut self, event: ExecEvent) -> Option<Option<i64>> {
        match event {
            ExecEvent::Stdout(bytes) => {
                self.stdout.push(&bytes);
                None
            }
            ExecEvent::Stderr(bytes) => {
                self.stderr.push(&bytes);
                None
            }
            ExecEvent::Exited(code) => Some(code),
        }
    }

    pub fn finish(self) -> (CapturedOutput, CapturedOutput) {
        (self.stdout.finish(), self.stderr.finish())
    }
}

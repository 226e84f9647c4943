//! In-memory test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};

/// Byte stream that replays scripted read chunks and records every write.
///
/// Each scripted chunk is returned by one `read` call (split further if the
/// caller's buffer is smaller), which exercises short-read accumulation.
/// Once drained the stream reports end-of-file, or `WouldBlock` when built
/// with [`ScriptedStream::pending_when_drained`].
#[derive(Debug, Default)]
pub struct ScriptedStream {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    block_when_drained: bool,
}

impl ScriptedStream {
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        Self {
            reads: reads.into(),
            written: Vec::new(),
            block_when_drained: false,
        }
    }

    pub fn pending_when_drained(mut self) -> Self {
        self.block_when_drained = true;
        self
    }

    pub fn push_read(&mut self, chunk: &[u8]) {
        self.reads.push_back(chunk.to_vec());
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.reads.pop_front() else {
            if self.block_when_drained {
                return Err(io::Error::new(ErrorKind::WouldBlock, "no data pending"));
            }
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            let rest = chunk.split_off(n);
            self.reads.push_front(rest);
        }
        Ok(n)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

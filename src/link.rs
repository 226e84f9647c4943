//! Line-oriented request/response framing over any byte stream.
//!
//! Both the piezo controller and the auxiliary motor board speak ASCII lines.
//! `LineLink` accumulates partial reads until a full line is available and
//! reports "nothing pending" instead of blocking forever, so callers can poll
//! against their own deadline.

use crate::error::ScanError;
use crate::utils::{PollError, poll_with_timeout};
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

const READ_CHUNK: usize = 256;

pub struct LineLink<S> {
    stream: S,
    terminator: &'static str,
    pending: Vec<u8>,
}

impl<S: Read + Write> LineLink<S> {
    /// Wrap a stream. `terminator` is appended to every outgoing line.
    pub fn new(stream: S, terminator: &'static str) -> Self {
        Self {
            stream,
            terminator,
            pending: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), ScanError> {
        debug!("-> {}", line);
        let mut frame = String::with_capacity(line.len() + self.terminator.len());
        frame.push_str(line);
        frame.push_str(self.terminator);
        self.stream
            .write_all(frame.as_bytes())
            .map_err(|e| ScanError::io(e, format!("Writing line '{}'", line)))?;
        self.stream
            .flush()
            .map_err(|e| ScanError::io(e, "Flushing line link"))
    }

    /// Return the next complete line if one is available without waiting
    /// longer than the stream's own read timeout.
    pub fn try_read_line(&mut self) -> Result<Option<String>, ScanError> {
        loop {
            if let Some(line) = self.take_line() {
                debug!("<- {}", line);
                return Ok(Some(line));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ScanError::ConnectionBroken {
                        expected: self.pending.len() + 1,
                        received: self.pending.len(),
                    });
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(ScanError::io(e, "Reading line link")),
            }
        }
    }

    /// Poll for a line until `timeout`, sleeping `idle` whenever nothing is pending
    pub fn read_line(&mut self, timeout: Duration, idle: Duration) -> Result<String, ScanError> {
        match poll_with_timeout(|| self.try_read_line(), timeout, idle) {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(ScanError::Timeout(format!(
                "No response line within {:?}",
                timeout
            ))),
            Err(PollError::Timeout) => Err(ScanError::Timeout(format!(
                "No response line within {:?}",
                timeout
            ))),
            Err(PollError::ConditionError(e)) => Err(e),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            // bare terminator left over from a CRLF split across reads
            return self.take_line();
        }
        Some(line)
    }
}

//! Driver for Agilis-style piezo controllers speaking the ASCII command set
//! (`MR`, `ML`, `CC`, `PR`, `SU`, `TE`) over a serial line.

use crate::actuator::Actuator;
use crate::error::ScanError;
use crate::link::LineLink;
use crate::types::{Axis, JogDirection};
use log::{debug, warn};
use std::io::{Read, Write};
use std::time::Duration;

/// Controllers expect CRLF-terminated commands
pub const TERMINATOR: &str = "\r\n";

#[derive(Debug, Clone)]
pub struct AgilisConfig {
    /// Time to wait for the answer to an error query
    pub response_timeout: Duration,
    /// Sleep between polls while no response is pending
    pub poll_interval: Duration,
}

impl Default for AgilisConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
        }
    }
}

pub struct AgilisController<S> {
    link: LineLink<S>,
    config: AgilisConfig,
}

impl<S: Read + Write> AgilisController<S> {
    pub fn new(stream: S, config: AgilisConfig) -> Self {
        Self {
            link: LineLink::new(stream, TERMINATOR),
            config,
        }
    }

    /// Query the last command's error code; `0` means accepted
    pub fn tell_error(&mut self) -> Result<i32, ScanError> {
        self.link.write_line("TE")?;
        let reply = self
            .link
            .read_line(self.config.response_timeout, self.config.poll_interval)?;
        parse_error_reply(&reply)
    }

    fn command_accepted(&mut self, command: &str) -> Result<bool, ScanError> {
        self.link.write_line(command)?;
        let code = self.tell_error()?;
        if code != 0 {
            warn!("Controller rejected '{}' with error code {}", command, code);
        }
        Ok(code == 0)
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.link.get_mut()
    }
}

fn parse_error_reply(reply: &str) -> Result<i32, ScanError> {
    reply
        .strip_prefix("TE")
        .and_then(|code| code.trim().parse::<i32>().ok())
        .ok_or_else(|| ScanError::Protocol(format!("Malformed error reply: '{}'", reply)))
}

impl<S: Read + Write> Actuator for AgilisController<S> {
    fn set_remote_mode(&mut self) -> Result<(), ScanError> {
        self.link.write_line("MR")
    }

    fn set_local_mode(&mut self) -> Result<(), ScanError> {
        self.link.write_line("ML")
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), ScanError> {
        self.link.write_line(&format!("CC{}", channel))
    }

    fn set_step_amplitude(
        &mut self,
        direction: JogDirection,
        amplitude: u8,
    ) -> Result<bool, ScanError> {
        let command = format!(
            "{}SU{}{}",
            u8::from(direction.axis()),
            direction.polarity().symbol(),
            amplitude
        );
        debug!("Setting step amplitude for {:?}", direction);
        self.command_accepted(&command)
    }

    fn relative_move(&mut self, axis: Axis, steps: i64) -> Result<bool, ScanError> {
        self.command_accepted(&format!("{}PR{}", u8::from(axis), steps))
    }
}

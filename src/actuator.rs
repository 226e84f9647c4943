use crate::error::ScanError;
use crate::types::{Axis, JogDirection};
use parking_lot::Mutex;
use std::sync::Arc;

/// Command surface of a piezo stage controller.
///
/// `relative_move` and `set_step_amplitude` return `Ok(false)` when the
/// controller answered but refused the command; transport failures are
/// errors.
pub trait Actuator {
    fn set_remote_mode(&mut self) -> Result<(), ScanError>;

    fn set_local_mode(&mut self) -> Result<(), ScanError>;

    fn set_channel(&mut self, channel: u8) -> Result<(), ScanError>;

    fn set_step_amplitude(
        &mut self,
        direction: JogDirection,
        amplitude: u8,
    ) -> Result<bool, ScanError>;

    fn relative_move(&mut self, axis: Axis, steps: i64) -> Result<bool, ScanError>;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set_remote_mode(&mut self) -> Result<(), ScanError> {
        (**self).set_remote_mode()
    }

    fn set_local_mode(&mut self) -> Result<(), ScanError> {
        (**self).set_local_mode()
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), ScanError> {
        (**self).set_channel(channel)
    }

    fn set_step_amplitude(
        &mut self,
        direction: JogDirection,
        amplitude: u8,
    ) -> Result<bool, ScanError> {
        (**self).set_step_amplitude(direction, amplitude)
    }

    fn relative_move(&mut self, axis: Axis, steps: i64) -> Result<bool, ScanError> {
        (**self).relative_move(axis, steps)
    }
}

/// Every command a controller received, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    RemoteMode,
    LocalMode,
    Channel(u8),
    StepAmplitude(JogDirection, u8),
    RelativeMove(Axis, i64),
}

#[derive(Debug, Default)]
struct SimState {
    horizontal: i64,
    vertical: i64,
    remote: bool,
    commands: Vec<ActuatorCommand>,
    reject_move_number: Option<usize>,
    moves_seen: usize,
}

/// In-memory stage that integrates commanded steps.
///
/// Clones share state, so one clone can drive the stage on the worker
/// thread while another inspects it.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStage {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the `n`-th relative move (1-based) and every one after it
    pub fn reject_moves_from(self, n: usize) -> Self {
        self.state.lock().reject_move_number = Some(n);
        self
    }

    /// Integrated `(horizontal, vertical)` step position
    pub fn position(&self) -> (i64, i64) {
        let state = self.state.lock();
        (state.horizontal, state.vertical)
    }

    pub fn is_remote(&self) -> bool {
        self.state.lock().remote
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.state.lock().commands.clone()
    }

    pub fn moves(&self) -> Vec<(Axis, i64)> {
        self.state
            .lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                ActuatorCommand::RelativeMove(axis, steps) => Some((*axis, *steps)),
                _ => None,
            })
            .collect()
    }
}

impl Actuator for SimulatedStage {
    fn set_remote_mode(&mut self) -> Result<(), ScanError> {
        let mut state = self.state.lock();
        state.remote = true;
        state.commands.push(ActuatorCommand::RemoteMode);
        Ok(())
    }

    fn set_local_mode(&mut self) -> Result<(), ScanError> {
        let mut state = self.state.lock();
        state.remote = false;
        state.commands.push(ActuatorCommand::LocalMode);
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), ScanError> {
        self.state.lock().commands.push(ActuatorCommand::Channel(channel));
        Ok(())
    }

    fn set_step_amplitude(
        &mut self,
        direction: JogDirection,
        amplitude: u8,
    ) -> Result<bool, ScanError> {
        self.state
            .lock()
            .commands
            .push(ActuatorCommand::StepAmplitude(direction, amplitude));
        Ok(true)
    }

    fn relative_move(&mut self, axis: Axis, steps: i64) -> Result<bool, ScanError> {
        let mut state = self.state.lock();
        state.moves_seen += 1;
        state.commands.push(ActuatorCommand::RelativeMove(axis, steps));
        if state
            .reject_move_number
            .is_some_and(|n| state.moves_seen >= n)
        {
            return Ok(false);
        }
        match axis {
            Axis::Horizontal => state.horizontal += steps,
            Axis::Vertical => state.vertical += steps,
        }
        Ok(true)
    }
}

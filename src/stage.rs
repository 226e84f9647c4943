use crate::actuator::Actuator;
use crate::calibration::{CalibrationParameters, StepAmplitudes};
use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::motion::{MoveDecomposer, MoveReport};
use crate::types::{Axis, JogDirection};
use log::{debug, info};
use serde::Serialize;
use std::time::Duration;

/// Actuator steps covered by one pixel on each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSteps {
    pub x: u32,
    pub y: u32,
}

impl PixelSteps {
    pub fn new(calibration: &CalibrationParameters, pixel_step: f64) -> Result<Self, ScanError> {
        let x = calibration.distance_to_steps(Axis::Horizontal, pixel_step);
        let y = calibration.distance_to_steps(Axis::Vertical, pixel_step);
        if x < 1 || y < 1 {
            return Err(ScanError::InvalidConfig(format!(
                "Pixel step {} is smaller than one actuator step ({} x {})",
                pixel_step, x, y
            )));
        }
        Ok(Self {
            x: u32::try_from(x).map_err(|_| too_large(x))?,
            y: u32::try_from(y).map_err(|_| too_large(y))?,
        })
    }
}

fn too_large(steps: i64) -> ScanError {
    ScanError::InvalidConfig(format!("Pixel step of {} actuator steps is too large", steps))
}

/// Physical readout of a pixel, relative to the frame centre
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CursorPosition {
    pub col: i32,
    pub row: i32,
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(col: i32, row: i32, grid_dimension: usize, pixel_step: f64) -> Self {
        let half = grid_dimension as f64 / 2.0;
        Self {
            col,
            row,
            x: (col as f64 - half) * pixel_step,
            y: (half - row as f64) * pixel_step,
        }
    }
}

/// Piezo stage with the pixel it currently sits on.
///
/// Every operation that talks to the controller takes it into remote mode
/// on the configured channel and hands it back to local mode afterwards,
/// also when the operation fails.
pub struct Stage<A> {
    actuator: A,
    channel: u8,
    index: (i32, i32),
}

impl<A: Actuator> Stage<A> {
    pub fn new(actuator: A, channel: u8) -> Self {
        Self {
            actuator,
            channel,
            index: (0, 0),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Pixel the stage was last moved to
    pub fn index(&self) -> (i32, i32) {
        self.index
    }

    pub fn set_index(&mut self, col: i32, row: i32) {
        self.index = (col, row);
    }

    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }

    pub fn into_inner(self) -> A {
        self.actuator
    }

    /// Take remote control of the configured channel
    pub fn engage(&mut self) -> Result<(), ScanError> {
        self.actuator.set_remote_mode()?;
        self.actuator.set_channel(self.channel)
    }

    pub fn release(&mut self) -> Result<(), ScanError> {
        self.actuator.set_local_mode()
    }

    /// Run `operation` in remote mode, always returning to local mode
    pub fn remote<T>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        self.engage()?;
        let result = operation(self);
        let released = self.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Push all four step amplitudes; the caller owns the mode bracketing
    pub fn push_amplitudes(&mut self, amplitudes: &StepAmplitudes) -> Result<(), ScanError> {
        for direction in JogDirection::ALL {
            self.push_amplitude(direction, amplitudes.get(direction))?;
        }
        Ok(())
    }

    fn push_amplitude(&mut self, direction: JogDirection, amplitude: u8) -> Result<(), ScanError> {
        if self.actuator.set_step_amplitude(direction, amplitude)? {
            Ok(())
        } else {
            Err(ScanError::Protocol(format!(
                "Controller rejected step amplitude {} for {:?}",
                amplitude, direction
            )))
        }
    }

    /// Write the locked calibration's amplitudes to the controller
    pub fn apply_step_amplitudes(&mut self, amplitudes: &StepAmplitudes) -> Result<(), ScanError> {
        info!("Applying step amplitudes {:?}", amplitudes);
        self.remote(|stage| stage.push_amplitudes(amplitudes))
    }

    /// Calibration jog: `count` commands of `unit_steps` each in `direction`
    pub fn jog(
        &mut self,
        direction: JogDirection,
        amplitude: u8,
        unit_steps: u32,
        count: u32,
        dwell: Duration,
        cancel: &CancellationToken,
    ) -> Result<MoveReport, ScanError> {
        info!(
            "Jogging {:?}: {} x {} steps at amplitude {}",
            direction, count, unit_steps, amplitude
        );
        self.remote(|stage| {
            stage.push_amplitude(direction, amplitude)?;
            let displacement = direction.signed(unit_steps) as f64 * count as f64;
            MoveDecomposer::new(&mut stage.actuator, dwell)
                .with_cancellation(cancel)
                .move_steps(direction.axis(), displacement, unit_steps)
        })
    }

    /// Pixel under a fractional display coordinate, clamped into the grid
    pub fn pixel_at(fx: f64, fy: f64, grid_dimension: usize) -> (i32, i32) {
        let max = grid_dimension.saturating_sub(1) as f64;
        let clamp = |v: f64| {
            if v.is_nan() {
                0
            } else {
                v.clamp(0.0, max).round() as i32
            }
        };
        (clamp(fx), clamp(fy))
    }

    /// Click-to-move: travel from the current pixel to `(col, row)`,
    /// bracketed by remote and local mode.
    pub fn move_to_pixel(
        &mut self,
        col: i32,
        row: i32,
        calibration: &CalibrationParameters,
        pixel_step: f64,
        dwell: Duration,
    ) -> Result<(MoveReport, MoveReport), ScanError> {
        self.remote(|stage| stage.travel_to_pixel(col, row, calibration, pixel_step, dwell, None))
    }

    /// Travel from the current pixel to `(col, row)` without touching the
    /// controller mode.
    ///
    /// The displacement is skew/rotation corrected and issued as pixel-sized
    /// unit commands, horizontal first. The index only follows a move that
    /// ran to completion.
    pub fn travel_to_pixel(
        &mut self,
        col: i32,
        row: i32,
        calibration: &CalibrationParameters,
        pixel_step: f64,
        dwell: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(MoveReport, MoveReport), ScanError> {
        let steps = PixelSteps::new(calibration, pixel_step)?;
        let (from_col, from_row) = self.index;
        let dx = calibration
            .distance_to_steps_exact(Axis::Horizontal, (from_col - col) as f64 * pixel_step);
        let dy =
            calibration.distance_to_steps_exact(Axis::Vertical, (from_row - row) as f64 * pixel_step);
        let corrected = calibration.apply_skew_and_rotation(dx, dy);
        debug!(
            "Moving ({}, {}) -> ({}, {}): {:.2}, {:.2} steps",
            from_col, from_row, col, row, corrected.0, corrected.1
        );

        let mut decomposer = MoveDecomposer::new(&mut self.actuator, dwell);
        if let Some(token) = cancel {
            decomposer = decomposer.with_cancellation(token);
        }
        let (horizontal, vertical) = decomposer.move_vector(corrected, (steps.x, steps.y))?;
        if !horizontal.cancelled && !vertical.cancelled {
            self.index = (col, row);
        }
        Ok((horizontal, vertical))
    }
}

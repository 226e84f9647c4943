//! Decomposition of a displacement into paced unit commands.
//!
//! The piezo controller has no "move N steps" primitive that keeps up with
//! the acquisition cadence, so a displacement is issued as a run of unit
//! relative moves, each followed by the dwell. A move of `n` units therefore
//! takes roughly `n * dwell`.

use crate::actuator::Actuator;
use crate::calibration::CalibrationParameters;
use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::types::Axis;
use crate::utils::dwell;
use log::{debug, warn};
use std::time::Duration;

/// Outcome of one decomposed move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveReport {
    pub axis: Axis,
    /// Signed size of each unit command in actuator steps
    pub unit_steps: i64,
    pub requested: u64,
    pub completed: u64,
    pub cancelled: bool,
}

impl MoveReport {
    fn idle(axis: Axis) -> Self {
        Self {
            axis,
            unit_steps: 0,
            requested: 0,
            completed: 0,
            cancelled: false,
        }
    }

    /// Net actuator steps actually issued
    pub fn net_steps(&self) -> i64 {
        self.unit_steps * self.completed as i64
    }
}

pub struct MoveDecomposer<'a, A: Actuator + ?Sized> {
    actuator: &'a mut A,
    dwell: Duration,
    cancel: Option<&'a CancellationToken>,
}

impl<'a, A: Actuator + ?Sized> MoveDecomposer<'a, A> {
    pub fn new(actuator: &'a mut A, dwell: Duration) -> Self {
        Self {
            actuator,
            dwell,
            cancel: None,
        }
    }

    /// Stop issuing unit commands once `token` is cancelled
    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Move by `displacement` actuator steps in commands of `unit_steps` each.
    ///
    /// The command count is `round(|displacement| / unit_steps)`. A refused
    /// command halts the move and reports how many commands completed.
    pub fn move_steps(
        &mut self,
        axis: Axis,
        displacement: f64,
        unit_steps: u32,
    ) -> Result<MoveReport, ScanError> {
        if !displacement.is_finite() {
            return Err(ScanError::InvalidConfig(format!(
                "Non-finite displacement on {:?}",
                axis
            )));
        }
        if unit_steps == 0 {
            return Err(ScanError::InvalidConfig(
                "Unit step size must be at least one actuator step".to_string(),
            ));
        }

        let requested = (displacement.abs() / unit_steps as f64).round() as u64;
        if requested == 0 {
            return Ok(MoveReport::idle(axis));
        }
        let step = displacement.signum() as i64 * unit_steps as i64;
        debug!(
            "Decomposing {:.2} steps on {:?} into {} commands of {}",
            displacement, axis, requested, step
        );

        let mut report = MoveReport {
            axis,
            unit_steps: step,
            requested,
            completed: 0,
            cancelled: false,
        };

        for _ in 0..requested {
            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!(
                    "Move on {:?} cancelled after {}/{} commands",
                    axis, report.completed, requested
                );
                report.cancelled = true;
                return Ok(report);
            }

            if !self.actuator.relative_move(axis, step)? {
                warn!(
                    "Actuator refused command {}/{} on {:?}",
                    report.completed + 1,
                    requested,
                    axis
                );
                return Err(ScanError::Actuator {
                    axis,
                    steps: step,
                    completed: report.completed,
                    requested,
                });
            }
            report.completed += 1;
            dwell(self.dwell);
        }

        Ok(report)
    }

    /// Move a physical distance along one axis in single-step commands
    pub fn move_distance(
        &mut self,
        calibration: &CalibrationParameters,
        axis: Axis,
        distance: f64,
    ) -> Result<MoveReport, ScanError> {
        let steps = calibration.distance_to_steps_exact(axis, distance);
        self.move_steps(axis, steps, 1)
    }

    /// Move by a step vector, horizontal first, each axis in commands of its
    /// own unit size
    pub fn move_vector(
        &mut self,
        (dx, dy): (f64, f64),
        (unit_x, unit_y): (u32, u32),
    ) -> Result<(MoveReport, MoveReport), ScanError> {
        let horizontal = self.move_steps(Axis::Horizontal, dx, unit_x)?;
        if horizontal.cancelled {
            return Ok((horizontal, MoveReport::idle(Axis::Vertical)));
        }
        let vertical = self.move_steps(Axis::Vertical, dy, unit_y)?;
        Ok((horizontal, vertical))
    }

    /// Issue one relative move without pacing. Zero steps is a no-op.
    pub fn single(&mut self, axis: Axis, steps: i64) -> Result<(), ScanError> {
        if steps == 0 {
            return Ok(());
        }
        if self.actuator.relative_move(axis, steps)? {
            Ok(())
        } else {
            Err(ScanError::Actuator {
                axis,
                steps,
                completed: 0,
                requested: 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::SimulatedStage;
    use std::time::Instant;

    #[test]
    fn test_two_units_at_point_two_is_ten_commands() {
        let mut stage = SimulatedStage::new();
        let calibration = CalibrationParameters::new(0.2, 0.2).unwrap();
        let report = MoveDecomposer::new(&mut stage, Duration::ZERO)
            .move_distance(&calibration, Axis::Horizontal, 2.0)
            .unwrap();

        assert_eq!(report.requested, 10);
        assert_eq!(report.completed, 10);
        assert_eq!(stage.moves(), vec![(Axis::Horizontal, 1); 10]);
    }

    #[test]
    fn test_negative_displacement_uses_negative_units() {
        let mut stage = SimulatedStage::new();
        let report = MoveDecomposer::new(&mut stage, Duration::ZERO)
            .move_steps(Axis::Vertical, -7.4, 2)
            .unwrap();
        assert_eq!(report.requested, 4);
        assert_eq!(report.net_steps(), -8);
        assert_eq!(stage.position(), (0, -8));
    }

    #[test]
    fn test_zero_move_is_noop_and_does_not_dwell() {
        let mut stage = SimulatedStage::new();
        let start = Instant::now();
        let report = MoveDecomposer::new(&mut stage, Duration::from_secs(5))
            .move_steps(Axis::Horizontal, 0.4, 1)
            .unwrap();
        assert_eq!(report.requested, 0);
        assert!(stage.commands().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_each_command_is_paced() {
        let mut stage = SimulatedStage::new();
        let start = Instant::now();
        MoveDecomposer::new(&mut stage, Duration::from_millis(5))
            .move_steps(Axis::Horizontal, 4.0, 1)
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_refused_command_reports_partial_completion() {
        let mut stage = SimulatedStage::new().reject_moves_from(4);
        let result = MoveDecomposer::new(&mut stage, Duration::ZERO).move_steps(Axis::Horizontal, 10.0, 1);

        match result {
            Err(ScanError::Actuator {
                completed,
                requested,
                ..
            }) => {
                assert_eq!(completed, 3);
                assert_eq!(requested, 10);
            }
            other => panic!("expected actuator error, got {:?}", other),
        }
        // nothing is issued after the refusal
        assert_eq!(stage.moves().len(), 4);
    }

    #[test]
    fn test_cancellation_stops_between_units() {
        let mut stage = SimulatedStage::new();
        let token = CancellationToken::new();
        token.cancel();
        let report = MoveDecomposer::new(&mut stage, Duration::ZERO)
            .with_cancellation(&token)
            .move_steps(Axis::Horizontal, 10.0, 1)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.completed, 0);
        assert!(stage.moves().is_empty());
    }

    #[test]
    fn test_vector_moves_horizontal_first() {
        let mut stage = SimulatedStage::new();
        MoveDecomposer::new(&mut stage, Duration::ZERO)
            .move_vector((-6.0, 3.0), (3, 3))
            .unwrap();
        assert_eq!(
            stage.moves(),
            vec![(Axis::Horizontal, -3), (Axis::Horizontal, -3), (Axis::Vertical, 3)]
        );
    }

    #[test]
    fn test_rejects_zero_unit_and_non_finite() {
        let mut stage = SimulatedStage::new();
        let mut decomposer = MoveDecomposer::new(&mut stage, Duration::ZERO);
        assert!(decomposer.move_steps(Axis::Vertical, 3.0, 0).is_err());
        assert!(decomposer.move_steps(Axis::Vertical, f64::NAN, 1).is_err());
    }
}

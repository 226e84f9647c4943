//! Stage calibration: scale factors, skew and rotation.
//!
//! Scale factors are stored as physical distance per actuator step (the
//! controller is calibrated by jogging a known number of steps and measuring
//! the travel). `distance_to_steps` divides by the factor and
//! `steps_to_distance` multiplies by it.

use crate::error::ScanError;
use crate::trig::AngleTable;
use crate::types::{Axis, JogDirection};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Largest step amplitude the piezo controller accepts
pub const MAX_STEP_AMPLITUDE: u8 = 50;

/// Per-direction step amplitudes pushed to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAmplitudes {
    pub horizontal_minus: u8,
    pub horizontal_plus: u8,
    pub vertical_minus: u8,
    pub vertical_plus: u8,
}

impl StepAmplitudes {
    pub fn get(&self, direction: JogDirection) -> u8 {
        match direction {
            JogDirection::HorizontalMinus => self.horizontal_minus,
            JogDirection::HorizontalPlus => self.horizontal_plus,
            JogDirection::VerticalMinus => self.vertical_minus,
            JogDirection::VerticalPlus => self.vertical_plus,
        }
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        for direction in JogDirection::ALL {
            let amplitude = self.get(direction);
            if amplitude == 0 || amplitude > MAX_STEP_AMPLITUDE {
                return Err(ScanError::InvalidConfig(format!(
                    "Step amplitude for {:?} must be 1..={}, got {}",
                    direction, MAX_STEP_AMPLITUDE, amplitude
                )));
            }
        }
        Ok(())
    }
}

impl Default for StepAmplitudes {
    fn default() -> Self {
        Self {
            horizontal_minus: 32,
            horizontal_plus: 28,
            vertical_minus: 26,
            vertical_plus: 22,
        }
    }
}

/// Immutable calibration snapshot. Every move reads exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    pub distance_per_step_x: f64,
    pub distance_per_step_y: f64,
    pub skew_radians: f64,
    pub rotation_degrees: f64,
    pub step_amplitudes: StepAmplitudes,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            distance_per_step_x: 0.2,
            distance_per_step_y: 0.2,
            skew_radians: 0.0,
            rotation_degrees: 0.0,
            step_amplitudes: StepAmplitudes::default(),
        }
    }
}

impl CalibrationParameters {
    pub fn new(distance_per_step_x: f64, distance_per_step_y: f64) -> Result<Self, ScanError> {
        let params = Self {
            distance_per_step_x,
            distance_per_step_y,
            ..Self::default()
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_skew_degrees(mut self, skew_degrees: f64) -> Self {
        self.skew_radians = skew_degrees.to_radians();
        self
    }

    pub fn with_rotation(mut self, rotation_degrees: f64) -> Self {
        self.rotation_degrees = rotation_degrees;
        self
    }

    /// Reject factors that would make distance/step conversion undefined
    pub fn validate(&self) -> Result<(), ScanError> {
        for (name, value) in [
            ("distance_per_step_x", self.distance_per_step_x),
            ("distance_per_step_y", self.distance_per_step_y),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ScanError::InvalidConfig(format!(
                    "{} must be strictly positive, got {}",
                    name, value
                )));
            }
        }
        if !self.skew_radians.is_finite() || !self.rotation_degrees.is_finite() {
            return Err(ScanError::InvalidConfig(
                "Skew and rotation must be finite".to_string(),
            ));
        }
        self.step_amplitudes.validate()
    }

    pub fn distance_per_step(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Horizontal => self.distance_per_step_x,
            Axis::Vertical => self.distance_per_step_y,
        }
    }

    /// Unrounded step equivalent of a physical distance
    pub fn distance_to_steps_exact(&self, axis: Axis, distance: f64) -> f64 {
        distance / self.distance_per_step(axis)
    }

    pub fn distance_to_steps(&self, axis: Axis, distance: f64) -> i64 {
        self.distance_to_steps_exact(axis, distance).round() as i64
    }

    pub fn steps_to_distance(&self, axis: Axis, steps: f64) -> f64 {
        steps * self.distance_per_step(axis)
    }

    /// Skew correction followed by the user rotation.
    ///
    /// The skew is subtracted from the X component only, then `(x, y)` is
    /// rotated by `rotation_degrees` using the shared angle table.
    pub fn apply_skew_and_rotation(&self, dx: f64, dy: f64) -> (f64, f64) {
        let x = dx - self.skew_radians;
        let y = dy;
        let (sin, cos) = AngleTable::global().sin_cos(self.rotation_degrees);
        (x * cos - y * sin, x * sin + y * cos)
    }
}

/// Copy-on-write holder of the current calibration.
///
/// Readers take an `Arc` snapshot and never observe a half-applied update.
/// Scale factors and amplitudes only change while the store is unlocked;
/// skew and rotation may be republished at any time.
#[derive(Debug)]
pub struct CalibrationStore {
    current: RwLock<Arc<CalibrationParameters>>,
    locked: AtomicBool,
}

impl CalibrationStore {
    pub fn new(params: CalibrationParameters) -> Result<Self, ScanError> {
        params.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(params)),
            locked: AtomicBool::new(true),
        })
    }

    pub fn snapshot(&self) -> Arc<CalibrationParameters> {
        self.current.read().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        log::info!("Calibration unlocked for editing");
    }

    /// Lock the calibration and return the snapshot to push to the controller
    pub fn lock(&self) -> Arc<CalibrationParameters> {
        self.locked.store(true, Ordering::SeqCst);
        log::info!("Calibration locked");
        self.snapshot()
    }

    /// Replace the whole parameter set. Only allowed while unlocked.
    pub fn update(&self, params: CalibrationParameters) -> Result<(), ScanError> {
        if self.is_locked() {
            return Err(ScanError::InvalidState(
                "Calibration is locked; unlock before editing".to_string(),
            ));
        }
        params.validate()?;
        *self.current.write() = Arc::new(params);
        Ok(())
    }

    pub fn set_rotation(&self, rotation_degrees: f64) -> Result<(), ScanError> {
        self.publish(|params| params.rotation_degrees = rotation_degrees)
    }

    pub fn set_skew_degrees(&self, skew_degrees: f64) -> Result<(), ScanError> {
        self.publish(|params| params.skew_radians = skew_degrees.to_radians())
    }

    fn publish(&self, edit: impl FnOnce(&mut CalibrationParameters)) -> Result<(), ScanError> {
        let mut guard = self.current.write();
        let mut next = CalibrationParameters::clone(&guard);
        edit(&mut next);
        next.validate()?;
        *guard = Arc::new(next);
        Ok(())
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(CalibrationParameters::default())),
            locked: AtomicBool::new(true),
        }
    }
}

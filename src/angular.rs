//! Single-axis angular positioning for the auxiliary stepper motors
//! (filter wheel, flip mounts, light dial).
//!
//! Unlike the piezo stage, the motor board accepts one combined
//! "move N steps in direction D at speed S" command and reports completion
//! asynchronously with a `DONE` line.

use crate::error::ScanError;
use crate::link::LineLink;
use crate::types::RotationDirection;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TERMINATOR: &str = "\n";

/// Mechanical description of one motor axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorGeometry {
    pub gear_ratio: f64,
    /// Full-step angle of the bare motor in degrees
    pub full_step_angle: f64,
    pub half_step: bool,
}

impl Default for MotorGeometry {
    fn default() -> Self {
        Self {
            gear_ratio: 1.0,
            full_step_angle: 1.8,
            half_step: false,
        }
    }
}

impl MotorGeometry {
    /// `trunc(360 / effective_step_angle * gear_ratio)`, at least one
    pub fn steps_per_revolution(&self) -> Result<u32, ScanError> {
        if !(self.full_step_angle.is_finite() && self.full_step_angle > 0.0) {
            return Err(ScanError::InvalidConfig(format!(
                "Full step angle must be positive, got {}",
                self.full_step_angle
            )));
        }
        if !(self.gear_ratio.is_finite() && self.gear_ratio > 0.0) {
            return Err(ScanError::InvalidConfig(format!(
                "Gear ratio must be positive, got {}",
                self.gear_ratio
            )));
        }
        let divisor = if self.half_step { 2.0 } else { 1.0 };
        let steps = (360.0 / (self.full_step_angle / divisor) * self.gear_ratio).trunc();
        if steps < 1.0 || steps > u32::MAX as f64 {
            return Err(ScanError::InvalidConfig(format!(
                "Geometry gives {} steps per revolution",
                steps
            )));
        }
        Ok(steps as u32)
    }

    /// Output-shaft degrees per step
    pub fn step_angle(&self) -> Result<f64, ScanError> {
        Ok(360.0 / self.steps_per_revolution()? as f64)
    }
}

/// Speed percentage to the board's step delay code: 0% is the slowest
/// (10000), 100% the fastest (1)
pub fn map_speed(percent: f64) -> Result<u32, ScanError> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(ScanError::InvalidConfig(format!(
            "Speed must be between 0 and 100 %, got {}",
            percent
        )));
    }
    Ok((10000.0 - percent * 9999.0 / 100.0).round_ties_even() as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    /// Absolute step position after the move, in `0..steps_per_rev`
    pub target_steps: u32,
    pub steps: u32,
    pub direction: RotationDirection,
}

impl MovePlan {
    /// Step position reached from `current` when the plan is executed
    pub fn final_position(&self, current: u32, steps_per_rev: u32) -> u32 {
        let spr = steps_per_rev as i64;
        let signed = match self.direction {
            RotationDirection::Clockwise => self.steps as i64,
            RotationDirection::CounterClockwise => -(self.steps as i64),
        };
        (current as i64 + signed).rem_euclid(spr) as u32
    }
}

/// Plan a move to `target_angle` degrees from `current_steps`.
///
/// Takes the shorter way round unless `forced` names a direction.
pub fn plan_move(
    target_angle: f64,
    current_steps: u32,
    geometry: &MotorGeometry,
    forced: Option<RotationDirection>,
) -> Result<MovePlan, ScanError> {
    if !target_angle.is_finite() {
        return Err(ScanError::InvalidConfig(format!(
            "Target angle must be finite, got {}",
            target_angle
        )));
    }
    let spr = geometry.steps_per_revolution()? as i64;
    let step_angle = 360.0 / spr as f64;
    let target_steps = ((target_angle.rem_euclid(360.0) / step_angle).round() as i64) % spr;
    let delta = (target_steps - current_steps as i64).rem_euclid(spr);

    let (steps, direction) = match forced {
        Some(RotationDirection::Clockwise) => (delta, RotationDirection::Clockwise),
        Some(RotationDirection::CounterClockwise) => {
            ((spr - delta) % spr, RotationDirection::CounterClockwise)
        }
        None if delta * 2 > spr => (spr - delta, RotationDirection::CounterClockwise),
        None => (delta, RotationDirection::Clockwise),
    };

    Ok(MovePlan {
        target_steps: target_steps as u32,
        steps: steps as u32,
        direction,
    })
}

/// Mechanically unreachable sector of a dial, between `left_deg` and
/// `right_deg` going counter-clockwise in display angles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForbiddenArc {
    pub left_deg: f64,
    pub right_deg: f64,
}

impl ForbiddenArc {
    pub fn contains(&self, angle: f64) -> bool {
        let angle = angle.rem_euclid(360.0);
        angle >= self.left_deg && angle <= self.right_deg
    }

    /// Direction that reaches `end` from `start` without sweeping the arc.
    /// `None` when both angles coincide.
    pub fn direction_avoiding(&self, start: f64, end: f64) -> Option<RotationDirection> {
        let unwrap = |angle: f64| {
            let angle = angle.rem_euclid(360.0);
            if angle > self.right_deg { angle - 360.0 } else { angle }
        };
        let (s, e) = (unwrap(start), unwrap(end));
        if e > s {
            Some(RotationDirection::Clockwise)
        } else if e < s {
            Some(RotationDirection::CounterClockwise)
        } else {
            None
        }
    }
}

/// Geometry and position as stored on the board
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorStatus {
    pub geometry: MotorGeometry,
    pub position_steps: i64,
}

/// Command surface of the auxiliary motor board
pub trait MotorBoard {
    /// Move and wait for completion. Returns the board's step count.
    fn move_steps(
        &mut self,
        motor: u8,
        speed_code: u32,
        direction: RotationDirection,
        steps: u32,
    ) -> Result<i64, ScanError>;

    fn read_status(&mut self, motor: u8) -> Result<MotorStatus, ScanError>;

    fn write_geometry(&mut self, motor: u8, geometry: &MotorGeometry) -> Result<(), ScanError>;

    fn zero(&mut self, motor: u8) -> Result<(), ScanError>;

    /// Spin continuously until [`MotorBoard::halt`]
    fn run(&mut self, motor: u8, speed_code: u32, direction: RotationDirection)
    -> Result<(), ScanError>;

    fn halt(&mut self, motor: u8) -> Result<(), ScanError>;
}

impl<B: MotorBoard + ?Sized> MotorBoard for Box<B> {
    fn move_steps(
        &mut self,
        motor: u8,
        speed_code: u32,
        direction: RotationDirection,
        steps: u32,
    ) -> Result<i64, ScanError> {
        (**self).move_steps(motor, speed_code, direction, steps)
    }

    fn read_status(&mut self, motor: u8) -> Result<MotorStatus, ScanError> {
        (**self).read_status(motor)
    }

    fn write_geometry(&mut self, motor: u8, geometry: &MotorGeometry) -> Result<(), ScanError> {
        (**self).write_geometry(motor, geometry)
    }

    fn zero(&mut self, motor: u8) -> Result<(), ScanError> {
        (**self).zero(motor)
    }

    fn run(
        &mut self,
        motor: u8,
        speed_code: u32,
        direction: RotationDirection,
    ) -> Result<(), ScanError> {
        (**self).run(motor, speed_code, direction)
    }

    fn halt(&mut self, motor: u8) -> Result<(), ScanError> {
        (**self).halt(motor)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MotorBoardConfig {
    /// Deadline for the `DONE` acknowledgement of a move
    pub done_timeout: Duration,
    /// Backoff while no line is pending
    pub poll_interval: Duration,
    /// Deadline for the reply to `READ`
    pub response_timeout: Duration,
}

impl Default for MotorBoardConfig {
    fn default() -> Self {
        Self {
            done_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            response_timeout: Duration::from_secs(2),
        }
    }
}

/// Motor board speaking newline-terminated ASCII commands
pub struct LineMotorBoard<S> {
    link: LineLink<S>,
    config: MotorBoardConfig,
}

impl<S: Read + Write> LineMotorBoard<S> {
    pub fn new(stream: S, config: MotorBoardConfig) -> Self {
        Self {
            link: LineLink::new(stream, TERMINATOR),
            config,
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.link.get_mut()
    }

    fn await_done(&mut self, motor: u8) -> Result<i64, ScanError> {
        let deadline = Instant::now() + self.config.done_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = self
                .link
                .read_line(remaining, self.config.poll_interval)
                .map_err(|e| match e {
                    ScanError::Timeout(_) => ScanError::Timeout(format!(
                        "Motor {} did not report DONE within {:?}",
                        motor, self.config.done_timeout
                    )),
                    other => other,
                })?;

            match parse_done(&line)? {
                Some((id, count)) if id == motor => return Ok(count),
                Some((id, _)) => debug!("Ignoring DONE for motor {} while waiting for {}", id, motor),
                None => debug!("Ignoring motor board line {:?}", line),
            }
        }
    }
}

/// `DONE <id> <count>`; `None` for any other line
fn parse_done(line: &str) -> Result<Option<(u8, i64)>, ScanError> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("DONE") {
        return Ok(None);
    }
    let malformed = || ScanError::Protocol(format!("Malformed DONE line: '{}'", line));
    let id = parts.next().and_then(|p| p.parse::<u8>().ok()).ok_or_else(malformed)?;
    let count = parts.next().and_then(|p| p.parse::<i64>().ok()).ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(Some((id, count)))
}

/// `gear,full_step,half,position`
fn parse_status(line: &str) -> Result<MotorStatus, ScanError> {
    let malformed = || ScanError::Protocol(format!("Malformed motor status: '{}'", line));
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(malformed());
    }
    let gear_ratio = parts[0].parse::<f64>().map_err(|_| malformed())?;
    let full_step_angle = parts[1].parse::<f64>().map_err(|_| malformed())?;
    let half_step = parts[2].parse::<i32>().map_err(|_| malformed())? != 0;
    let position_steps = parts[3].parse::<i64>().map_err(|_| malformed())?;
    Ok(MotorStatus {
        geometry: MotorGeometry {
            gear_ratio,
            full_step_angle,
            half_step,
        },
        position_steps,
    })
}

impl<S: Read + Write> MotorBoard for LineMotorBoard<S> {
    fn move_steps(
        &mut self,
        motor: u8,
        speed_code: u32,
        direction: RotationDirection,
        steps: u32,
    ) -> Result<i64, ScanError> {
        self.link.write_line(&format!(
            "SET {} {} {} {}",
            motor,
            speed_code,
            u8::from(direction),
            steps
        ))?;
        self.await_done(motor)
    }

    fn read_status(&mut self, motor: u8) -> Result<MotorStatus, ScanError> {
        self.link.write_line(&format!("READ {}", motor))?;
        let line = self
            .link
            .read_line(self.config.response_timeout, self.config.poll_interval)?;
        parse_status(&line)
    }

    fn write_geometry(&mut self, motor: u8, geometry: &MotorGeometry) -> Result<(), ScanError> {
        self.link.write_line(&format!(
            "WRITE {} {} {} {}",
            motor,
            geometry.gear_ratio,
            geometry.full_step_angle,
            u8::from(geometry.half_step)
        ))
    }

    fn zero(&mut self, motor: u8) -> Result<(), ScanError> {
        self.link.write_line(&format!("ZERO {}", motor))
    }

    fn run(
        &mut self,
        motor: u8,
        speed_code: u32,
        direction: RotationDirection,
    ) -> Result<(), ScanError> {
        self.link
            .write_line(&format!("SET {} {} {}", motor, speed_code, u8::from(direction)))?;
        self.link.write_line(&format!("START {}", motor))
    }

    fn halt(&mut self, motor: u8) -> Result<(), ScanError> {
        self.link.write_line(&format!("STOP {}", motor))
    }
}

#[derive(Debug, Default)]
struct SimulatedMotor {
    geometry: MotorGeometry,
    position: i64,
    running: bool,
}

/// In-memory motor board that completes every move immediately.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedMotorBoard {
    motors: Arc<Mutex<HashMap<u8, SimulatedMotor>>>,
}

impl SimulatedMotorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, motor: u8) -> i64 {
        self.motors.lock().get(&motor).map_or(0, |m| m.position)
    }

    pub fn is_running(&self, motor: u8) -> bool {
        self.motors.lock().get(&motor).is_some_and(|m| m.running)
    }
}

impl MotorBoard for SimulatedMotorBoard {
    fn move_steps(
        &mut self,
        motor: u8,
        _speed_code: u32,
        direction: RotationDirection,
        steps: u32,
    ) -> Result<i64, ScanError> {
        let mut motors = self.motors.lock();
        let state = motors.entry(motor).or_default();
        match direction {
            RotationDirection::Clockwise => state.position += steps as i64,
            RotationDirection::CounterClockwise => state.position -= steps as i64,
        }
        Ok(state.position)
    }

    fn read_status(&mut self, motor: u8) -> Result<MotorStatus, ScanError> {
        let mut motors = self.motors.lock();
        let state = motors.entry(motor).or_default();
        Ok(MotorStatus {
            geometry: state.geometry,
            position_steps: state.position,
        })
    }

    fn write_geometry(&mut self, motor: u8, geometry: &MotorGeometry) -> Result<(), ScanError> {
        self.motors.lock().entry(motor).or_default().geometry = *geometry;
        Ok(())
    }

    fn zero(&mut self, motor: u8) -> Result<(), ScanError> {
        self.motors.lock().entry(motor).or_default().position = 0;
        Ok(())
    }

    fn run(
        &mut self,
        motor: u8,
        _speed_code: u32,
        _direction: RotationDirection,
    ) -> Result<(), ScanError> {
        self.motors.lock().entry(motor).or_default().running = true;
        Ok(())
    }

    fn halt(&mut self, motor: u8) -> Result<(), ScanError> {
        self.motors.lock().entry(motor).or_default().running = false;
        Ok(())
    }
}

/// One motor on a board, with its cached step position.
///
/// The cache only changes once the board has acknowledged a move.
pub struct AngularPositioner<B> {
    board: B,
    motor: u8,
    geometry: MotorGeometry,
    speed_code: u32,
    current_steps: u32,
    forbidden: Option<ForbiddenArc>,
}

impl<B: MotorBoard> AngularPositioner<B> {
    pub fn new(
        board: B,
        motor: u8,
        geometry: MotorGeometry,
        speed_percent: f64,
    ) -> Result<Self, ScanError> {
        geometry.steps_per_revolution()?;
        Ok(Self {
            board,
            motor,
            geometry,
            speed_code: map_speed(speed_percent)?,
            current_steps: 0,
            forbidden: None,
        })
    }

    pub fn with_forbidden_arc(mut self, arc: ForbiddenArc) -> Self {
        self.forbidden = Some(arc);
        self
    }

    pub fn motor(&self) -> u8 {
        self.motor
    }

    pub fn forbidden_arc(&self) -> Option<ForbiddenArc> {
        self.forbidden
    }

    pub fn geometry(&self) -> &MotorGeometry {
        &self.geometry
    }

    pub fn current_steps(&self) -> u32 {
        self.current_steps
    }

    pub fn current_angle(&self) -> f64 {
        let spr = self.geometry.steps_per_revolution().unwrap_or(1);
        (self.current_steps % spr) as f64 * 360.0 / spr as f64
    }

    pub fn set_speed(&mut self, percent: f64) -> Result<(), ScanError> {
        self.speed_code = map_speed(percent)?;
        Ok(())
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    /// Move to an absolute angle in degrees.
    ///
    /// Without a forced direction the shorter way round is taken, or the
    /// way that avoids the forbidden arc if one is configured. A target
    /// inside the forbidden arc is refused and the motor stays put.
    pub fn go_to_angle(
        &mut self,
        angle: f64,
        forced: Option<RotationDirection>,
    ) -> Result<MovePlan, ScanError> {
        if let Some(arc) = self.forbidden.filter(|arc| arc.contains(angle)) {
            warn!(
                "Motor {}: {:.2} deg lies in the forbidden arc {:.1}..{:.1} deg",
                self.motor, angle, arc.left_deg, arc.right_deg
            );
            return Err(ScanError::InvalidConfig(format!(
                "Angle {:.2} deg is inside the forbidden arc {:.1}..{:.1} deg of motor {}",
                angle, arc.left_deg, arc.right_deg, self.motor
            )));
        }
        let forced = forced.or_else(|| {
            self.forbidden
                .and_then(|arc| arc.direction_avoiding(self.current_angle(), angle))
        });
        let plan = plan_move(angle, self.current_steps, &self.geometry, forced)?;
        info!(
            "Motor {}: {:.2} deg -> {:.2} deg, {} steps {:?}",
            self.motor,
            self.current_angle(),
            angle,
            plan.steps,
            plan.direction
        );

        if plan.steps > 0 {
            let reported =
                self.board
                    .move_steps(self.motor, self.speed_code, plan.direction, plan.steps)?;
            debug!("Motor {} reports step count {}", self.motor, reported);
        }
        self.current_steps = plan.target_steps;
        Ok(plan)
    }

    /// Toggle a flip mount about `pivot` degrees: moves to `pivot - current`
    pub fn flip(&mut self, pivot: f64) -> Result<MovePlan, ScanError> {
        let target = pivot - self.current_angle();
        self.go_to_angle(target, None)
    }

    /// Declare the current position as zero on the board and locally
    pub fn zero(&mut self) -> Result<(), ScanError> {
        self.board.zero(self.motor)?;
        self.current_steps = 0;
        info!("Motor {} zeroed", self.motor);
        Ok(())
    }

    /// Adopt the geometry and position stored on the board
    pub fn sync(&mut self) -> Result<MotorStatus, ScanError> {
        let status = self.board.read_status(self.motor)?;
        let spr = status.geometry.steps_per_revolution()?;
        self.geometry = status.geometry;
        self.current_steps = status.position_steps.rem_euclid(spr as i64) as u32;
        Ok(status)
    }

    /// Store a new geometry on the board
    pub fn configure(&mut self, geometry: MotorGeometry) -> Result<(), ScanError> {
        let spr = geometry.steps_per_revolution()?;
        self.board.write_geometry(self.motor, &geometry)?;
        if self.current_steps >= spr {
            warn!(
                "Motor {} position {} outside new revolution of {} steps",
                self.motor, self.current_steps, spr
            );
            self.current_steps %= spr;
        }
        self.geometry = geometry;
        Ok(())
    }

    pub fn start_free_run(&mut self, direction: RotationDirection) -> Result<(), ScanError> {
        self.board.run(self.motor, self.speed_code, direction)
    }

    pub fn stop_free_run(&mut self) -> Result<(), ScanError> {
        self.board.halt(self.motor)
    }
}

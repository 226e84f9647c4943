//! Scan sequencing: interleaves stage motion, dwell and acquisition for a
//! full frame and publishes every pixel in raster order.
//!
//! [`ScanSequencer`] runs one pass synchronously on the calling thread.
//! [`ScanController`] is the foreground handle that runs passes on a worker
//! thread and exposes the published grid, an event stream and
//! click-to-move.

use crate::acquisition::AcquisitionClient;
use crate::actuator::Actuator;
use crate::calibration::CalibrationStore;
use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::frame::ScanConfig;
use crate::motion::MoveDecomposer;
use crate::path::{RasterPoint, Transition, ZigZagPath};
use crate::stage::{CursorPosition, PixelSteps, Stage};
use crate::types::{Axis, PixelSample, RowDirection, SampleRecord};
use crate::utils::dwell;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// How a pass ended when no error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

/// Notifications for the display surface, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Started { dimension: usize, frames: u32 },
    Pixel(SampleRecord),
    Cursor(CursorPosition),
    Finished(ScanOutcome),
    Failed(String),
}

/// Published image of the current session
#[derive(Debug, Clone, PartialEq)]
pub struct ScanState {
    pub running: bool,
    pub current_col: i32,
    pub current_row: i32,
    pub grid: Array2<u32>,
}

impl ScanState {
    pub fn new(dimension: usize) -> Self {
        Self {
            running: false,
            current_col: 0,
            current_row: 0,
            grid: Array2::zeros((dimension, dimension)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.grid.nrows()
    }

    /// Discard the grid if `dimension` differs. Returns whether it was replaced.
    pub fn ensure_dimension(&mut self, dimension: usize) -> bool {
        if self.dimension() == dimension {
            return false;
        }
        debug!(
            "Grid dimension changed {} -> {}, discarding contents",
            self.dimension(),
            dimension
        );
        *self = Self::new(dimension);
        true
    }

    /// Fresh zeroed grid for a new pass
    pub fn reset(&mut self, dimension: usize) {
        *self = Self::new(dimension);
    }

    pub fn record(&mut self, sample: &PixelSample) {
        self.current_col = sample.col;
        self.current_row = sample.row;
        if let Some(cell) = self
            .grid
            .get_mut((sample.row as usize, sample.col as usize))
        {
            *cell = sample.count;
        }
    }
}

impl Default for ScanState {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One synchronous scan pass over a borrowed stage and acquisition link
pub struct ScanSequencer<'a, A, S> {
    stage: &'a mut Stage<A>,
    acquisition: &'a mut AcquisitionClient<S>,
    calibration: &'a CalibrationStore,
    state: &'a RwLock<ScanState>,
    events: &'a Sender<ScanEvent>,
    cancel: &'a CancellationToken,
    /// Set when the acquisition link itself failed, not the stage
    link_lost: bool,
}

impl<'a, A: Actuator, S: Read + Write> ScanSequencer<'a, A, S> {
    pub fn new(
        stage: &'a mut Stage<A>,
        acquisition: &'a mut AcquisitionClient<S>,
        calibration: &'a CalibrationStore,
        state: &'a RwLock<ScanState>,
        events: &'a Sender<ScanEvent>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            stage,
            acquisition,
            calibration,
            state,
            events,
            cancel,
            link_lost: false,
        }
    }

    /// Run `config.frames` frames.
    ///
    /// Configuration errors are returned before anything is sent to the
    /// hardware. Any I/O or actuator failure ends the pass; the stage is
    /// handed back to local mode and the acquisition is disarmed unless its
    /// own link is gone, in which case it is closed.
    pub fn run(&mut self, config: &ScanConfig) -> Result<ScanOutcome, ScanError> {
        config.validate()?;
        let dimension = config.grid_dimension()?;
        self.calibration.set_rotation(config.rotation_degrees)?;
        PixelSteps::new(&self.calibration.snapshot(), config.pixel_step)?;

        {
            let mut state = self.state.write();
            state.reset(dimension);
            state.running = true;
        }
        self.link_lost = false;
        info!(
            "Starting scan: {}x{} pixels, {} frame(s), dwell {} ms",
            dimension, dimension, config.frames, config.dwell_millis
        );
        self.publish(ScanEvent::Started {
            dimension,
            frames: config.frames,
        });

        let result = self.acquire(config, dimension);
        self.wind_down(&result);

        match &result {
            Ok(outcome) => {
                info!("Scan finished: {:?}", outcome);
                self.publish(ScanEvent::Finished(*outcome));
            }
            Err(e) => {
                error!("Scan aborted: {}", e);
                self.publish(ScanEvent::Failed(e.to_string()));
            }
        }
        result
    }

    fn acquire(&mut self, config: &ScanConfig, dimension: usize) -> Result<ScanOutcome, ScanError> {
        self.stage.engage()?;
        let amplitudes = self.calibration.snapshot().step_amplitudes;
        self.stage.push_amplitudes(&amplitudes)?;
        let armed = self.acquisition.arm(config.dwell_millis, config.settle());
        self.check_link(armed)?;

        let path = ZigZagPath::new(dimension);
        for frame in 0..config.frames {
            for point in path.iter() {
                if self.cancel.is_cancelled() {
                    info!(
                        "Scan cancelled before frame {} {}",
                        frame,
                        match point.transition {
                            Transition::FrameStart => "start".to_string(),
                            Transition::RowAdvance => format!("row {}", point.row),
                            Transition::ColumnStep => format!("pixel ({}, {})", point.col, point.row),
                        }
                    );
                    return Ok(ScanOutcome::Cancelled);
                }

                if !self.move_to(&point, frame, config)? {
                    info!("Scan cancelled while positioning frame {}", frame);
                    return Ok(ScanOutcome::Cancelled);
                }

                dwell(config.dwell());
                let count = self.acquisition.sample();
                let count = self.check_link(count)?;
                self.record(frame, PixelSample::new(point.col, point.row, count));
            }

            let (col, row) = self.stage.index();
            self.publish(ScanEvent::Cursor(CursorPosition::new(
                col,
                row,
                dimension,
                config.pixel_step,
            )));
            debug!("Frame {} complete", frame);
        }
        Ok(ScanOutcome::Completed)
    }

    /// Bring the stage onto `point`. Returns `false` if a decomposed
    /// positioning move was cancelled part way.
    fn move_to(
        &mut self,
        point: &RasterPoint,
        frame: u32,
        config: &ScanConfig,
    ) -> Result<bool, ScanError> {
        // Fresh snapshot per move: rotation and skew may change mid-scan
        let calibration = self.calibration.snapshot();
        let steps = PixelSteps::new(&calibration, config.pixel_step)?;

        match point.transition {
            Transition::FrameStart if frame == 0 => {
                let half = config.frame_size / 2.0;
                let mx = calibration.distance_to_steps_exact(Axis::Horizontal, config.offset_x - half);
                let my = calibration.distance_to_steps_exact(Axis::Vertical, half - config.offset_y);
                let vector = calibration.apply_skew_and_rotation(-mx, my);
                debug!(
                    "Positioning to frame corner: {:.2}, {:.2} steps",
                    vector.0, vector.1
                );
                let (horizontal, vertical) =
                    MoveDecomposer::new(self.stage.actuator_mut(), config.dwell())
                        .with_cancellation(self.cancel)
                        .move_vector(vector, (steps.x, steps.y))?;
                if horizontal.cancelled || vertical.cancelled {
                    return Ok(false);
                }
            }
            Transition::FrameStart => {
                let (horizontal, vertical) = self.stage.travel_to_pixel(
                    point.col,
                    point.row,
                    &calibration,
                    config.pixel_step,
                    config.dwell(),
                    Some(self.cancel),
                )?;
                if horizontal.cancelled || vertical.cancelled {
                    return Ok(false);
                }
            }
            Transition::RowAdvance => {
                let (_, sy) = calibration.apply_skew_and_rotation(0.0, -(steps.y as f64));
                MoveDecomposer::new(self.stage.actuator_mut(), config.dwell())
                    .single(Axis::Vertical, sy.round() as i64)?;
            }
            Transition::ColumnStep => {
                let dx = match point.direction {
                    RowDirection::LeftToRight => -(steps.x as f64),
                    RowDirection::RightToLeft => steps.x as f64,
                };
                let (sx, _) = calibration.apply_skew_and_rotation(dx, 0.0);
                MoveDecomposer::new(self.stage.actuator_mut(), config.dwell())
                    .single(Axis::Horizontal, sx.round() as i64)?;
            }
        }

        self.stage.set_index(point.col, point.row);
        Ok(true)
    }

    fn record(&mut self, frame: u32, sample: PixelSample) {
        self.state.write().record(&sample);
        self.publish(ScanEvent::Pixel(SampleRecord {
            timestamp: Utc::now(),
            frame,
            sample,
        }));
    }

    /// Note a connection-class failure of the acquisition link
    fn check_link<T>(&mut self, result: Result<T, ScanError>) -> Result<T, ScanError> {
        if let Err(e) = &result {
            self.link_lost |= e.is_connection_error();
        }
        result
    }

    fn wind_down(&mut self, result: &Result<ScanOutcome, ScanError>) {
        if self.link_lost {
            warn!("Acquisition link lost, closing without disarm");
            self.acquisition.close();
        } else {
            if let Err(e) = result {
                debug!("Disarming after failure elsewhere: {}", e);
            }
            self.acquisition.disarm();
        }
        if let Err(e) = self.stage.release() {
            warn!("Failed to return stage to local mode: {}", e);
        }
        self.state.write().running = false;
    }

    fn publish(&self, event: ScanEvent) {
        if self.events.send(event).is_err() {
            debug!("No scan event listeners left");
        }
    }
}

/// Foreground handle that runs scan passes on a worker thread.
///
/// The worker owns the stage and the acquisition link for the duration of
/// a pass; the foreground only reads the published state and sends
/// start/stop/move requests, none of which block on hardware I/O while a
/// scan runs.
pub struct ScanController<A: Actuator + Send + 'static> {
    stage: Arc<Mutex<Stage<A>>>,
    acquisition: Arc<Mutex<AcquisitionClient<TcpStream>>>,
    calibration: Arc<CalibrationStore>,
    state: Arc<RwLock<ScanState>>,
    config: ScanConfig,
    events_tx: Sender<ScanEvent>,
    events_rx: Receiver<ScanEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<Result<ScanOutcome, ScanError>>>,
}

impl<A: Actuator + Send + 'static> ScanController<A> {
    pub fn new(
        stage: Stage<A>,
        acquisition: AcquisitionClient<TcpStream>,
        calibration: Arc<CalibrationStore>,
        config: ScanConfig,
    ) -> Self {
        let dimension = config.grid_dimension().unwrap_or(0);
        let (events_tx, events_rx) = unbounded();
        Self {
            stage: Arc::new(Mutex::new(stage)),
            acquisition: Arc::new(Mutex::new(acquisition)),
            calibration,
            state: Arc::new(RwLock::new(ScanState::new(dimension))),
            config,
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Replace the configuration used by the next pass and by click-to-move.
    /// The published grid is discarded if the dimension changes while idle.
    pub fn set_config(&mut self, config: ScanConfig) -> Result<(), ScanError> {
        config.validate()?;
        let dimension = config.grid_dimension()?;
        {
            let mut state = self.state.write();
            if !state.running {
                state.ensure_dimension(dimension);
            }
        }
        self.config = config;
        Ok(())
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    /// Receiver for scan events; every clone sees each event once
    pub fn events(&self) -> Receiver<ScanEvent> {
        self.events_rx.clone()
    }

    /// Snapshot of the published grid and cursor
    pub fn grid(&self) -> ScanState {
        self.state.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start a pass on the worker thread with the current configuration
    pub fn start(&mut self) -> Result<(), ScanError> {
        if self.is_running() {
            return Err(ScanError::InvalidState(
                "A scan is already running".to_string(),
            ));
        }
        if self.worker.is_some() {
            // Previous pass already reported through its events
            let _ = self.join();
        }
        self.config.validate()?;

        self.cancel = CancellationToken::new();
        let stage = self.stage.clone();
        let acquisition = self.acquisition.clone();
        let calibration = self.calibration.clone();
        let state = self.state.clone();
        let events = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let config = self.config.clone();

        let handle = thread::spawn(move || -> Result<ScanOutcome, ScanError> {
            let mut stage = stage.lock();
            let mut acquisition = acquisition.lock();
            if let Err(e) = acquisition.connect() {
                error!("Cannot reach acquisition server: {}", e);
                let _ = events.send(ScanEvent::Failed(e.to_string()));
                return Err(e);
            }
            ScanSequencer::new(
                &mut stage,
                &mut acquisition,
                &calibration,
                &state,
                &events,
                &cancel,
            )
            .run(&config)
        });
        self.worker = Some(handle);
        Ok(())
    }

    /// Request cooperative cancellation of the running pass
    pub fn stop(&self) {
        if self.is_running() {
            info!("Stop requested");
        }
        self.cancel.cancel();
    }

    /// Wait for the current pass and return its result
    pub fn join(&mut self) -> Result<ScanOutcome, ScanError> {
        let handle = self
            .worker
            .take()
            .ok_or_else(|| ScanError::InvalidState("No scan has been started".to_string()))?;
        handle
            .join()
            .map_err(|_| ScanError::InvalidState("Scan worker panicked".to_string()))?
    }

    /// Click-to-move to the pixel under a fractional display coordinate.
    ///
    /// Rejected while a scan owns the stage.
    pub fn move_to_pixel(&self, fx: f64, fy: f64) -> Result<(i32, i32), ScanError> {
        if self.is_running() {
            return Err(ScanError::InvalidState(
                "Cannot move the stage while a scan is running".to_string(),
            ));
        }
        let mut stage = self.stage.try_lock().ok_or_else(|| {
            ScanError::InvalidState("Stage is busy".to_string())
        })?;

        let dimension = self.config.grid_dimension()?;
        let (col, row) = Stage::<A>::pixel_at(fx, fy, dimension);
        let calibration = self.calibration.snapshot();
        stage.move_to_pixel(col, row, &calibration, self.config.pixel_step, self.config.dwell())?;

        let cursor = CursorPosition::new(col, row, dimension, self.config.pixel_step);
        {
            let mut state = self.state.write();
            state.current_col = col;
            state.current_row = row;
        }
        let _ = self.events_tx.send(ScanEvent::Cursor(cursor));
        Ok((col, row))
    }

    /// Run `f` against the stage while no scan holds it
    pub fn with_stage<T>(
        &self,
        f: impl FnOnce(&mut Stage<A>) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        let mut stage = self
            .stage
            .try_lock()
            .ok_or_else(|| ScanError::InvalidState("Stage is busy".to_string()))?;
        f(&mut stage)
    }
}

impl<A: Actuator + Send + 'static> Drop for ScanController<A> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorCommand, SimulatedStage};
    use crate::calibration::CalibrationParameters;
    use crate::acquisition::AcquisitionState;
    use crate::sim::CounterServer;
    use crate::testing::ScriptedStream;
    use std::time::Duration;

    fn fast_config(frame_size: f64) -> ScanConfig {
        ScanConfig {
            frame_size,
            pixel_step: 0.5,
            dwell_millis: 0,
            ..Default::default()
        }
    }

    fn store() -> CalibrationStore {
        CalibrationStore::new(CalibrationParameters::new(0.1, 0.1).unwrap()).unwrap()
    }

    struct Rig {
        server: CounterServer,
        sim: SimulatedStage,
        stage: Stage<SimulatedStage>,
        acquisition: AcquisitionClient,
        calibration: CalibrationStore,
        state: RwLock<ScanState>,
        events: (Sender<ScanEvent>, Receiver<ScanEvent>),
    }

    impl Rig {
        fn new(source: crate::sim::CountSource) -> Self {
            let server = CounterServer::spawn(source).unwrap();
            let mut acquisition = AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
            acquisition.connect().unwrap();
            let sim = SimulatedStage::new();
            Self {
                server,
                stage: Stage::new(sim.clone(), 1),
                sim,
                acquisition,
                calibration: store(),
                state: RwLock::new(ScanState::default()),
                events: unbounded(),
            }
        }

        fn run(&mut self, config: &ScanConfig, cancel: &CancellationToken) -> Result<ScanOutcome, ScanError> {
            ScanSequencer::new(
                &mut self.stage,
                &mut self.acquisition,
                &self.calibration,
                &self.state,
                &self.events.0,
                cancel,
            )
            .run(config)
        }

        fn pixels(&self) -> Vec<PixelSample> {
            self.events
                .1
                .try_iter()
                .filter_map(|e| match e {
                    ScanEvent::Pixel(record) => Some(record.sample),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_full_pass_publishes_in_raster_order() {
        let mut rig = Rig::new(Box::new(|n| Some(n as u32 + 1)));
        let outcome = rig.run(&fast_config(1.5), &CancellationToken::new()).unwrap();
        assert_eq!(outcome, ScanOutcome::Completed);

        let pixels = rig.pixels();
        let expected: Vec<(i32, i32)> = ZigZagPath::new(3).iter().map(|p| (p.col, p.row)).collect();
        let got: Vec<(i32, i32)> = pixels.iter().map(|p| (p.col, p.row)).collect();
        assert_eq!(got, expected);
        assert_eq!(
            pixels.iter().map(|p| p.count).collect::<Vec<_>>(),
            (1..=9).collect::<Vec<u32>>()
        );

        let state = rig.state.read();
        assert!(!state.running);
        assert_eq!(state.grid[[0, 0]], 1);
        assert_eq!(state.grid[[1, 2]], 4);
        assert_eq!(state.grid[[2, 2]], 9);
        assert_eq!(rig.server.bin_width(), 0);
        assert!(!rig.sim.is_remote());
    }

    #[test]
    fn test_motion_sequence_for_two_by_two() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        rig.run(&fast_config(1.0), &CancellationToken::new()).unwrap();

        // Pixel step 0.5 / 0.1 per step = 5 steps; frame corner is 5 steps away
        assert_eq!(
            rig.sim.moves(),
            vec![
                (Axis::Horizontal, 5),
                (Axis::Vertical, 5),
                (Axis::Horizontal, -5),
                (Axis::Vertical, -5),
                (Axis::Horizontal, 5),
            ]
        );
        assert_eq!(rig.stage.index(), (0, 1));
    }

    #[test]
    fn test_amplitudes_pushed_before_first_move() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        rig.run(&fast_config(0.5), &CancellationToken::new()).unwrap();
        let commands = rig.sim.commands();
        let first_move = commands
            .iter()
            .position(|c| matches!(c, ActuatorCommand::RelativeMove(..)))
            .unwrap_or(commands.len());
        let amplitudes = commands[..first_move]
            .iter()
            .filter(|c| matches!(c, ActuatorCommand::StepAmplitude(..)))
            .count();
        assert_eq!(amplitudes, 4);
    }

    #[test]
    fn test_cancel_mid_row_stops_motion_after_sample() {
        let cancel = CancellationToken::new();
        let observed = Arc::new(Mutex::new(None));
        let sim = SimulatedStage::new();

        let source = {
            let cancel = cancel.clone();
            let observed = observed.clone();
            let sim = sim.clone();
            Box::new(move |n: u64| {
                if n == 4 {
                    *observed.lock() = Some(sim.moves().len());
                    cancel.cancel();
                }
                Some(100 + n as u32)
            })
        };
        let mut rig = Rig::new(source);
        rig.stage = Stage::new(sim.clone(), 1);
        rig.sim = sim;

        let outcome = rig.run(&fast_config(1.5), &cancel).unwrap();
        assert_eq!(outcome, ScanOutcome::Cancelled);

        let moves_at_cancel = observed.lock().expect("cancel point reached");
        assert_eq!(rig.sim.moves().len(), moves_at_cancel);

        let pixels = rig.pixels();
        assert_eq!(pixels.len(), 5);
        let state = rig.state.read();
        assert_eq!(state.grid.iter().filter(|&&c| c != 0).count(), 5);
        // Fifth pixel in zig-zag order is (1, 1)
        assert_eq!(state.grid[[1, 1]], 104);
        assert_eq!(state.grid[[2, 0]], 0);
        assert!(!state.running);
    }

    #[test]
    fn test_cancel_before_start_issues_no_moves() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(rig.run(&fast_config(1.0), &cancel).unwrap(), ScanOutcome::Cancelled);
        assert!(rig.sim.moves().is_empty());
    }

    #[test]
    fn test_actuator_failure_aborts_pass() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        let sim = SimulatedStage::new().reject_moves_from(3);
        rig.stage = Stage::new(sim.clone(), 1);

        let result = rig.run(&fast_config(1.5), &CancellationToken::new());
        assert!(matches!(result, Err(ScanError::Actuator { .. })));
        assert!(!sim.is_remote());
        assert!(
            rig.events
                .1
                .try_iter()
                .any(|e| matches!(e, ScanEvent::Failed(_)))
        );
        assert!(!rig.state.read().running);
    }

    #[test]
    fn test_broken_link_closes_acquisition() {
        let mut rig = Rig::new(Box::new(|n| if n < 2 { Some(9) } else { None }));
        let result = rig.run(&fast_config(1.5), &CancellationToken::new());
        assert!(matches!(result, Err(ScanError::ConnectionBroken { .. })));
        assert!(!rig.acquisition.is_connected());
        assert_eq!(rig.pixels().len(), 2);
    }

    /// Stage whose serial link never answers a move
    struct SilentStage;

    impl Actuator for SilentStage {
        fn set_remote_mode(&mut self) -> Result<(), ScanError> {
            Ok(())
        }

        fn set_local_mode(&mut self) -> Result<(), ScanError> {
            Ok(())
        }

        fn set_channel(&mut self, _channel: u8) -> Result<(), ScanError> {
            Ok(())
        }

        fn set_step_amplitude(
            &mut self,
            _direction: crate::types::JogDirection,
            _amplitude: u8,
        ) -> Result<bool, ScanError> {
            Ok(true)
        }

        fn relative_move(&mut self, _axis: Axis, _steps: i64) -> Result<bool, ScanError> {
            Err(ScanError::Timeout("No response line".to_string()))
        }
    }

    #[test]
    fn test_stage_timeout_still_disarms_acquisition() {
        let mut stage = Stage::new(SilentStage, 1);
        let stream = ScriptedStream::new(vec![b"OK".to_vec(), b"OK".to_vec()]);
        let mut acquisition = AcquisitionClient::from_stream(stream);
        let calibration = store();
        let state = RwLock::new(ScanState::default());
        let (tx, _rx) = unbounded();
        let cancel = CancellationToken::new();

        let result = ScanSequencer::new(
            &mut stage,
            &mut acquisition,
            &calibration,
            &state,
            &tx,
            &cancel,
        )
        .run(&fast_config(1.0));

        assert!(matches!(result, Err(ScanError::Timeout(_))));
        assert!(acquisition.is_connected());
        assert_eq!(acquisition.state(), AcquisitionState::Disarmed);
        assert_eq!(acquisition.get_ref().unwrap().written(), b"M0MS");
        assert!(!state.read().running);
    }

    #[test]
    fn test_invalid_config_rejected_before_hardware() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        let config = ScanConfig {
            pixel_step: 0.0,
            ..fast_config(1.0)
        };
        assert!(matches!(
            rig.run(&config, &CancellationToken::new()),
            Err(ScanError::InvalidConfig(_))
        ));
        assert!(rig.sim.commands().is_empty());
    }

    #[test]
    fn test_repeated_frames_return_to_corner() {
        let mut rig = Rig::new(Box::new(|_| Some(1)));
        let config = ScanConfig {
            frames: 2,
            ..fast_config(1.0)
        };
        rig.run(&config, &CancellationToken::new()).unwrap();
        assert_eq!(rig.pixels().len(), 8);
        // Second frame ends where the first did
        assert_eq!(rig.stage.index(), (0, 1));
        assert_eq!(rig.sim.position(), (5, 0));
    }

    #[test]
    fn test_scan_state_replaced_on_dimension_change() {
        let mut state = ScanState::new(2);
        state.record(&PixelSample::new(1, 1, 7));
        assert!(!state.ensure_dimension(2));
        assert_eq!(state.grid[[1, 1]], 7);
        assert!(state.ensure_dimension(3));
        assert_eq!(state.grid.dim(), (3, 3));
        assert!(state.grid.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_controller_runs_and_rejects_moves_while_busy() {
        let server = CounterServer::spawn(Box::new(|_| Some(3))).unwrap();
        let acquisition = AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
        let sim = SimulatedStage::new();
        let config = ScanConfig {
            dwell_millis: 5,
            settle_factor: 0,
            ..fast_config(2.0)
        };
        let mut controller = ScanController::new(
            Stage::new(sim.clone(), 1),
            acquisition,
            Arc::new(store()),
            config,
        );
        let events = controller.events();

        controller.start().unwrap();
        assert!(matches!(controller.start(), Err(ScanError::InvalidState(_))));
        assert!(matches!(
            controller.move_to_pixel(0.0, 0.0),
            Err(ScanError::InvalidState(_))
        ));

        assert_eq!(controller.join().unwrap(), ScanOutcome::Completed);
        let grid = controller.grid();
        assert!(grid.grid.iter().all(|&c| c == 3));

        let finished = events
            .try_iter()
            .any(|e| e == ScanEvent::Finished(ScanOutcome::Completed));
        assert!(finished);

        let pixel = controller.move_to_pixel(0.2, 3.7).unwrap();
        assert_eq!(pixel, (0, 3));
        assert_eq!(controller.grid().current_row, 3);
    }

    #[test]
    fn test_controller_stop() {
        let server = CounterServer::spawn(Box::new(|_| Some(1))).unwrap();
        let acquisition = AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
        let config = ScanConfig {
            dwell_millis: 20,
            settle_factor: 0,
            ..fast_config(10.0)
        };
        let mut controller = ScanController::new(
            Stage::new(SimulatedStage::new(), 1),
            acquisition,
            Arc::new(store()),
            config,
        );
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        controller.stop();
        assert_eq!(controller.join().unwrap(), ScanOutcome::Cancelled);
        assert!(!controller.grid().running);
    }
}

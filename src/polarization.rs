//! Polarisation sweep: turn a polariser through one full revolution and
//! record a count at every angle step.
//!
//! The sweep starts wherever the motor currently stands and ends one turn
//! later, so the first and last points look through the same orientation.

use crate::acquisition::AcquisitionClient;
use crate::angular::{AngularPositioner, MotorBoard};
use crate::cancel::CancellationToken;
use crate::error::ScanError;
use crate::utils::dwell;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

const TSV_HEADER: [&str; 4] = ["angle_deg", "count", "normalized", "relative"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarizationConfig {
    /// Angle increment in degrees
    pub step_deg: f64,
    /// Counter bin width, also the dwell after each move
    pub dwell_millis: u32,
    /// Wait after arming before the first move
    pub settle_millis: u64,
}

impl Default for PolarizationConfig {
    fn default() -> Self {
        Self {
            step_deg: 5.0,
            dwell_millis: 100,
            settle_millis: 1000,
        }
    }
}

impl PolarizationConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !self.step_deg.is_finite() || self.step_deg <= 0.0 || self.step_deg > 360.0 {
            return Err(ScanError::InvalidConfig(format!(
                "Polarisation step must be in (0, 360] deg, got {}",
                self.step_deg
            )));
        }
        Ok(())
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_millis as u64)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    /// Offsets from the start angle covering `0..=360` inclusive.
    /// Only meaningful once [`validate`](Self::validate) passed.
    fn offsets(&self) -> impl Iterator<Item = f64> {
        let step = self.step_deg;
        let last = (360.0 / step + 1e-9).floor() as usize;
        (0..=last).map(move |i| i as f64 * step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarizationPoint {
    /// Unwrapped angle, start angle plus offset
    pub angle_deg: f64,
    pub count: u32,
}

/// Angle/count series of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolarizationSeries {
    pub points: Vec<PolarizationPoint>,
    /// Stopped before the full turn
    pub cancelled: bool,
}

impl PolarizationSeries {
    pub fn counts(&self) -> Vec<u32> {
        self.points.iter().map(|p| p.count).collect()
    }

    /// `(I - min) / (max - min)`, all ones for a flat series
    pub fn normalized(&self) -> Vec<f64> {
        let counts = self.counts();
        let (Some(&min), Some(&max)) = (counts.iter().min(), counts.iter().max()) else {
            return Vec::new();
        };
        if max == min {
            return vec![1.0; counts.len()];
        }
        let range = (max - min) as f64;
        counts.iter().map(|&c| (c - min) as f64 / range).collect()
    }

    /// `I / max`, all zeros when nothing was counted
    pub fn relative(&self) -> Vec<f64> {
        let counts = self.counts();
        let max = counts.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return vec![0.0; counts.len()];
        }
        counts.iter().map(|&c| c as f64 / max as f64).collect()
    }

    /// Tab-separated with a header line: angle, raw count, min-max and
    /// max-relative intensity
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), ScanError> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_writer(writer);

        wtr.write_record(TSV_HEADER)?;
        for ((point, norm), rel) in self
            .points
            .iter()
            .zip(self.normalized())
            .zip(self.relative())
        {
            wtr.write_record([
                format!("{:.2}", point.angle_deg),
                point.count.to_string(),
                format!("{:.4}", norm),
                format!("{:.4}", rel),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn save_tsv<P: AsRef<Path>>(&self, path: P) -> Result<(), ScanError> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| ScanError::io(e, format!("Creating {}", path.display())))?;
        self.write_tsv(file)?;
        info!("Saved {} polarisation points to {}", self.points.len(), path.display());
        Ok(())
    }
}

/// Drives one motor and the counter through a sweep on the calling thread
pub struct PolarizationSweep<'a, B, S> {
    positioner: &'a mut AngularPositioner<B>,
    acquisition: &'a mut AcquisitionClient<S>,
    cancel: &'a CancellationToken,
    link_lost: bool,
}

impl<'a, B: MotorBoard, S: Read + Write> PolarizationSweep<'a, B, S> {
    pub fn new(
        positioner: &'a mut AngularPositioner<B>,
        acquisition: &'a mut AcquisitionClient<S>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            positioner,
            acquisition,
            cancel,
            link_lost: false,
        }
    }

    /// Arm the counter, sweep one turn and disarm. Angles inside the
    /// motor's forbidden arc are skipped. Cancellation ends the sweep
    /// between points and returns what was recorded so far.
    pub fn run(&mut self, config: &PolarizationConfig) -> Result<PolarizationSeries, ScanError> {
        config.validate()?;
        self.link_lost = false;

        let start = self.positioner.current_angle();
        info!(
            "Polarisation sweep on motor {}: {:.2} -> {:.2} deg in {} deg steps",
            self.positioner.motor(),
            start,
            start + 360.0,
            config.step_deg
        );

        let mut series = PolarizationSeries::default();
        let result = self.sweep(config, start, &mut series);

        if self.link_lost {
            warn!("Acquisition link lost, closing without disarm");
            self.acquisition.close();
        } else {
            self.acquisition.disarm();
        }

        match result {
            Ok(()) => {
                info!(
                    "Polarisation sweep {} with {} points",
                    if series.cancelled { "cancelled" } else { "finished" },
                    series.points.len()
                );
                Ok(series)
            }
            Err(e) => {
                warn!("Polarisation sweep failed after {} points: {}", series.points.len(), e);
                Err(e)
            }
        }
    }

    fn sweep(
        &mut self,
        config: &PolarizationConfig,
        start: f64,
        series: &mut PolarizationSeries,
    ) -> Result<(), ScanError> {
        let armed = self.acquisition.arm(config.dwell_millis, config.settle());
        self.check_link(armed)?;

        for offset in config.offsets() {
            if self.cancel.is_cancelled() {
                series.cancelled = true;
                return Ok(());
            }

            let angle = start + offset;
            let target = angle.rem_euclid(360.0);
            if self
                .positioner
                .forbidden_arc()
                .is_some_and(|arc| arc.contains(target))
            {
                debug!("Skipping {:.2} deg, inside the forbidden arc", target);
                continue;
            }

            self.positioner.go_to_angle(target, None)?;
            dwell(config.dwell());
            let count = self.acquisition.sample();
            let count = self.check_link(count)?;
            debug!("{:.2} deg: {}", angle, count);
            series.points.push(PolarizationPoint {
                angle_deg: angle,
                count,
            });
        }
        Ok(())
    }

    fn check_link<T>(&mut self, result: Result<T, ScanError>) -> Result<T, ScanError> {
        if let Err(e) = &result {
            self.link_lost |= e.is_connection_error();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionState;
    use crate::angular::{
        ForbiddenArc, LineMotorBoard, MotorBoardConfig, MotorGeometry, SimulatedMotorBoard,
    };
    use crate::sim::{CounterServer, malus_law};
    use crate::testing::ScriptedStream;
    use std::net::TcpStream;

    const POLARISER: u8 = 4;

    fn quarter_turns() -> PolarizationConfig {
        PolarizationConfig {
            step_deg: 90.0,
            dwell_millis: 0,
            settle_millis: 0,
        }
    }

    fn series(counts: &[u32]) -> PolarizationSeries {
        PolarizationSeries {
            points: counts
                .iter()
                .enumerate()
                .map(|(i, &count)| PolarizationPoint {
                    angle_deg: i as f64 * 90.0,
                    count,
                })
                .collect(),
            cancelled: false,
        }
    }

    struct Rig {
        board: SimulatedMotorBoard,
        _server: CounterServer,
        acquisition: AcquisitionClient<TcpStream>,
    }

    impl Rig {
        fn new() -> Self {
            let board = SimulatedMotorBoard::new();
            let server =
                CounterServer::spawn(malus_law(board.clone(), POLARISER, 200, 1000, 20)).unwrap();
            let mut acquisition =
                AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
            acquisition.connect().unwrap();
            Self {
                board,
                _server: server,
                acquisition,
            }
        }

        fn positioner(&self) -> AngularPositioner<SimulatedMotorBoard> {
            AngularPositioner::new(self.board.clone(), POLARISER, MotorGeometry::default(), 50.0)
                .unwrap()
        }
    }

    #[test]
    fn test_offsets_cover_full_turn() {
        let offsets: Vec<f64> = quarter_turns().offsets().collect();
        assert_eq!(offsets, vec![0.0, 90.0, 180.0, 270.0, 360.0]);

        let config = PolarizationConfig {
            step_deg: 7.0,
            ..quarter_turns()
        };
        assert_eq!(config.offsets().count(), 52);
        assert_eq!(config.offsets().last(), Some(357.0));
    }

    #[test]
    fn test_rejects_bad_step() {
        for step_deg in [0.0, -5.0, f64::NAN, f64::INFINITY, 400.0] {
            let config = PolarizationConfig {
                step_deg,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));
        }
        PolarizationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_sweep_follows_malus_law() {
        let mut rig = Rig::new();
        let mut positioner = rig.positioner();
        let cancel = CancellationToken::new();

        let result = PolarizationSweep::new(&mut positioner, &mut rig.acquisition, &cancel)
            .run(&quarter_turns())
            .unwrap();

        assert!(!result.cancelled);
        let angles: Vec<f64> = result.points.iter().map(|p| p.angle_deg).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 270.0, 360.0]);
        assert_eq!(result.counts(), vec![1020, 20, 1020, 20, 1020]);
        assert_eq!(result.normalized(), vec![1.0, 0.0, 1.0, 0.0, 1.0]);

        assert_eq!(rig.board.position(POLARISER), 200);
        assert_eq!(positioner.current_angle(), 0.0);
        assert_eq!(rig.acquisition.state(), AcquisitionState::Disarmed);
    }

    #[test]
    fn test_sweep_starts_from_current_angle() {
        let mut rig = Rig::new();
        let mut positioner = rig.positioner();
        positioner.go_to_angle(90.0, None).unwrap();
        let cancel = CancellationToken::new();

        let result = PolarizationSweep::new(&mut positioner, &mut rig.acquisition, &cancel)
            .run(&quarter_turns())
            .unwrap();

        assert_eq!(result.points.first().map(|p| p.angle_deg), Some(90.0));
        assert_eq!(result.points.last().map(|p| p.angle_deg), Some(450.0));
        assert_eq!(result.counts(), vec![20, 1020, 20, 1020, 20]);
    }

    #[test]
    fn test_sweep_skips_forbidden_arc() {
        let mut rig = Rig::new();
        let mut positioner = rig
            .positioner()
            .with_forbidden_arc(ForbiddenArc { left_deg: 205.0, right_deg: 290.0 });
        let cancel = CancellationToken::new();

        let result = PolarizationSweep::new(&mut positioner, &mut rig.acquisition, &cancel)
            .run(&quarter_turns())
            .unwrap();

        let angles: Vec<f64> = result.points.iter().map(|p| p.angle_deg).collect();
        assert_eq!(angles, vec![0.0, 90.0, 180.0, 360.0]);
        assert_eq!(rig.board.position(POLARISER), 0);
    }

    #[test]
    fn test_cancel_keeps_recorded_points() {
        let board = SimulatedMotorBoard::new();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let server = CounterServer::spawn(Box::new(move |n| {
            if n == 1 {
                cancel_clone.cancel();
            }
            Some(100 + n as u32)
        }))
        .unwrap();
        let mut acquisition = AcquisitionClient::new("127.0.0.1", server.addr().port()).unwrap();
        acquisition.connect().unwrap();
        let mut positioner =
            AngularPositioner::new(board, POLARISER, MotorGeometry::default(), 50.0).unwrap();

        let result = PolarizationSweep::new(&mut positioner, &mut acquisition, &cancel)
            .run(&quarter_turns())
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.counts(), vec![100, 101]);
        assert_eq!(acquisition.state(), AcquisitionState::Disarmed);
    }

    #[test]
    fn test_motor_timeout_still_disarms() {
        let config = MotorBoardConfig {
            done_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            response_timeout: Duration::from_millis(20),
        };
        let board = LineMotorBoard::new(ScriptedStream::new(vec![]).pending_when_drained(), config);
        let mut positioner =
            AngularPositioner::new(board, POLARISER, MotorGeometry::default(), 50.0).unwrap();
        let stream = ScriptedStream::new(vec![b"OK".to_vec(), vec![0, 0, 0, 9], b"OK".to_vec()]);
        let mut acquisition = AcquisitionClient::from_stream(stream);
        let cancel = CancellationToken::new();

        let result =
            PolarizationSweep::new(&mut positioner, &mut acquisition, &cancel).run(&quarter_turns());

        assert!(result.is_err());
        assert!(acquisition.is_connected());
        assert_eq!(acquisition.state(), AcquisitionState::Disarmed);
        assert_eq!(acquisition.get_ref().unwrap().written(), b"M0MDS");
    }

    #[test]
    fn test_normalisation() {
        let s = series(&[10, 30, 20]);
        assert_eq!(s.normalized(), vec![0.0, 1.0, 0.5]);
        assert_eq!(s.relative(), vec![10.0 / 30.0, 1.0, 20.0 / 30.0]);

        let flat = series(&[7, 7]);
        assert_eq!(flat.normalized(), vec![1.0, 1.0]);

        let dark = series(&[0, 0]);
        assert_eq!(dark.relative(), vec![0.0, 0.0]);
        assert!(PolarizationSeries::default().normalized().is_empty());
    }

    #[test]
    fn test_tsv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("polar.tsv");
        series(&[40, 10]).save_tsv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "angle_deg\tcount\tnormalized\trelative",
                "0.00\t40\t1.0000\t1.0000",
                "90.00\t10\t0.0000\t0.2500",
            ]
        );
    }
}

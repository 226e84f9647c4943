use crate::acquisition::ConnectionConfig;
use crate::angular::{ForbiddenArc, MotorBoardConfig, MotorGeometry};
use crate::calibration::{CalibrationParameters, StepAmplitudes};
use crate::error::ScanError;
use crate::frame::ScanConfig;
use crate::polarization::PolarizationConfig;
use crate::types::JogDirection;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct AppConfig {
    pub acquisition: AcquisitionSettings,
    pub scan: ScanSettings,
    pub calibration: CalibrationSettings,
    pub stage: StageSettings,
    pub motors: MotorsSettings,
    pub polarization: PolarizationSettings,
    pub logging: LoggingConfig,
    pub export: ExportSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ScanSettings {
    pub frame_size: f64,
    pub pixel_step: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub rotation_deg: f64,
    pub dwell_ms: u32,
    pub frames: u32,
    pub settle_factor: u32,
}

/// Per jog direction values, keyed like the controller's axis buttons
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct PerDirection<T> {
    pub x_minus: T,
    pub x_plus: T,
    pub y_minus: T,
    pub y_plus: T,
}

impl<T: Copy> PerDirection<T> {
    pub fn get(&self, direction: JogDirection) -> T {
        match direction {
            JogDirection::HorizontalMinus => self.x_minus,
            JogDirection::HorizontalPlus => self.x_plus,
            JogDirection::VerticalMinus => self.y_minus,
            JogDirection::VerticalPlus => self.y_plus,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CalibrationSettings {
    /// Physical distance covered by one actuator step
    pub distance_per_step_x: f64,
    pub distance_per_step_y: f64,
    pub skew_deg: f64,
    pub step_amplitudes: PerDirection<u8>,
    /// Steps per jog command
    pub unit_steps: PerDirection<u32>,
    /// Jog commands per calibration jog
    pub jog_counts: PerDirection<u32>,
    /// Dwell between jog commands
    pub jog_dwell_ms: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StageSettings {
    pub port: String,
    pub baud_rate: u32,
    pub channel: u8,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MotorSettings {
    pub id: u8,
    pub name: String,
    pub gear_ratio: f64,
    pub full_step_angle: f64,
    pub half_step: bool,
    pub speed_percent: f64,
    pub forbidden_arc: Option<ForbiddenArc>,
}

impl MotorSettings {
    pub fn geometry(&self) -> MotorGeometry {
        MotorGeometry {
            gear_ratio: self.gear_ratio,
            full_step_angle: self.full_step_angle,
            half_step: self.half_step,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MotorsSettings {
    pub port: String,
    pub baud_rate: u32,
    pub done_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub motors: Vec<MotorSettings>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PolarizationSettings {
    /// Motor carrying the polariser, by id or name
    pub motor: String,
    pub step_deg: f64,
    pub dwell_ms: u32,
    pub settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub sample_log: bool,
    pub log_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExportSettings {
    pub output_dir: String,
    pub png: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 65053,
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            frame_size: 10.0,
            pixel_step: 0.5,
            offset_x: 0.0,
            offset_y: 0.0,
            rotation_deg: 0.0,
            dwell_ms: 100,
            frames: 1,
            settle_factor: 10,
        }
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        let amplitudes = StepAmplitudes::default();
        Self {
            distance_per_step_x: 0.2,
            distance_per_step_y: 0.2,
            skew_deg: 0.0,
            step_amplitudes: PerDirection {
                x_minus: amplitudes.horizontal_minus,
                x_plus: amplitudes.horizontal_plus,
                y_minus: amplitudes.vertical_minus,
                y_plus: amplitudes.vertical_plus,
            },
            unit_steps: PerDirection {
                x_minus: 1,
                x_plus: 1,
                y_minus: 1,
                y_plus: 1,
            },
            jog_counts: PerDirection {
                x_minus: 10,
                x_plus: 10,
                y_minus: 10,
                y_plus: 10,
            },
            jog_dwell_ms: 100,
        }
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 921600,
            channel: 1,
            timeout_ms: 2000,
        }
    }
}

impl Default for MotorsSettings {
    fn default() -> Self {
        let motor = |id: u8, name: &str, gear_ratio: f64, forbidden_arc| MotorSettings {
            id,
            name: name.to_string(),
            gear_ratio,
            full_step_angle: 1.8,
            half_step: false,
            speed_percent: 50.0,
            forbidden_arc,
        };
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            done_timeout_ms: 10000,
            poll_interval_ms: 50,
            motors: vec![
                motor(0, "nd_filter", 1.0, None),
                motor(1, "flip_ls", 1.0, None),
                motor(2, "flip_bs", 1.0, None),
                motor(
                    3,
                    "light",
                    1.0,
                    Some(ForbiddenArc {
                        left_deg: 205.0,
                        right_deg: 290.0,
                    }),
                ),
                motor(4, "polarizer", 1.0, None),
            ],
        }
    }
}

impl Default for PolarizationSettings {
    fn default() -> Self {
        let sweep = PolarizationConfig::default();
        Self {
            motor: "polarizer".to_string(),
            step_deg: sweep.step_deg,
            dwell_ms: sweep.dwell_millis,
            settle_ms: sweep.settle_millis,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            sample_log: false,
            log_path: "./logs".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: "./scans".to_string(),
            png: true,
        }
    }
}

impl AppConfig {
    /// Reject every configuration a scan or move could not run with,
    /// before any hardware is touched
    pub fn validate(&self) -> Result<(), ScanError> {
        self.scan_config().validate()?;
        let calibration = self.calibration_parameters()?;
        crate::stage::PixelSteps::new(&calibration, self.scan.pixel_step)?;

        if self.acquisition.host.trim().is_empty() {
            return Err(ScanError::InvalidConfig(
                "Acquisition host must not be empty".to_string(),
            ));
        }
        for direction in JogDirection::ALL {
            if self.calibration.unit_steps.get(direction) == 0 {
                return Err(ScanError::InvalidConfig(format!(
                    "Unit steps for {:?} must be at least 1",
                    direction
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for motor in &self.motors.motors {
            if !seen.insert(motor.id) {
                return Err(ScanError::InvalidConfig(format!(
                    "Duplicate motor id {}",
                    motor.id
                )));
            }
            motor.geometry().steps_per_revolution()?;
            crate::angular::map_speed(motor.speed_percent)?;
        }
        self.polarization_config().validate()?;
        Ok(())
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            frame_size: self.scan.frame_size,
            pixel_step: self.scan.pixel_step,
            offset_x: self.scan.offset_x,
            offset_y: self.scan.offset_y,
            rotation_degrees: self.scan.rotation_deg,
            dwell_millis: self.scan.dwell_ms,
            frames: self.scan.frames,
            settle_factor: self.scan.settle_factor,
        }
    }

    pub fn polarization_config(&self) -> PolarizationConfig {
        PolarizationConfig {
            step_deg: self.polarization.step_deg,
            dwell_millis: self.polarization.dwell_ms,
            settle_millis: self.polarization.settle_ms,
        }
    }

    pub fn step_amplitudes(&self) -> StepAmplitudes {
        let a = &self.calibration.step_amplitudes;
        StepAmplitudes {
            horizontal_minus: a.x_minus,
            horizontal_plus: a.x_plus,
            vertical_minus: a.y_minus,
            vertical_plus: a.y_plus,
        }
    }

    pub fn calibration_parameters(&self) -> Result<CalibrationParameters, ScanError> {
        let mut params = CalibrationParameters::new(
            self.calibration.distance_per_step_x,
            self.calibration.distance_per_step_y,
        )?
        .with_skew_degrees(self.calibration.skew_deg)
        .with_rotation(self.scan.rotation_deg);
        params.step_amplitudes = self.step_amplitudes();
        params.validate()?;
        Ok(params)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.acquisition.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.acquisition.read_timeout_ms),
            write_timeout: Duration::from_millis(self.acquisition.write_timeout_ms),
        }
    }

    pub fn motor_board_config(&self) -> MotorBoardConfig {
        MotorBoardConfig {
            done_timeout: Duration::from_millis(self.motors.done_timeout_ms),
            poll_interval: Duration::from_millis(self.motors.poll_interval_ms),
            ..Default::default()
        }
    }

    /// Motor by numeric id or by name
    pub fn motor(&self, key: &str) -> Option<&MotorSettings> {
        let id = key.parse::<u8>().ok();
        self.motors
            .motors
            .iter()
            .find(|m| Some(m.id) == id || m.name == key)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.export.output_dir)
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("config.toml").exists() {
        builder = builder.add_source(File::with_name("config.toml"));
    }

    // Environment overrides, e.g. RUSTY_RASTER__SCAN__DWELL_MS=50
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_RASTER")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

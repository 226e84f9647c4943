pub mod acquisition;
pub mod actuator;
pub mod agilis;
pub mod angular;
pub mod calibration;
pub mod cancel;
pub mod config;
pub mod error;
pub mod export;
pub mod frame;
pub mod link;
pub mod logger;
pub mod motion;
pub mod path;
pub mod plotting;
pub mod polarization;
pub mod sequencer;
pub mod sim;
pub mod stage;
pub mod trig;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

pub use acquisition::{
    AcquisitionClient, AcquisitionClientBuilder, AcquisitionState, ConnectionConfig,
};
pub use actuator::{Actuator, ActuatorCommand, SimulatedStage};
pub use agilis::{AgilisConfig, AgilisController};
pub use angular::{
    AngularPositioner, ForbiddenArc, LineMotorBoard, MotorBoard, MotorBoardConfig,
    MotorGeometry, MotorStatus, MovePlan, SimulatedMotorBoard,
};
pub use calibration::{CalibrationParameters, CalibrationStore, StepAmplitudes};
pub use cancel::CancellationToken;
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::ScanError;
pub use export::{read_tsv, save_png, save_tsv};
pub use frame::ScanConfig;
pub use logger::Logger;
pub use motion::{MoveDecomposer, MoveReport};
pub use path::{RasterPoint, Transition, ZigZagPath};
pub use plotting::{plot_counts, plot_row_profile};
pub use polarization::{
    PolarizationConfig, PolarizationPoint, PolarizationSeries, PolarizationSweep,
};
pub use sequencer::{ScanController, ScanEvent, ScanOutcome, ScanSequencer, ScanState};
pub use sim::{CounterServer, gaussian_spot, malus_law};
pub use stage::{CursorPosition, PixelSteps, Stage};
pub use trig::AngleTable;
pub use types::{
    Axis, JogDirection, PixelSample, Polarity, RotationDirection, RowDirection, SampleRecord,
};

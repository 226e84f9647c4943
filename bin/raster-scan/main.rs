use chrono::Utc;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use env_logger::Env;
use log::{LevelFilter, debug, error, info, warn};
use rusty_raster::{
    AcquisitionClient, Actuator, AngularPositioner, AppConfig, CalibrationStore, CancellationToken,
    CounterServer, JogDirection, Logger, MotorBoard, PolarizationSweep, RotationDirection,
    SampleRecord, ScanController, ScanEvent, ScanOutcome, SimulatedMotorBoard, SimulatedStage,
    Stage, config::MotorSettings, export, gaussian_spot, load_config, malus_law, plot_counts,
    plot_row_profile, utils::format_count_rate,
};
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

type StageActuator = Box<dyn Actuator + Send>;

/// Raster scanning of a piezo stage against a photon counter
#[derive(Parser, Debug)]
#[command(name = "raster-scan")]
#[command(about = "Raster scan a piezo stage synchronised with a photon counter", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./config.toml if present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Run against a simulated stage, counter and motor board
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire the configured number of frames and export the grid
    Scan,
    /// Move the stage to a pixel of the configured grid
    MoveTo {
        col: f64,
        row: f64,
        /// Pixel the stage currently sits on
        #[arg(long, num_args = 2, value_names = ["COL", "ROW"], default_values_t = [0, 0])]
        from: Vec<i32>,
    },
    /// Calibration jog in one direction (x-, x+, y-, y+)
    Jog {
        direction: JogDirection,
        /// Number of unit commands, defaults to the configured jog count
        #[arg(long)]
        count: Option<u32>,
    },
    /// Move an auxiliary motor to an absolute angle
    Angle {
        /// Motor id or name
        motor: String,
        degrees: f64,
        /// Force the rotation direction (cw or ccw)
        #[arg(long)]
        direction: Option<RotationDirection>,
    },
    /// Toggle a flip mount about a pivot angle
    Flip {
        motor: String,
        #[arg(long, default_value_t = 90.0)]
        pivot: f64,
    },
    /// Declare the current motor position as zero
    Zero { motor: String },
    /// Turn the polariser one full revolution and export angle against count
    Polarization {
        /// Motor id or name, defaults to the configured polariser
        #[arg(long)]
        motor: Option<String>,
        /// Angle step in degrees
        #[arg(long)]
        step: Option<f64>,
        /// Counter bin width and dwell per angle
        #[arg(long)]
        dwell_ms: Option<u32>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, &args);
    config.validate()?;

    let shutdown_flag = setup_shutdown_handler();

    match args.command {
        Command::Scan => run_scan(&config, args.simulate, shutdown_flag),
        Command::MoveTo { col, row, from } => {
            let mut stage = setup_stage(&config, args.simulate)?.0;
            stage.set_index(from[0], from[1]);
            let scan = config.scan_config();
            let (col, row) = Stage::<StageActuator>::pixel_at(col, row, scan.grid_dimension()?);
            let calibration = config.calibration_parameters()?;
            stage.move_to_pixel(col, row, &calibration, scan.pixel_step, scan.dwell())?;
            info!("Stage at pixel ({}, {})", col, row);
            Ok(())
        }
        Command::Jog { direction, count } => {
            let mut stage = setup_stage(&config, args.simulate)?.0;
            let calibration = &config.calibration;
            let report = stage.jog(
                direction,
                calibration.step_amplitudes.get(direction),
                calibration.unit_steps.get(direction),
                count.unwrap_or(calibration.jog_counts.get(direction)),
                Duration::from_millis(calibration.jog_dwell_ms.into()),
                &CancellationToken::from_flag(shutdown_flag),
            )?;
            info!(
                "Jog {:?}: {}/{} commands{}",
                direction,
                report.completed,
                report.requested,
                if report.cancelled { " (cancelled)" } else { "" }
            );
            Ok(())
        }
        Command::Angle {
            motor,
            degrees,
            direction,
        } => {
            let mut positioner = setup_positioner(&config, &motor, args.simulate)?;
            let plan = positioner.go_to_angle(degrees, direction)?;
            info!(
                "Motor {} at {:.2} deg after {} steps",
                positioner.motor(),
                positioner.current_angle(),
                plan.steps
            );
            Ok(())
        }
        Command::Flip { motor, pivot } => {
            let mut positioner = setup_positioner(&config, &motor, args.simulate)?;
            positioner.flip(pivot)?;
            info!(
                "Motor {} flipped to {:.2} deg",
                positioner.motor(),
                positioner.current_angle()
            );
            Ok(())
        }
        Command::Zero { motor } => {
            let mut positioner = setup_positioner(&config, &motor, args.simulate)?;
            positioner.zero()?;
            Ok(())
        }
        Command::Polarization {
            motor,
            step,
            dwell_ms,
        } => run_polarization(&config, motor, step, dwell_ms, args.simulate, shutdown_flag),
    }
}

// Helper Functions

/// Log startup information
fn log_startup_info(config: &AppConfig, args: &Args) {
    info!("=== Rusty Raster ===");
    match &args.config {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults and environment"),
    }
    if args.simulate {
        info!("Simulation mode: no hardware will be touched");
    } else {
        info!(
            "Acquisition: {}:{}",
            config.acquisition.host, config.acquisition.port
        );
        info!(
            "Stage: {} @ {} baud, channel {}",
            config.stage.port, config.stage.baud_rate, config.stage.channel
        );
    }
}

/// Run a full scan on the worker thread and export the result
fn run_scan(
    config: &AppConfig,
    simulate: bool,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let scan = config.scan_config();
    let (stage, simulated) = setup_stage(config, simulate)?;

    // The simulated counter images a spot under the simulated stage
    let _counter;
    let acquisition = match simulated {
        Some(sim_stage) => {
            let calibration = config.calibration_parameters()?;
            let sigma = scan.frame_size / 6.0 / calibration.distance_per_step_x;
            let server = CounterServer::spawn(gaussian_spot(sim_stage, sigma, 5000, 100))?;
            let client = AcquisitionClient::builder()
                .address("127.0.0.1")
                .port(server.addr().port())
                .config(config.connection_config())
                .build()?;
            _counter = Some(server);
            client
        }
        None => {
            _counter = None;
            AcquisitionClient::builder()
                .address(&config.acquisition.host)
                .port(config.acquisition.port)
                .config(config.connection_config())
                .build()?
        }
    };

    let calibration = Arc::new(CalibrationStore::new(config.calibration_parameters()?)?);
    let mut controller = ScanController::new(stage, acquisition, calibration, scan.clone());
    let events = controller.events();

    let mut sample_log = if config.logging.sample_log {
        Some(Logger::<SampleRecord>::new(
            create_log_file_path(&config.logging.log_path)?,
            1000,
            false,
        ))
    } else {
        None
    };

    let started = Utc::now();
    controller.start()?;
    info!("Starting scan... (Ctrl+C to stop)");

    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ScanEvent::Started { dimension, frames }) => {
                info!("Scanning {}x{} grid, {} frame(s)", dimension, dimension, frames);
            }
            Ok(ScanEvent::Pixel(record)) => {
                debug!(
                    "Frame {} pixel ({}, {}): {}",
                    record.frame,
                    record.sample.col,
                    record.sample.row,
                    format_count_rate(record.sample.count)
                );
                if let Some(logger) = sample_log.as_mut() {
                    logger.add(record)?;
                }
            }
            Ok(ScanEvent::Cursor(cursor)) => {
                info!(
                    "Cursor at pixel ({}, {}), offset ({:.2}, {:.2})",
                    cursor.col, cursor.row, cursor.x, cursor.y
                );
            }
            Ok(ScanEvent::Finished(_)) | Ok(ScanEvent::Failed(_)) => break,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    controller.stop();
                }
                if !controller.is_running() && events.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let result = controller.join();
    if let Some(mut logger) = sample_log.take() {
        logger.flush()?;
        info!("Samples logged to {}", logger.path().display());
    }

    match result {
        Ok(ScanOutcome::Completed) => info!("✓ Scan completed"),
        Ok(ScanOutcome::Cancelled) => info!("✓ Scan stopped by user"),
        Err(e) => {
            error!("✗ Scan failed: {}", e);
            return Err(e.into());
        }
    }

    export_grid(config, &controller.grid().grid, started)
}

/// Save TSV (and PNG) and plot the middle scan line
fn export_grid(
    config: &AppConfig,
    grid: &ndarray::Array2<u32>,
    started: chrono::DateTime<Utc>,
) -> Result<(), Box<dyn std::error::Error>> {
    if grid.is_empty() {
        warn!("Nothing acquired, skipping export");
        return Ok(());
    }

    let output_dir = config.output_dir();
    fs::create_dir_all(&output_dir)?;
    let base = export::timestamped_path(&output_dir, "scan", started);
    export::save_tsv(grid, base.with_extension("tsv"))?;
    if config.export.png {
        export::save_png(grid, base.with_extension("png"))?;
    }

    plot_row_profile(grid, grid.nrows() / 2, Some(120), Some(40))?;
    Ok(())
}

/// Sweep the polariser against the counter and export the series
fn run_polarization(
    config: &AppConfig,
    motor: Option<String>,
    step: Option<f64>,
    dwell_ms: Option<u32>,
    simulate: bool,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sweep = config.polarization_config();
    if let Some(step) = step {
        sweep.step_deg = step;
    }
    if let Some(dwell_ms) = dwell_ms {
        sweep.dwell_millis = dwell_ms;
    }
    sweep.validate()?;

    let key = motor.unwrap_or_else(|| config.polarization.motor.clone());
    let (board, simulated) = open_board(config, simulate)?;
    let mut positioner = positioner_on(config, &key, board)?;

    // The simulated counter sees the simulated polariser
    let _counter;
    let mut acquisition = match simulated {
        Some(sim_board) => {
            let steps_per_rev = positioner.geometry().steps_per_revolution()?;
            let server = CounterServer::spawn(malus_law(
                sim_board,
                positioner.motor(),
                steps_per_rev,
                5000,
                100,
            ))?;
            let client = AcquisitionClient::builder()
                .address("127.0.0.1")
                .port(server.addr().port())
                .config(config.connection_config())
                .build()?;
            _counter = Some(server);
            client
        }
        None => {
            _counter = None;
            AcquisitionClient::builder()
                .address(&config.acquisition.host)
                .port(config.acquisition.port)
                .config(config.connection_config())
                .build()?
        }
    };
    acquisition.connect()?;

    let cancel = CancellationToken::from_flag(shutdown_flag);
    let started = Utc::now();
    info!("Starting polarisation sweep... (Ctrl+C to stop)");
    let result = PolarizationSweep::new(&mut positioner, &mut acquisition, &cancel).run(&sweep);
    acquisition.close();
    let series = match result {
        Ok(series) => series,
        Err(e) => {
            error!("✗ Polarisation sweep failed: {}", e);
            return Err(e.into());
        }
    };

    if series.points.is_empty() {
        warn!("Nothing acquired, skipping export");
        return Ok(());
    }
    let output_dir = config.output_dir();
    fs::create_dir_all(&output_dir)?;
    let path = export::timestamped_path(&output_dir, "polar", started).with_extension("tsv");
    series.save_tsv(&path)?;

    plot_counts(&series.counts(), Some("Polarisation"), Some(120), Some(40))?;
    Ok(())
}

/// Open the stage controller, or a simulated stage whose handle is also
/// returned for the simulated counter
fn setup_stage(
    config: &AppConfig,
    simulate: bool,
) -> Result<(Stage<StageActuator>, Option<SimulatedStage>), Box<dyn std::error::Error>> {
    if simulate {
        let sim_stage = SimulatedStage::new();
        let actuator: StageActuator = Box::new(sim_stage.clone());
        return Ok((Stage::new(actuator, config.stage.channel), Some(sim_stage)));
    }
    let actuator = open_stage_controller(config)?;
    Ok((Stage::new(actuator, config.stage.channel), None))
}

#[cfg(feature = "serial")]
fn open_stage_controller(config: &AppConfig) -> Result<StageActuator, Box<dyn std::error::Error>> {
    use rusty_raster::{AgilisConfig, AgilisController};

    let timeout = Duration::from_millis(config.stage.timeout_ms);
    let port = serialport::new(&config.stage.port, config.stage.baud_rate)
        .timeout(timeout)
        .open()?;
    info!("Opened stage controller on {}", config.stage.port);
    Ok(Box::new(AgilisController::new(
        port,
        AgilisConfig {
            response_timeout: timeout,
            ..Default::default()
        },
    )))
}

#[cfg(not(feature = "serial"))]
fn open_stage_controller(_config: &AppConfig) -> Result<StageActuator, Box<dyn std::error::Error>> {
    Err("Built without serial support; use --simulate".into())
}

/// Positioner for one configured motor, synchronised with the board
fn setup_positioner(
    config: &AppConfig,
    key: &str,
    simulate: bool,
) -> Result<AngularPositioner<Box<dyn MotorBoard>>, Box<dyn std::error::Error>> {
    let (board, _) = open_board(config, simulate)?;
    positioner_on(config, key, board)
}

/// Open the motor board, or a simulated board whose handle is also
/// returned for the simulated counter
fn open_board(
    config: &AppConfig,
    simulate: bool,
) -> Result<(Box<dyn MotorBoard>, Option<SimulatedMotorBoard>), Box<dyn std::error::Error>> {
    if simulate {
        let sim_board = SimulatedMotorBoard::new();
        return Ok((Box::new(sim_board.clone()), Some(sim_board)));
    }
    Ok((open_motor_board(config)?, None))
}

fn positioner_on(
    config: &AppConfig,
    key: &str,
    board: Box<dyn MotorBoard>,
) -> Result<AngularPositioner<Box<dyn MotorBoard>>, Box<dyn std::error::Error>> {
    let settings: &MotorSettings = config
        .motor(key)
        .ok_or_else(|| format!("Unknown motor '{}'", key))?;

    let mut positioner =
        AngularPositioner::new(board, settings.id, settings.geometry(), settings.speed_percent)?;
    if let Some(arc) = settings.forbidden_arc {
        positioner = positioner.with_forbidden_arc(arc);
    }
    let status = positioner.sync()?;
    info!(
        "Motor {} ({}): position {} steps, {:.2} deg",
        settings.id,
        settings.name,
        status.position_steps,
        positioner.current_angle()
    );
    Ok(positioner)
}

#[cfg(feature = "serial")]
fn open_motor_board(config: &AppConfig) -> Result<Box<dyn MotorBoard>, Box<dyn std::error::Error>> {
    use rusty_raster::LineMotorBoard;

    let port = serialport::new(&config.motors.port, config.motors.baud_rate)
        .timeout(Duration::from_millis(config.motors.poll_interval_ms))
        .open()?;
    info!("Opened motor board on {}", config.motors.port);
    Ok(Box::new(LineMotorBoard::new(port, config.motor_board_config())))
}

#[cfg(not(feature = "serial"))]
fn open_motor_board(_config: &AppConfig) -> Result<Box<dyn MotorBoard>, Box<dyn std::error::Error>> {
    Err("Built without serial support; use --simulate".into())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current step...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    shutdown_flag
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    fs::create_dir_all(&history_dir)?;

    let filename = format!("samples_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}

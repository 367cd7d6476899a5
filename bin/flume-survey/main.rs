use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use rusty_flume::{
    AppConfig, CalibrationManager, ExperimentLogger, RigError, Sampler, SamplerEvent, StageDriver,
    VelocimeterDriver, load_config,
};
use std::{path::PathBuf, sync::Arc, thread};

/// Flume velocity survey over a calibrated grid
#[derive(Parser, Debug)]
#[command(name = "flume-survey")]
#[command(about = "Automated ADV survey of a flume cross-section", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./flume.toml or ./config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Calibration JSON (overrides grid.calibration_file)
    #[arg(long, value_name = "FILE")]
    calibration: Option<PathBuf>,

    /// Upstream station of the cross-section (ft)
    #[arg(short, long)]
    z_plane: f64,

    /// Number of passes over the grid at this Z-plane
    #[arg(short, long, default_value_t = 1)]
    runs: u32,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);
    info!("=== Rusty Flume Survey ===");

    let calibration = load_calibration(&config, args.calibration.as_ref())?;

    let stage = Arc::new(StageDriver::new(config.stage.clone()));
    stage.connect()?;
    info!("Stage connected on {}", config.stage.port);

    let velocimeter = Arc::new(VelocimeterDriver::new(config.velocimeter.clone()));
    velocimeter.connect()?;
    info!("Velocimeter connected on {}", config.velocimeter.port);

    let sink = ExperimentLogger::new(
        &config.logging.output_path,
        config.logging.buffer_size,
        config.logging.final_format_json,
    );
    let mut sampler = Sampler::new(
        Arc::clone(&stage),
        Arc::clone(&velocimeter),
        sink,
        calibration,
        config.sampling.clone(),
    );

    let handle = sampler.handle();
    ctrlc::set_handler(move || {
        warn!("Ctrl+C received - stopping acquisition");
        handle.emergency_stop();
    })?;

    let events = sampler.subscribe();
    thread::spawn(move || {
        for event in events.iter() {
            print_event(&event);
        }
    });

    let result = run_survey(&mut sampler, args.z_plane, args.runs);

    if returns_home(&result) {
        if let Err(e) = sampler.return_home() {
            error!("Return home failed: {}", e);
        }
    } else {
        warn!("Survey did not complete, leaving the stage where it stopped");
    }
    drop(sampler);
    velocimeter.disconnect()?;
    stage.disconnect()?;
    info!("Shutdown complete");

    result.map(|_| ()).map_err(Into::into)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurveyEnd {
    Completed,
    Aborted,
}

/// Only a survey that ran to completion drives the stage home; after an
/// emergency stop or a failure the stage stays put until the operator acts
fn returns_home(result: &Result<SurveyEnd, RigError>) -> bool {
    matches!(result, Ok(SurveyEnd::Completed))
}

fn run_survey(
    sampler: &mut Sampler<StageDriver, VelocimeterDriver, ExperimentLogger>,
    z_plane: f64,
    runs: u32,
) -> Result<SurveyEnd, RigError> {
    for _ in 0..runs {
        let count = sampler.initialize_from_calibration()?;
        sampler.start_acquisition(z_plane)?;
        info!(
            "Run {} at Z={} over {} positions",
            sampler.run_number(),
            z_plane,
            count
        );

        let summary = sampler.run_measurement_sequence()?;
        info!(
            "Run {} finished: {} recorded, {} failed, {} samples",
            sampler.run_number(),
            summary.positions_completed,
            summary.measurements_failed,
            summary.samples_collected
        );
        if summary.aborted {
            warn!("Survey aborted");
            return Ok(SurveyEnd::Aborted);
        }
    }
    Ok(SurveyEnd::Completed)
}

/// Load the calibration file, then fill in the grid and home from config
fn load_calibration(
    config: &AppConfig,
    override_path: Option<&PathBuf>,
) -> Result<CalibrationManager, RigError> {
    let path = override_path
        .cloned()
        .or_else(|| config.grid.calibration_file.as_ref().map(PathBuf::from))
        .ok_or_else(|| RigError::Calibration("no calibration file given".to_string()))?;

    info!("Calibration: {}", path.display());
    let mut calibration = CalibrationManager::load(&path)?;
    if calibration.grid().is_none() {
        calibration.generate_grid(
            config.grid.x_spacing_feet,
            config.grid.y_spacing_feet,
            config.grid.roi_zones.clone(),
        )?;
    }
    if calibration.home_position().is_none() {
        calibration.set_home_position(None, None)?;
    }
    Ok(calibration)
}

fn print_event(event: &SamplerEvent) {
    match event {
        SamplerEvent::StateChanged(state) => println!("[state] {}", state),
        SamplerEvent::PositionSampled(record) => println!(
            "[ok] X={:.3} ft Y={:.3} ft  u={:+.3} v={:+.3} w={:+.3} m/s  TI={:.3}  ({}/{} valid)",
            record.x_feet,
            record.y_feet,
            record.mean_u,
            record.mean_v,
            record.mean_w,
            record.turbulence_intensity,
            record.num_valid,
            record.num_samples
        ),
        SamplerEvent::PositionFailed {
            x_steps,
            y_steps,
            reason,
        } => println!("[fail] X={} Y={} steps: {}", x_steps, y_steps, reason),
        SamplerEvent::Status(message) => println!("[info] {}", message),
    }
}

fn initialize_logging(log_level: &str) {
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
}

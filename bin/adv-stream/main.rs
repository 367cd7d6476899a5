use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, info, warn};
use rusty_flume::{Velocimeter, VelocimeterDriver, load_config_or_default};
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Stream and print velocimeter samples
#[derive(Parser, Debug)]
#[command(name = "adv-stream")]
#[command(about = "Check an ADV sensor by streaming samples to the terminal", long_about = None)]
struct Args {
    /// Serial port (overrides velocimeter.port)
    #[arg(short, long)]
    port: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,

    /// Stop after this many samples
    #[arg(short, long)]
    max_samples: Option<usize>,

    /// Print raw lines instead of parsed samples
    #[arg(long)]
    raw: bool,

    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    initialize_logging(&args.log_level);

    let mut config = load_config_or_default(args.config.as_deref()).velocimeter;
    if let Some(port) = args.port {
        config.port = port;
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping stream");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    let driver = VelocimeterDriver::new(config);
    driver.connect()?;
    if !driver.start_stream()? {
        return Err("velocimeter stream did not start".into());
    }

    let deadline = Instant::now() + Duration::try_from_secs_f64(args.duration.max(0.0))?;
    let limit = args.max_samples.unwrap_or(usize::MAX);
    let mut count = 0;
    let mut valid = 0;

    while running.load(Ordering::SeqCst) && Instant::now() < deadline && count < limit {
        if args.raw {
            if let Some(line) = driver.read_raw_line()? {
                println!("{}", line);
                count += 1;
            }
            continue;
        }

        let Some(mut sample) = driver.read_sample()? else {
            continue;
        };
        count += 1;
        let ok = driver.validate_sample(&mut sample);
        if ok {
            valid += 1;
        }
        println!(
            "{:>5} u={:+.4} v={:+.4} w={:+.4} m/s  SNR={:5.1} dB  corr={:5.1}%  depth={:.3} m  T={:.1}°C {}",
            count,
            sample.u,
            sample.v,
            sample.w,
            sample.snr,
            sample.correlation,
            sample.depth,
            sample.temperature,
            if ok { "" } else { "(rejected)" }
        );
    }

    if args.raw {
        info!("Read {} lines", count);
    } else if count == 0 {
        warn!("No samples received");
    } else {
        info!("Read {} samples, {} valid", count, valid);
    }

    driver.stop_stream()?;
    driver.disconnect()?;
    Ok(())
}

fn initialize_logging(log_level: &str) {
    let level = log_level.parse().unwrap_or_else(|_| {
        eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
        LevelFilter::Info
    });

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::flow::{FlowRegime, turbulence_intensity};
use crate::types::{RawSample, SamplingPosition};

/// Run bookkeeping attached to every record of one acquisition
#[derive(Debug, Clone, Copy)]
pub struct RecordContext {
    pub z_plane: f64,
    pub run_number: u32,
    pub froude_number: f64,
    pub started: DateTime<Utc>,
    pub duration: Duration,
}

/// Aggregated burst at one grid point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub timestamp: DateTime<Utc>,
    pub x_steps: i32,
    pub y_steps: i32,
    pub x_feet: f64,
    pub y_feet: f64,
    pub z_plane: f64,
    pub run_number: u32,
    pub mean_u: f64,
    pub mean_v: f64,
    pub mean_w: f64,
    pub std_u: f64,
    pub std_v: f64,
    pub std_w: f64,
    pub mean_speed: f64,
    pub turbulence_intensity: f64,
    pub mean_snr: f64,
    pub mean_correlation: f64,
    pub mean_depth: f64,
    pub mean_temperature: f64,
    /// Every sample read during the window, valid or not
    pub num_samples: usize,
    pub num_valid: usize,
    pub froude_number: f64,
    pub regime: FlowRegime,
    pub duration_s: f64,
}

fn column(samples: &[&RawSample], f: impl Fn(&RawSample) -> f64) -> Array1<f64> {
    samples.iter().map(|s| f(s)).collect()
}

fn mean_std(values: &Array1<f64>) -> (f64, f64) {
    match values.mean() {
        Some(mean) => (mean, values.std(0.0)),
        None => (0.0, 0.0),
    }
}

impl DataRecord {
    /// Aggregate a burst. Statistics use valid samples only; the counts
    /// cover everything read.
    pub fn from_samples(
        position: &SamplingPosition,
        context: RecordContext,
        samples: &[RawSample],
    ) -> Self {
        let valid: Vec<&RawSample> = samples.iter().filter(|s| s.valid).collect();

        let (mean_u, std_u) = mean_std(&column(&valid, |s| s.u));
        let (mean_v, std_v) = mean_std(&column(&valid, |s| s.v));
        let (mean_w, std_w) = mean_std(&column(&valid, |s| s.w));
        let mean = |f: fn(&RawSample) -> f64| column(&valid, f).mean().unwrap_or(0.0);

        Self {
            timestamp: context.started,
            x_steps: position.x_steps,
            y_steps: position.y_steps,
            x_feet: position.x_feet,
            y_feet: position.y_feet,
            z_plane: context.z_plane,
            run_number: context.run_number,
            mean_u,
            mean_v,
            mean_w,
            std_u,
            std_v,
            std_w,
            mean_speed: mean(RawSample::velocity_magnitude),
            turbulence_intensity: turbulence_intensity(
                [std_u, std_v, std_w],
                [mean_u, mean_v, mean_w],
            ),
            mean_snr: mean(|s| s.snr),
            mean_correlation: mean(|s| s.correlation),
            mean_depth: mean(|s| s.depth),
            mean_temperature: mean(|s| s.temperature),
            num_samples: samples.len(),
            num_valid: valid.len(),
            froude_number: context.froude_number,
            regime: FlowRegime::from_froude(context.froude_number),
            duration_s: context.duration.as_secs_f64(),
        }
    }
}

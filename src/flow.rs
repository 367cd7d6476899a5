//! Open-channel flow quantities used to steer and annotate sampling.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GRAVITY: f64 = 9.81;
pub const WATER_DENSITY: f64 = 1000.0;
/// Stage lead-screw scale, identical on both axes
pub const STEPS_PER_FOOT: f64 = 46_000.0;

/// Growth of the sampling window per unit of Froude number above 1
const SUPERCRITICAL_GAIN: f64 = 0.5;

/// `Fr = V / sqrt(g * h)`. Returns 0 for a non-positive depth.
pub fn froude_number(velocity: f64, depth: f64) -> f64 {
    if depth <= 0.0 {
        warn!("Invalid depth {} m for Froude calculation", depth);
        return 0.0;
    }
    velocity / (GRAVITY * depth).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowRegime {
    Subcritical,
    Supercritical,
}

impl FlowRegime {
    pub fn from_froude(froude: f64) -> Self {
        if froude < 1.0 {
            FlowRegime::Subcritical
        } else {
            FlowRegime::Supercritical
        }
    }
}

impl fmt::Display for FlowRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowRegime::Subcritical => f.write_str("subcritical"),
            FlowRegime::Supercritical => f.write_str("supercritical"),
        }
    }
}

/// Sampling window for a position, in seconds.
///
/// Subcritical flow gets `base`. Supercritical flow stretches it linearly,
/// 1.5x at Fr = 2, never beyond `max`.
pub fn adaptive_sampling_duration(froude: f64, base: f64, max: f64) -> f64 {
    match FlowRegime::from_froude(froude) {
        FlowRegime::Subcritical => base,
        FlowRegime::Supercritical => {
            let multiplier = 1.0 + (froude - 1.0) * SUPERCRITICAL_GAIN;
            (base * multiplier).min(max)
        }
    }
}

/// `sqrt(u'² + v'² + w'²) / |mean velocity|`, 0 in still water
pub fn turbulence_intensity(std: [f64; 3], mean: [f64; 3]) -> f64 {
    let rms = std.iter().map(|s| s * s).sum::<f64>().sqrt();
    let magnitude = mean.iter().map(|m| m * m).sum::<f64>().sqrt();
    if magnitude < 1e-6 {
        return 0.0;
    }
    rms / magnitude
}

/// Kinematic viscosity of water (m²/s), exponential fit in °C
pub fn kinematic_viscosity(temperature_c: f64) -> f64 {
    1.787e-3 * (-0.0337 * temperature_c).exp() / WATER_DENSITY
}

/// `Re = V * L / nu`
pub fn reynolds_number(velocity: f64, length: f64, temperature_c: f64) -> f64 {
    let nu = kinematic_viscosity(temperature_c);
    if nu == 0.0 {
        return 0.0;
    }
    velocity * length / nu
}

pub fn steps_to_feet(steps: i32) -> f64 {
    steps as f64 / STEPS_PER_FOOT
}

pub fn feet_to_steps(feet: f64) -> i32 {
    (feet * STEPS_PER_FOOT).round() as i32
}

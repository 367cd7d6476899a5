use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Velocity magnitude above which a sample is logged as anomalous (m/s).
pub const ANOMALOUS_VELOCITY_M_S: f64 = 5.0;

/// Stage axes, in controller motor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    R,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::R];

    /// Motor number used in program commands (`IA1M...`)
    pub fn motor(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
            Axis::R => 4,
        }
    }

    /// Single-letter position query for this motor
    pub fn position_query(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::R => "T",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::R => "R",
        };
        f.write_str(name)
    }
}

/// Step counters of the stage, as last reported or commanded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub r: i32,
}

impl MotorPosition {
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    pub fn get(&self, axis: Axis) -> i32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::R => self.r,
        }
    }

    pub fn set(&mut self, axis: Axis, steps: i32) {
        match axis {
            Axis::X => self.x = steps,
            Axis::Y => self.y = steps,
            Axis::Z => self.z = steps,
            Axis::R => self.r = steps,
        }
    }

    /// Largest absolute X/Y deviation from a target, in steps
    pub fn xy_error(&self, target_x: i32, target_y: i32) -> (u32, u32) {
        (
            (self.x as i64 - target_x as i64).unsigned_abs() as u32,
            (self.y as i64 - target_y as i64).unsigned_abs() as u32,
        )
    }
}

/// Per-axis move request. Axes left as `None` are not commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveTarget {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub z: Option<i32>,
    pub r: Option<i32>,
}

impl MoveTarget {
    pub fn xy(x: i32, y: i32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    pub fn get(&self, axis: Axis) -> Option<i32> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::R => self.r,
        }
    }

    /// Commanded axes in motor order
    pub fn axes(&self) -> impl Iterator<Item = (Axis, i32)> + '_ {
        Axis::ALL
            .into_iter()
            .filter_map(|axis| self.get(axis).map(|steps| (axis, steps)))
    }

    pub fn is_empty(&self) -> bool {
        self.axes().next().is_none()
    }
}

/// Full controller status as answered to a `V` query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    Ready,
    Busy,
    Jog,
    Fault,
}

impl ControllerStatus {
    /// Interpret a raw status response.
    ///
    /// Fault is checked first so a garbled reply containing both `F` and
    /// `R` can never read as ready.
    pub fn parse(response: &str) -> Option<Self> {
        let upper = response.trim().to_ascii_uppercase();
        if upper.contains('F') {
            Some(ControllerStatus::Fault)
        } else if upper.contains('B') {
            Some(ControllerStatus::Busy)
        } else if upper.contains('R') {
            Some(ControllerStatus::Ready)
        } else if upper.contains('J') {
            Some(ControllerStatus::Jog)
        } else {
            None
        }
    }
}

/// Motion-complete answer. Fault, jog mode and unreadable replies all land
/// in `Unknown`, which callers must treat as failure, never as done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionStatus {
    Ready,
    Busy,
    Unknown(String),
}

impl From<(Option<ControllerStatus>, &str)> for MotionStatus {
    fn from((status, raw): (Option<ControllerStatus>, &str)) -> Self {
        match status {
            Some(ControllerStatus::Ready) => MotionStatus::Ready,
            Some(ControllerStatus::Busy) => MotionStatus::Busy,
            _ => MotionStatus::Unknown(raw.to_string()),
        }
    }
}

/// One parsed velocimeter line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Velocity components (m/s)
    pub u: f64,
    pub v: f64,
    pub w: f64,
    /// Signal-to-noise ratio (dB)
    pub snr: f64,
    /// Correlation (0-100 %)
    pub correlation: f64,
    /// Water depth from the pressure sensor (m)
    pub depth: f64,
    pub amplitude: f64,
    /// Water temperature (°C)
    pub temperature: f64,
    pub valid: bool,
    pub timestamp: DateTime<Utc>,
}

impl RawSample {
    pub fn velocity_magnitude(&self) -> f64 {
        (self.u * self.u + self.v * self.v + self.w * self.w).sqrt()
    }

    pub fn is_anomalous(&self) -> bool {
        self.velocity_magnitude() > ANOMALOUS_VELOCITY_M_S
    }
}

/// Acquisition state machine states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingState {
    #[default]
    Idle,
    Calibrating,
    Moving,
    Sampling,
    Paused,
    Error,
}

impl SamplingState {
    /// States in which a position is actively being worked on
    pub fn is_active(self) -> bool {
        matches!(self, SamplingState::Moving | SamplingState::Sampling)
    }
}

impl fmt::Display for SamplingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplingState::Idle => "idle",
            SamplingState::Calibrating => "calibrating",
            SamplingState::Moving => "moving",
            SamplingState::Sampling => "sampling",
            SamplingState::Paused => "paused",
            SamplingState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A single grid point, fixed once the grid is enumerated
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingPosition {
    pub x_steps: i32,
    pub y_steps: i32,
    /// Distance from the grid origin (ft)
    pub x_feet: f64,
    pub y_feet: f64,
    pub in_roi: bool,
    pub roi_density_multiplier: f64,
}

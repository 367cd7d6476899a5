use log::{info, warn};
use std::time::Duration;

use super::StageDriver;
use crate::error::RigError;
use crate::synchronizer::{SyncConfig, Synchronizer};
use crate::types::{Axis, ControllerStatus, MotionStatus, MotorPosition, MoveTarget};
use crate::utils::Backoff;

pub const MAX_SPEED: u32 = 6000;
pub const MAX_ACCELERATION: u32 = 127;

/// Index move flavour used when building a program line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    Absolute,
    Relative,
}

/// Build one program line: clear, then speed/acceleration/index per commanded
/// axis, then run. Example: `C,S1M2000,A1M2,IA1M4600,R`
fn build_program(target: &MoveTarget, index: Index, speed: u32, acceleration: u32) -> String {
    let mut program = String::from("C,");
    for (axis, steps) in target.axes() {
        let m = axis.motor();
        let op = match index {
            Index::Absolute => "IA",
            Index::Relative => "I",
        };
        program.push_str(&format!("S{m}M{speed},A{m}M{acceleration},{op}{m}M{steps},"));
    }
    program.push('R');
    program
}

/// Parse a position reply such as `+0004600`, `X-120` or `^0`
pub fn parse_position(response: &str) -> Result<i32, RigError> {
    let digits = response
        .trim()
        .trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '+' || c == '-'));
    digits
        .parse::<i32>()
        .map_err(|_| RigError::ProtocolParse(format!("bad position reply {:?}", response)))
}

fn check_range(what: &str, value: u32, max: u32) -> Result<(), RigError> {
    if value == 0 || value > max {
        return Err(RigError::InvalidCommand(format!(
            "{} {} outside 1..={}",
            what, value, max
        )));
    }
    Ok(())
}

impl StageDriver {
    /// Move the commanded axes to absolute step positions.
    ///
    /// Only axes present in `target` are addressed. The position cache is
    /// updated as soon as the program is accepted; a later position query
    /// reconciles it.
    pub fn move_absolute(&self, target: MoveTarget) -> Result<bool, RigError> {
        self.send_move(target, Index::Absolute)
    }

    /// Jog the commanded axes by a step delta
    pub fn move_relative(&self, delta: MoveTarget) -> Result<bool, RigError> {
        self.send_move(delta, Index::Relative)
    }

    fn send_move(&self, target: MoveTarget, index: Index) -> Result<bool, RigError> {
        if target.is_empty() {
            warn!("Move requested without any axis, ignoring");
            return Ok(false);
        }

        let program = build_program(
            &target,
            index,
            self.config.speed,
            self.config.acceleration,
        );
        self.send_only(&program)?;

        self.update_cache(|pos| {
            for (axis, steps) in target.axes() {
                let next = match index {
                    Index::Absolute => steps,
                    Index::Relative => pos.get(axis).saturating_add(steps),
                };
                pos.set(axis, next);
            }
        });
        info!("Move accepted ({:?}): {}", index, program);
        Ok(true)
    }

    /// Query one motor's step counter and refresh the cache for it
    pub fn query_axis(&self, axis: Axis) -> Result<i32, RigError> {
        self.read_axis(axis, &self.backoff)
    }

    fn read_axis(&self, axis: Axis, backoff: &Backoff) -> Result<i32, RigError> {
        let response = self
            .dialogue(axis.position_query(), true, backoff)?
            .unwrap_or_default();
        let steps = parse_position(&response)?;
        self.update_cache(|pos| pos.set(axis, steps));
        Ok(steps)
    }

    /// Query X and Y; Z and R come from the cache
    pub fn get_position(&self) -> Result<MotorPosition, RigError> {
        self.query_axis(Axis::X)?;
        self.query_axis(Axis::Y)?;
        Ok(self.cached_position())
    }

    /// Like [`get_position`](Self::get_position) with a single attempt per
    /// axis, for polling loops that enforce their own timeout
    pub fn poll_position(&self) -> Result<MotorPosition, RigError> {
        let once = Backoff::none();
        self.read_axis(Axis::X, &once)?;
        self.read_axis(Axis::Y, &once)?;
        Ok(self.cached_position())
    }

    /// Full controller status, `None` for an unreadable reply
    pub fn controller_status(&self) -> Result<Option<ControllerStatus>, RigError> {
        let response = self.send_command("V")?;
        Ok(ControllerStatus::parse(&response))
    }

    pub fn is_motion_complete(&self) -> Result<MotionStatus, RigError> {
        let response = self.send_command("V")?;
        let status = MotionStatus::from((ControllerStatus::parse(&response), response.as_str()));
        if let MotionStatus::Unknown(raw) = &status {
            warn!("Unexpected motion status {:?}", raw);
        }
        Ok(status)
    }

    /// Block until the controller reports ready, polling at the configured rate
    pub fn wait_for_motion_complete(&self, timeout: Duration) -> Result<(), RigError> {
        let sync = Synchronizer::new(SyncConfig {
            poll_interval_ms: self.config.motion_poll_ms,
            motion_timeout_ms: timeout.as_millis() as u64,
            ..Default::default()
        });
        sync.wait_for_motion_complete(self)
    }

    /// Decelerate all motors to a stop
    pub fn stop_motion(&self) -> Result<(), RigError> {
        info!("Stopping stage motion");
        self.send_only("D")
    }

    /// Stop all motors immediately
    pub fn kill_motion(&self) -> Result<(), RigError> {
        warn!("Killing stage motion");
        self.send_only("K")
    }

    pub fn clear_program(&self) -> Result<(), RigError> {
        self.send_only("C")
    }

    /// Zero every motor's counter at the current location
    pub fn zero_position(&self) -> Result<(), RigError> {
        self.send_only("N")?;
        self.update_cache(|pos| *pos = MotorPosition::default());
        Ok(())
    }

    /// Put the controller on-line, with or without command echo
    pub fn go_online(&self, echo: bool) -> Result<(), RigError> {
        self.send_only(if echo { "E" } else { "F" })
    }

    /// Return the controller to local (front panel) mode
    pub fn go_offline(&self) -> Result<(), RigError> {
        self.send_only("Q")
    }

    pub fn set_speed(&self, axis: Axis, speed: u32) -> Result<(), RigError> {
        check_range("speed", speed, MAX_SPEED)?;
        self.send_only(&format!("S{}M{}", axis.motor(), speed))
    }

    pub fn set_acceleration(&self, axis: Axis, acceleration: u32) -> Result<(), RigError> {
        check_range("acceleration", acceleration, MAX_ACCELERATION)?;
        self.send_only(&format!("A{}M{}", axis.motor(), acceleration))
    }
}

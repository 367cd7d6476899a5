//! In-memory stage and velocimeter used by synchronizer and sampler tests.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::RigError;
use crate::stage::Stage;
use crate::types::{MotionStatus, MotorPosition, MoveTarget, RawSample};
use crate::velocimeter::{QualityThresholds, Velocimeter};

pub(crate) fn sample(speed: f64, depth: f64) -> RawSample {
    RawSample {
        u: speed,
        v: 0.0,
        w: 0.0,
        snr: 25.0,
        correlation: 90.0,
        depth,
        amplitude: 120.0,
        temperature: 18.0,
        valid: true,
        timestamp: Utc::now(),
    }
}

pub(crate) fn noisy_sample() -> RawSample {
    RawSample {
        snr: 1.0,
        correlation: 30.0,
        ..sample(0.5, 0.3)
    }
}

#[derive(Default)]
struct StageState {
    position: MotorPosition,
    statuses: VecDeque<MotionStatus>,
    default_status: Option<MotionStatus>,
    status_polls: usize,
    position_failures: usize,
    reject_moves: bool,
    moves: Vec<MoveTarget>,
    stops: usize,
    kills: usize,
}

#[derive(Default)]
pub(crate) struct FakeStage {
    state: Mutex<StageState>,
}

impl FakeStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_status(&self, status: MotionStatus) {
        self.state.lock().statuses.push_back(status);
    }

    pub fn set_default_status(&self, status: MotionStatus) {
        self.state.lock().default_status = Some(status);
    }

    pub fn set_position(&self, position: MotorPosition) {
        self.state.lock().position = position;
    }

    pub fn fail_position_queries(&self, n: usize) {
        self.state.lock().position_failures = n;
    }

    pub fn reject_moves(&self, reject: bool) {
        self.state.lock().reject_moves = reject;
    }

    pub fn status_polls(&self) -> usize {
        self.state.lock().status_polls
    }

    pub fn moves(&self) -> Vec<MoveTarget> {
        self.state.lock().moves.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn kills(&self) -> usize {
        self.state.lock().kills
    }
}

impl Stage for FakeStage {
    fn move_absolute(&self, target: MoveTarget) -> Result<bool, RigError> {
        let mut state = self.state.lock();
        if state.reject_moves {
            return Err(RigError::CommandTimeout {
                command: "move".into(),
                attempts: 4,
            });
        }
        if target.is_empty() {
            return Ok(false);
        }
        for (axis, steps) in target.axes() {
            state.position.set(axis, steps);
        }
        state.moves.push(target);
        Ok(true)
    }

    fn move_relative(&self, delta: MoveTarget) -> Result<bool, RigError> {
        let mut state = self.state.lock();
        if delta.is_empty() {
            return Ok(false);
        }
        for (axis, steps) in delta.axes() {
            let next = state.position.get(axis) + steps;
            state.position.set(axis, next);
        }
        state.moves.push(delta);
        Ok(true)
    }

    fn position(&self) -> Result<MotorPosition, RigError> {
        let mut state = self.state.lock();
        if state.position_failures > 0 {
            state.position_failures -= 1;
            return Err(RigError::CommandTimeout {
                command: "X".into(),
                attempts: 4,
            });
        }
        Ok(state.position)
    }

    fn motion_status(&self) -> Result<MotionStatus, RigError> {
        let mut state = self.state.lock();
        state.status_polls += 1;
        let status = state
            .statuses
            .pop_front()
            .or_else(|| state.default_status.clone())
            .unwrap_or(MotionStatus::Ready);
        Ok(status)
    }

    fn stop_motion(&self) -> Result<(), RigError> {
        self.state.lock().stops += 1;
        Ok(())
    }

    fn kill_motion(&self) -> Result<(), RigError> {
        self.state.lock().kills += 1;
        Ok(())
    }
}

type ReadHook = Box<dyn FnMut(usize) + Send>;

#[derive(Default)]
struct SensorState {
    script: VecDeque<Option<RawSample>>,
    fallback: Option<RawSample>,
    streaming: bool,
    reads: usize,
    starts: usize,
    stops: usize,
    fail_start: bool,
    fail_reads: bool,
}

/// Scripted sensor: plays back queued reads, then repeats the fallback
#[derive(Default)]
pub(crate) struct FakeVelocimeter {
    state: Mutex<SensorState>,
    hook: Mutex<Option<ReadHook>>,
}

impl FakeVelocimeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming(fallback: RawSample) -> Self {
        let sensor = Self::new();
        sensor.set_fallback(Some(fallback));
        sensor
    }

    pub fn push(&self, read: Option<RawSample>) {
        self.state.lock().script.push_back(read);
    }

    pub fn set_fallback(&self, fallback: Option<RawSample>) {
        self.state.lock().fallback = fallback;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Make every read fail as if the serial link vanished
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Run `hook` with the running read count after every read
    pub fn on_read(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }
}

impl Velocimeter for FakeVelocimeter {
    fn start_stream(&self) -> Result<bool, RigError> {
        let mut state = self.state.lock();
        state.starts += 1;
        if state.fail_start {
            return Ok(false);
        }
        state.streaming = true;
        Ok(true)
    }

    fn stop_stream(&self) -> Result<bool, RigError> {
        let mut state = self.state.lock();
        state.stops += 1;
        state.streaming = false;
        Ok(true)
    }

    fn read_sample(&self) -> Result<Option<RawSample>, RigError> {
        let (read, count) = {
            let mut state = self.state.lock();
            state.reads += 1;
            if state.fail_reads {
                return Err(RigError::Connection("velocimeter link lost".to_string()));
            }
            let read = match state.script.pop_front() {
                Some(read) => read,
                None => state.fallback.clone(),
            };
            (read, state.reads)
        };
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(count);
        }
        Ok(read.map(|mut s| {
            s.timestamp = Utc::now();
            s
        }))
    }

    fn quality(&self) -> QualityThresholds {
        QualityThresholds::default()
    }
}

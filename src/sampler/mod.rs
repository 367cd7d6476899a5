//! Acquisition state machine: move, verify, sample and record across the grid.
//!
//! ```text
//!  Idle ──start──▶ Sampling ◀──▶ Moving
//!   ▲  ▲              │  ▲
//!   │  └─finish─┐  pause resume
//!   │       Calibrating  ▼  │
//!   │              Paused
//!   └──emergency stop (any state)
//! ```
//! A failure inside a transition lands in `Error`, which only `reset` leaves.

pub mod events;
pub mod handle;

use chrono::Utc;
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use events::SamplerEvent;
pub use handle::{SamplerHandle, SamplerStatus};

use crate::calibration::CalibrationManager;
use crate::error::RigError;
use crate::flow::{FlowRegime, adaptive_sampling_duration, froude_number};
use crate::record::{DataRecord, RecordContext};
use crate::sink::DataSink;
use crate::stage::Stage;
use crate::synchronizer::{SyncConfig, Synchronizer};
use crate::types::{MoveTarget, RawSample, SamplingPosition, SamplingState};
use crate::utils::{Backoff, RateLimiter, sleep_interruptible};
use crate::velocimeter::Velocimeter;
use handle::Inner;

/// Retries after the first failed sample read
pub const RETRY_LIMIT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Window for subcritical flow (s)
    pub base_duration_s: f64,
    /// Upper bound for the Froude-stretched window (s)
    pub max_duration_s: f64,
    pub sample_rate_hz: f64,
    /// One delay per retry of a sample read
    pub retry_delays_ms: Vec<u64>,
    pub pause_poll_ms: u64,
    pub synchronizer: SyncConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            base_duration_s: 10.0,
            max_duration_s: 120.0,
            sample_rate_hz: 10.0,
            retry_delays_ms: vec![500, 1000, 2000],
            pause_poll_ms: 100,
            synchronizer: SyncConfig::default(),
        }
    }
}

/// What happened at one grid point
#[derive(Debug, Clone)]
pub enum PositionOutcome {
    Recorded(DataRecord),
    /// Move, verification or seed read failed; the sequence moves on
    Failed(String),
    /// Pause or stop arrived first; nothing was recorded
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceSummary {
    pub positions_completed: usize,
    pub measurements_failed: usize,
    pub samples_collected: usize,
    /// Stopped before the last position
    pub aborted: bool,
}

pub struct Sampler<S, V, D> {
    inner: Arc<Inner<S, V>>,
    sink: D,
    calibration: CalibrationManager,
    synchronizer: Synchronizer,
    config: SamplerConfig,
    backoff: Backoff,
    z_plane: Option<f64>,
    run_number: u32,
    sequence: Vec<SamplingPosition>,
}

impl<S: Stage, V: Velocimeter, D: DataSink> Sampler<S, V, D> {
    pub fn new(
        stage: Arc<S>,
        velocimeter: Arc<V>,
        sink: D,
        calibration: CalibrationManager,
        config: SamplerConfig,
    ) -> Self {
        let inner = Arc::new(Inner::new(stage, velocimeter));
        let synchronizer = Synchronizer::new(config.synchronizer.clone())
            .with_interrupt(Arc::clone(&inner.interrupt));
        let backoff = Backoff::from_millis(&config.retry_delays_ms);

        Self {
            inner,
            sink,
            calibration,
            synchronizer,
            config,
            backoff,
            z_plane: None,
            run_number: 1,
            sequence: Vec::new(),
        }
    }

    pub fn handle(&self) -> SamplerHandle<S, V> {
        SamplerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn state(&self) -> SamplingState {
        self.inner.state()
    }

    pub fn status(&self) -> SamplerStatus {
        self.inner.status()
    }

    pub fn subscribe(&self) -> Receiver<SamplerEvent> {
        self.inner.events.subscribe()
    }

    pub fn stage(&self) -> &S {
        &self.inner.stage
    }

    pub fn velocimeter(&self) -> &V {
        &self.inner.velocimeter
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut D {
        &mut self.sink
    }

    pub fn calibration(&self) -> &CalibrationManager {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut CalibrationManager {
        &mut self.calibration
    }

    pub fn z_plane(&self) -> Option<f64> {
        self.z_plane
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Select the upstream station. Repeating the current value counts as
    /// another pass and bumps the run number; a new value starts at run 1.
    pub fn set_z_plane(&mut self, z_plane: f64) -> u32 {
        if self.z_plane == Some(z_plane) {
            self.run_number += 1;
            info!("Z unchanged, incrementing run: {}", self.run_number);
        } else {
            self.z_plane = Some(z_plane);
            self.run_number = 1;
        }
        info!("Z-plane set to {}, run {}", z_plane, self.run_number);

        let mut progress = self.inner.progress.lock();
        progress.z_plane = self.z_plane;
        progress.run_number = self.run_number;
        self.run_number
    }

    pub fn initialize_measurement_sequence(
        &mut self,
        positions: Vec<SamplingPosition>,
    ) -> Result<(), RigError> {
        if positions.is_empty() {
            error!("Empty position sequence");
            return Err(RigError::InvalidCommand(
                "empty position sequence".to_string(),
            ));
        }
        info!("Initialized sequence with {} positions", positions.len());

        let mut progress = self.inner.progress.lock();
        progress.total_positions = positions.len();
        progress.positions_completed = 0;
        progress.samples_collected = 0;
        progress.measurements_failed = 0;
        self.sequence = positions;
        Ok(())
    }

    /// Load the calibrated grid as the measurement sequence
    pub fn initialize_from_calibration(&mut self) -> Result<usize, RigError> {
        let positions = self.calibration.grid_positions()?;
        let count = positions.len();
        self.initialize_measurement_sequence(positions)?;
        Ok(count)
    }

    pub fn sequence(&self) -> &[SamplingPosition] {
        &self.sequence
    }

    fn require_state(&self, expected: SamplingState, operation: &str) -> Result<(), RigError> {
        let state = self.state();
        if state != expected {
            warn!("Cannot {} from state {}", operation, state);
            return Err(RigError::State {
                state,
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Record the failure, enter `Error` and stop streaming
    fn fail(&self, e: RigError) -> RigError {
        error!("Acquisition failed: {}", e);
        self.inner.set_state(SamplingState::Error);
        if let Err(stop) = self.inner.velocimeter.stop_stream() {
            warn!("Could not stop stream after failure: {}", stop);
        }
        e
    }

    /// Open a new experiment for `z_plane` and start streaming
    pub fn start_acquisition(&mut self, z_plane: f64) -> Result<(), RigError> {
        self.require_state(SamplingState::Idle, "start acquisition")?;
        let run = self.set_z_plane(z_plane);
        self.inner.set_interrupt(false);

        if let Err(e) = self.sink.create_experiment(z_plane, run) {
            return Err(self.fail(e));
        }
        match self.inner.velocimeter.start_stream() {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.fail(RigError::Connection(
                    "velocimeter stream did not start".to_string(),
                )));
            }
            Err(e) => return Err(self.fail(e)),
        }

        self.inner.set_state(SamplingState::Sampling);
        info!("Acquisition started for Z={}, run={}", z_plane, run);
        Ok(())
    }

    pub fn pause_acquisition(&self) -> Result<(), RigError> {
        self.handle().pause()
    }

    pub fn resume_acquisition(&self) -> Result<(), RigError> {
        self.handle().resume()
    }

    pub fn emergency_stop(&self) {
        self.handle().emergency_stop()
    }

    /// Leave the terminal `Error` state
    pub fn reset(&mut self) -> Result<(), RigError> {
        self.require_state(SamplingState::Error, "reset")?;
        self.inner.set_interrupt(false);
        self.inner.set_state(SamplingState::Idle);
        Ok(())
    }

    pub fn begin_calibration(&mut self) -> Result<(), RigError> {
        self.require_state(SamplingState::Idle, "begin calibration")?;
        self.inner.set_interrupt(false);
        self.inner.set_state(SamplingState::Calibrating);
        Ok(())
    }

    pub fn finish_calibration(&mut self) -> Result<(), RigError> {
        self.require_state(SamplingState::Calibrating, "finish calibration")?;
        self.inner.set_state(SamplingState::Idle);
        Ok(())
    }

    /// Nudge the stage while calibrating
    pub fn jog(&self, dx: i32, dy: i32) -> Result<bool, RigError> {
        self.require_state(SamplingState::Calibrating, "jog")?;
        self.inner.stage.move_relative(MoveTarget::xy(dx, dy))
    }

    /// Drive to the calibrated home position and wait for the stage to settle
    pub fn return_home(&mut self) -> Result<(), RigError> {
        let state = self.state();
        if !matches!(state, SamplingState::Idle | SamplingState::Calibrating) {
            return Err(RigError::State {
                state,
                operation: "return home".to_string(),
            });
        }
        let home = self
            .calibration
            .home_position()
            .ok_or_else(|| RigError::Calibration("home position not set".to_string()))?;

        info!("Returning home to X={}, Y={}", home.x_steps, home.y_steps);
        self.inner.set_interrupt(false);
        if !self
            .inner
            .stage
            .move_absolute(MoveTarget::xy(home.x_steps, home.y_steps))?
        {
            return Err(RigError::InvalidCommand("home move rejected".to_string()));
        }
        self.synchronizer
            .wait_for_motion_complete(self.inner.stage.as_ref())
    }

    /// Read one sample, retrying silent reads and quality rejections with
    /// backoff. After the last attempt a rejected sample is returned flagged
    /// invalid instead of being dropped. `None` if nothing was read at all,
    /// or if the wait was interrupted.
    pub fn read_single_sample(&self) -> Result<Option<RawSample>, RigError> {
        let attempts = self.backoff.attempts();
        let mut rejected = None;

        for attempt in 0..attempts {
            match self.inner.velocimeter.read_sample()? {
                Some(mut sample) => {
                    if self.inner.velocimeter.validate_sample(&mut sample) {
                        return Ok(Some(sample));
                    }
                    debug!(
                        "Sample rejected: SNR={:.1}, Corr={:.1} (attempt {}/{})",
                        sample.snr,
                        sample.correlation,
                        attempt + 1,
                        attempts
                    );
                    rejected = Some(sample);
                }
                None => debug!("No sample (attempt {}/{})", attempt + 1, attempts),
            }

            if let Some(delay) = self.backoff.delay_after(attempt) {
                if !sleep_interruptible(delay, &self.inner.interrupt) {
                    return Ok(None);
                }
            }
        }

        warn!("No valid sample after {} retries", self.backoff.retries());
        Ok(rejected.map(|mut sample| {
            sample.valid = false;
            sample
        }))
    }

    /// Move to `position`, wait for the stage, then collect and record a burst.
    ///
    /// Position-level failures come back as [`PositionOutcome::Failed`]; only
    /// fatal errors (lost link, failing sink) are returned as `Err`, after
    /// the sampler has entered `Error`.
    pub fn sample_at_position(
        &mut self,
        position: &SamplingPosition,
    ) -> Result<PositionOutcome, RigError> {
        if self.inner.interrupted() {
            return Ok(PositionOutcome::Interrupted);
        }
        let state = self.state();
        if !state.is_active() {
            return Err(RigError::State {
                state,
                operation: "sample a position".to_string(),
            });
        }

        let result = self.measure(position);
        if self.inner.interrupted() {
            // A burst that finished collecting is still kept
            if let Ok(Some(record)) = result {
                return self.record(record);
            }
            info!(
                "Position X={}, Y={} interrupted, discarding",
                position.x_steps, position.y_steps
            );
            return Ok(PositionOutcome::Interrupted);
        }

        match result {
            Ok(Some(record)) => self.record(record),
            Ok(None) => Ok(PositionOutcome::Interrupted),
            Err(e) if e.is_fatal() => Err(self.fail(e)),
            Err(e) => {
                warn!(
                    "Position X={}, Y={} failed: {}",
                    position.x_steps, position.y_steps, e
                );
                self.inner.progress.lock().measurements_failed += 1;
                self.inner.emit(SamplerEvent::PositionFailed {
                    x_steps: position.x_steps,
                    y_steps: position.y_steps,
                    reason: e.to_string(),
                });
                Ok(PositionOutcome::Failed(e.to_string()))
            }
        }
    }

    fn record(&mut self, record: DataRecord) -> Result<PositionOutcome, RigError> {
        if let Err(e) = self.sink.append(&record) {
            return Err(self.fail(e));
        }

        let (completed, total) = {
            let mut progress = self.inner.progress.lock();
            progress.positions_completed += 1;
            progress.samples_collected += record.num_samples;
            (progress.positions_completed, progress.total_positions)
        };
        info!(
            "Sampled position {}/{}: Fr={:.2}, samples={}",
            completed, total, record.froude_number, record.num_samples
        );
        self.inner.emit(SamplerEvent::PositionSampled(record.clone()));
        Ok(PositionOutcome::Recorded(record))
    }

    /// Steps 1-7 of a position. `Ok(None)` when a pause or stop took over.
    fn measure(&self, position: &SamplingPosition) -> Result<Option<DataRecord>, RigError> {
        if !self.inner.transition(SamplingState::is_active, SamplingState::Moving) {
            return Ok(None);
        }

        info!("Moving to X={}, Y={}", position.x_steps, position.y_steps);
        let stage = self.inner.stage.as_ref();
        if !stage.move_absolute(MoveTarget::xy(position.x_steps, position.y_steps))? {
            return Err(RigError::InvalidCommand("move command rejected".to_string()));
        }
        self.synchronizer.wait_for_motion_complete(stage)?;
        self.synchronizer
            .verify_position_at_target(stage, position.x_steps, position.y_steps)?;

        if !self.inner.transition(SamplingState::is_active, SamplingState::Sampling) {
            return Ok(None);
        }
        self.collect_samples(position)
    }

    fn collect_samples(&self, position: &SamplingPosition) -> Result<Option<DataRecord>, RigError> {
        let started = Utc::now();
        let start = Instant::now();

        let seed = self.read_single_sample()?;
        if self.inner.interrupted() {
            return Ok(None);
        }
        let seed = match seed {
            Some(sample) if sample.valid => sample,
            _ => {
                return Err(RigError::QualityRejected(
                    "no valid seed sample for the Froude estimate".to_string(),
                ));
            }
        };

        let froude = froude_number(seed.velocity_magnitude(), seed.depth);
        let mut duration =
            adaptive_sampling_duration(froude, self.config.base_duration_s, self.config.max_duration_s);
        if position.in_roi {
            duration *= position.roi_density_multiplier;
        }
        let window = Duration::try_from_secs_f64(duration.max(0.0)).map_err(|_| {
            RigError::Calibration(format!("sampling window of {} s is out of range", duration))
        })?;
        let message = format!(
            "Fr={:.2} ({}) - {:.0}s sampling",
            froude,
            FlowRegime::from_froude(froude),
            duration
        );
        debug!("{}", message);
        self.inner.emit(SamplerEvent::Status(message));

        let mut samples = vec![seed];
        let mut limiter = RateLimiter::new(self.config.sample_rate_hz);
        limiter.wait();

        while start.elapsed() < window {
            limiter.wait();
            if self.inner.interrupted() {
                return Ok(None);
            }
            if let Some(sample) = self.read_single_sample()? {
                samples.push(sample);
            }
        }

        let context = RecordContext {
            z_plane: self.z_plane.unwrap_or_default(),
            run_number: self.run_number,
            froude_number: froude,
            started,
            duration: start.elapsed(),
        };
        Ok(Some(DataRecord::from_samples(position, context, &samples)))
    }

    /// Blocks while paused; returns the state that ended the wait
    fn wait_while_paused(&self) -> SamplingState {
        info!("Paused - waiting for resume");
        loop {
            let state = self.state();
            if state != SamplingState::Paused {
                return state;
            }
            std::thread::sleep(Duration::from_millis(self.config.pause_poll_ms));
        }
    }

    /// Work through the sequence in order.
    ///
    /// The state is checked before every position: a pause blocks until
    /// resume and then retries the interrupted position, an emergency stop
    /// ends the run early without error.
    pub fn run_measurement_sequence(&mut self) -> Result<SequenceSummary, RigError> {
        if self.sequence.is_empty() {
            error!("No measurement sequence initialized");
            return Err(RigError::InvalidCommand(
                "no measurement sequence initialized".to_string(),
            ));
        }
        info!(
            "Starting measurement sequence with {} positions",
            self.sequence.len()
        );

        let mut index = 0;
        let mut aborted = false;
        while index < self.sequence.len() {
            let mut state = self.state();
            if state == SamplingState::Paused {
                state = self.wait_while_paused();
            }
            match state {
                SamplingState::Idle => {
                    info!("Acquisition stopped");
                    aborted = true;
                    break;
                }
                SamplingState::Moving | SamplingState::Sampling => {}
                other => {
                    return Err(RigError::State {
                        state: other,
                        operation: "run the measurement sequence".to_string(),
                    });
                }
            }

            let position = self.sequence[index];
            match self.sample_at_position(&position)? {
                PositionOutcome::Recorded(_) | PositionOutcome::Failed(_) => index += 1,
                PositionOutcome::Interrupted => {
                    // Retried once the pause/stop has settled into its state
                    std::thread::sleep(Duration::from_millis(self.config.pause_poll_ms.min(10)));
                }
            }
        }

        let progress = self.inner.status();
        let summary = SequenceSummary {
            positions_completed: progress.positions_completed,
            measurements_failed: progress.measurements_failed,
            samples_collected: progress.samples_collected,
            aborted,
        };
        info!(
            "Sequence complete: {} positions, {} samples, {} failures",
            summary.positions_completed, summary.samples_collected, summary.measurements_failed
        );

        if let Err(e) = self.sink.finish() {
            return Err(self.fail(e));
        }
        if !aborted {
            if let Err(e) = self.inner.velocimeter.stop_stream() {
                warn!("Could not stop stream at end of sequence: {}", e);
            }
            self.inner.transition(SamplingState::is_active, SamplingState::Idle);
        }
        Ok(summary)
    }
}

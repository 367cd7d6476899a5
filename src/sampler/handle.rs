use crossbeam_channel::Receiver;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::events::{EventBus, SamplerEvent};
use crate::error::RigError;
use crate::stage::Stage;
use crate::types::SamplingState;
use crate::velocimeter::Velocimeter;

/// Counters reported by [`SamplerHandle::status`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SamplerStatus {
    pub state: SamplingState,
    pub z_plane: Option<f64>,
    pub run_number: u32,
    pub positions_completed: usize,
    pub total_positions: usize,
    pub samples_collected: usize,
    pub measurements_failed: usize,
}

/// State shared between the measurement loop and control handles
pub(crate) struct Inner<S, V> {
    pub stage: Arc<S>,
    pub velocimeter: Arc<V>,
    pub state: RwLock<SamplingState>,
    /// Raised by pause and emergency stop so blocking waits return early
    pub interrupt: Arc<AtomicBool>,
    pub events: EventBus,
    pub progress: Mutex<SamplerStatus>,
}

impl<S, V> Inner<S, V> {
    pub fn new(stage: Arc<S>, velocimeter: Arc<V>) -> Self {
        Self {
            stage,
            velocimeter,
            state: RwLock::new(SamplingState::Idle),
            interrupt: Arc::new(AtomicBool::new(false)),
            events: EventBus::default(),
            progress: Mutex::new(SamplerStatus {
                run_number: 1,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> SamplingState {
        *self.state.read()
    }

    pub fn set_state(&self, next: SamplingState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            info!("State {} -> {}", previous, next);
        }
        self.events.emit(SamplerEvent::StateChanged(next));
    }

    /// Move to `next` only if the current state satisfies `allowed`.
    ///
    /// The measurement loop uses this so it never overwrites a pause or stop
    /// issued from another thread.
    pub fn transition(&self, allowed: impl Fn(SamplingState) -> bool, next: SamplingState) -> bool {
        let mut state = self.state.write();
        if !allowed(*state) {
            return false;
        }
        let previous = std::mem::replace(&mut *state, next);
        drop(state);
        if previous != next {
            info!("State {} -> {}", previous, next);
        }
        self.events.emit(SamplerEvent::StateChanged(next));
        true
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn set_interrupt(&self, raised: bool) {
        self.interrupt.store(raised, Ordering::SeqCst);
    }

    pub fn emit(&self, event: SamplerEvent) {
        self.events.emit(event);
    }

    pub fn status(&self) -> SamplerStatus {
        SamplerStatus {
            state: self.state(),
            ..self.progress.lock().clone()
        }
    }
}

/// Cloneable control surface for a running [`Sampler`](super::Sampler).
///
/// Pause, resume and emergency stop may be issued from any thread while the
/// measurement loop runs; the loop observes them within one poll interval.
pub struct SamplerHandle<S, V> {
    pub(crate) inner: Arc<Inner<S, V>>,
}

impl<S, V> Clone for SamplerHandle<S, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Stage, V: Velocimeter> SamplerHandle<S, V> {
    pub fn state(&self) -> SamplingState {
        self.inner.state()
    }

    pub fn status(&self) -> SamplerStatus {
        self.inner.status()
    }

    pub fn subscribe(&self) -> Receiver<SamplerEvent> {
        self.inner.events.subscribe()
    }

    /// Halt motion and streaming, keeping everything recorded so far.
    /// Only valid while moving or sampling.
    pub fn pause(&self) -> Result<(), RigError> {
        let state = self.state();
        if !state.is_active() {
            warn!("Cannot pause from state {}", state);
            return Err(RigError::State {
                state,
                operation: "pause".to_string(),
            });
        }

        self.inner.set_interrupt(true);
        let stopped = self
            .inner
            .stage
            .stop_motion()
            .and_then(|_| self.inner.velocimeter.stop_stream().map(|_| ()));

        if let Err(e) = stopped {
            error!("Error pausing acquisition: {}", e);
            self.inner.set_state(SamplingState::Error);
            return Err(e);
        }

        if !self.inner.transition(SamplingState::is_active, SamplingState::Paused) {
            let state = self.state();
            warn!("Acquisition ended before the pause took effect ({})", state);
            return Err(RigError::State {
                state,
                operation: "pause".to_string(),
            });
        }
        info!("Acquisition paused");
        Ok(())
    }

    /// Restart the stream and continue where the sequence left off
    pub fn resume(&self) -> Result<(), RigError> {
        let state = self.state();
        if state != SamplingState::Paused {
            warn!("Cannot resume from state {}", state);
            return Err(RigError::State {
                state,
                operation: "resume".to_string(),
            });
        }

        match self.inner.velocimeter.start_stream() {
            Ok(true) => {}
            Ok(false) => {
                error!("Failed to restart velocimeter stream");
                return Err(RigError::Connection(
                    "velocimeter stream did not restart".to_string(),
                ));
            }
            Err(e) => {
                error!("Error resuming acquisition: {}", e);
                self.inner.set_state(SamplingState::Error);
                return Err(e);
            }
        }

        self.inner.set_interrupt(false);
        self.inner
            .transition(|s| s == SamplingState::Paused, SamplingState::Sampling);
        info!("Acquisition resumed");
        Ok(())
    }

    /// Kill motion, stop streaming and go idle, from any state
    pub fn emergency_stop(&self) {
        self.inner.set_interrupt(true);
        if let Err(e) = self.inner.stage.kill_motion() {
            error!("Kill motion failed during emergency stop: {}", e);
        }
        if let Err(e) = self.inner.velocimeter.stop_stream() {
            error!("Stopping stream failed during emergency stop: {}", e);
        }
        self.inner.set_state(SamplingState::Idle);
        warn!("Emergency stop executed");
    }
}

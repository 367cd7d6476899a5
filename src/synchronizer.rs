//! Motion/sampling ordering: nothing is sampled until the controller says the
//! move is done *and* the reported position is within tolerance of the target.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::RigError;
use crate::stage::Stage;
use crate::types::{MotionStatus, MotorPosition};
use crate::utils::{PollError, poll_until, poll_with_timeout};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_ms: u64,
    pub motion_timeout_ms: u64,
    /// Allowed deviation per axis, in steps
    pub position_tolerance: u32,
    pub verify_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            motion_timeout_ms: 60_000,
            position_tolerance: 1,
            verify_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

pub struct Synchronizer {
    config: SyncConfig,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Synchronizer {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            interrupt: None,
        }
    }

    /// Abort waits with [`RigError::Interrupted`] once `flag` is raised
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn check_interrupt(&self) -> Result<(), RigError> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(RigError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Poll the stage until it reports ready.
    ///
    /// A fault, an unreadable status or a failed query ends the wait at once.
    pub fn wait_for_motion_complete<S: Stage + ?Sized>(&self, stage: &S) -> Result<(), RigError> {
        let timeout = self.config.motion_timeout();
        let result = poll_until(
            || {
                self.check_interrupt()?;
                match stage.motion_status()? {
                    MotionStatus::Ready => Ok(true),
                    MotionStatus::Busy => Ok(false),
                    MotionStatus::Unknown(raw) => Err(RigError::MotionFault(raw)),
                }
            },
            timeout,
            self.config.poll_interval(),
        );

        match result {
            Ok(()) => {
                debug!("Motion complete");
                Ok(())
            }
            Err(PollError::Timeout) => {
                warn!("Motion did not complete within {:?}", timeout);
                Err(RigError::MotionTimeout(timeout))
            }
            Err(PollError::ConditionError(e)) => Err(e),
        }
    }

    /// Poll the reported position until both axes are within tolerance.
    ///
    /// Failed position queries are tolerated until the timeout.
    pub fn verify_position_at_target<S: Stage + ?Sized>(
        &self,
        stage: &S,
        target_x: i32,
        target_y: i32,
    ) -> Result<MotorPosition, RigError> {
        let tolerance = self.config.position_tolerance;
        let mut last = None;

        let result = poll_with_timeout(
            || {
                self.check_interrupt()?;
                match stage.position() {
                    Ok(pos) => {
                        last = Some(pos);
                        let (ex, ey) = pos.xy_error(target_x, target_y);
                        Ok((ex <= tolerance && ey <= tolerance).then_some(pos))
                    }
                    Err(e) => {
                        debug!("Position query failed, still polling: {}", e);
                        Ok(None)
                    }
                }
            },
            self.config.verify_timeout(),
            self.config.poll_interval(),
        );

        match result {
            Ok(Some(pos)) => {
                info!("Position verified at X={}, Y={}", pos.x, pos.y);
                Ok(pos)
            }
            Ok(None) => {
                warn!(
                    "Position not verified at X={}, Y={} (last {:?})",
                    target_x, target_y, last
                );
                Err(RigError::PositionVerifyTimeout {
                    target_x,
                    target_y,
                    last,
                })
            }
            Err(PollError::ConditionError(e)) => Err(e),
            Err(PollError::Timeout) => Err(RigError::PositionVerifyTimeout {
                target_x,
                target_y,
                last,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStage;
    use std::time::Instant;

    fn sync() -> Synchronizer {
        Synchronizer::new(SyncConfig {
            poll_interval_ms: 10,
            motion_timeout_ms: 500,
            position_tolerance: 1,
            verify_timeout_ms: 200,
        })
    }

    #[test]
    fn test_waits_through_busy_polls() {
        let stage = FakeStage::new();
        for _ in 0..5 {
            stage.queue_status(MotionStatus::Busy);
        }
        stage.queue_status(MotionStatus::Ready);

        let start = Instant::now();
        sync().wait_for_motion_complete(&stage).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(stage.status_polls(), 6);
    }

    #[test]
    fn test_unknown_status_fails_immediately() {
        let stage = FakeStage::new();
        stage.queue_status(MotionStatus::Busy);
        stage.queue_status(MotionStatus::Unknown("F".into()));
        stage.queue_status(MotionStatus::Ready);

        let result = sync().wait_for_motion_complete(&stage);
        assert!(matches!(result, Err(RigError::MotionFault(raw)) if raw == "F"));
        assert_eq!(stage.status_polls(), 2);
    }

    #[test]
    fn test_motion_timeout() {
        let stage = FakeStage::new();
        stage.set_default_status(MotionStatus::Busy);

        let result = sync().wait_for_motion_complete(&stage);
        assert!(matches!(result, Err(RigError::MotionTimeout(_))));
    }

    #[test]
    fn test_interrupt_aborts_wait() {
        let stage = FakeStage::new();
        stage.set_default_status(MotionStatus::Busy);
        let flag = Arc::new(AtomicBool::new(true));

        let result = sync()
            .with_interrupt(flag)
            .wait_for_motion_complete(&stage);
        assert!(matches!(result, Err(RigError::Interrupted)));
    }

    #[test]
    fn test_verify_tolerates_query_failures() {
        let stage = FakeStage::new();
        stage.set_position(MotorPosition::new(4601, 9199));
        stage.fail_position_queries(3);

        let pos = sync().verify_position_at_target(&stage, 4600, 9200).unwrap();
        assert_eq!(pos, MotorPosition::new(4601, 9199));
    }

    #[test]
    fn test_verify_times_out_outside_tolerance() {
        let stage = FakeStage::new();
        stage.set_position(MotorPosition::new(4602, 9200));

        match sync().verify_position_at_target(&stage, 4600, 9200) {
            Err(RigError::PositionVerifyTimeout { last, .. }) => {
                assert_eq!(last, Some(MotorPosition::new(4602, 9200)))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

//! Velmex VXC stepper-stage driver.
//!
//! The controller speaks single-line ASCII over serial. Commands are sent
//! with a configurable terminator (CR by default); queries answer with one
//! CR-terminated line, although some firmware sends bare bursts instead.
//! Motors are addressed by number: 1 = X, 2 = Y, 3 = Z, 4 = R.

pub mod motion;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::RigError;
use crate::link::{LinkState, PortSettings, SerialLink, SerialPortTransport, Transport};
use crate::types::{MotionStatus, MotorPosition, MoveTarget};
use crate::utils::Backoff;

/// Generic queries tried after the configured handshake commands
pub const FALLBACK_HANDSHAKES: [&str; 4] = ["?V", "P", "F", "V"];

/// Stage driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Appended to every command
    pub line_terminator: String,
    /// How long to wait for a single response line
    pub response_timeout_ms: u64,
    /// Tried in order on connect, before [`FALLBACK_HANDSHAKES`]
    pub handshake_commands: Vec<String>,
    /// Backoff between command attempts
    pub retry_delays_ms: Vec<u64>,
    /// Pause after opening the port while the controller wakes up
    pub settle_ms: u64,
    /// Speed used for index moves (steps/s, 1-6000)
    pub speed: u32,
    /// Acceleration used for index moves (1-127)
    pub acceleration: u32,
    pub motion_poll_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: "COM8".to_string(),
            baud_rate: 9600,
            line_terminator: "\r".to_string(),
            response_timeout_ms: 1000,
            handshake_commands: vec!["V".to_string(), "X".to_string()],
            retry_delays_ms: vec![500, 1000, 2000],
            settle_ms: 500,
            speed: 2000,
            acceleration: 2,
            motion_poll_ms: 100,
        }
    }
}

impl StageConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::from_millis(&self.retry_delays_ms)
    }
}

/// Operations the measurement layer needs from a positioning stage.
///
/// Implemented by [`StageDriver`]; tests substitute in-memory stages.
pub trait Stage: Send + Sync {
    /// Command an absolute move. `Ok(false)` when no axis was given.
    fn move_absolute(&self, target: MoveTarget) -> Result<bool, RigError>;

    /// Command a relative move. `Ok(false)` when no axis was given.
    fn move_relative(&self, delta: MoveTarget) -> Result<bool, RigError>;

    /// Current X/Y position. Callers poll this against their own deadline,
    /// so implementations should not retry internally.
    fn position(&self) -> Result<MotorPosition, RigError>;

    fn motion_status(&self) -> Result<MotionStatus, RigError>;

    /// Decelerate to a stop
    fn stop_motion(&self) -> Result<(), RigError>;

    /// Stop immediately
    fn kill_motion(&self) -> Result<(), RigError> {
        self.stop_motion()
    }
}

/// Protocol client for the two-axis stepper controller.
///
/// The link sits behind a mutex so only one command/response dialogue is
/// ever in flight, whichever thread issues it.
pub struct StageDriver {
    config: StageConfig,
    backoff: Backoff,
    link: Mutex<LinkState>,
    position: Mutex<MotorPosition>,
}

impl StageDriver {
    pub fn new(config: StageConfig) -> Self {
        let backoff = config.backoff();
        Self {
            config,
            backoff,
            link: Mutex::new(LinkState::Closed),
            position: Mutex::new(MotorPosition::default()),
        }
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_open()
    }

    /// Last known step counters, without touching the link
    pub fn cached_position(&self) -> MotorPosition {
        *self.position.lock()
    }

    /// Open the configured serial port and verify the controller answers
    pub fn connect(&self) -> Result<(), RigError> {
        info!(
            "Connecting to stage on {} @ {} baud",
            self.config.port, self.config.baud_rate
        );
        let transport = SerialPortTransport::open(&self.config.port_settings())?;
        std::thread::sleep(Duration::from_millis(self.config.settle_ms));
        self.connect_with(Box::new(transport))
    }

    /// Attach an already-open transport and run the handshake.
    ///
    /// Fails with [`RigError::Connection`] when no handshake command gets an answer; the
    /// link is left closed in that case.
    pub fn connect_with(&self, transport: Box<dyn Transport>) -> Result<(), RigError> {
        let mut link = SerialLink::new(
            format!("stage:{}", self.config.port),
            transport,
            self.config.line_terminator.clone(),
            Duration::from_millis(self.config.response_timeout_ms),
        );
        link.clear_input()?;
        *self.link.lock() = LinkState::Open(link);

        match self.verify_connection() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.link.lock().take();
                Err(e)
            }
        }
    }

    fn verify_connection(&self) -> Result<(), RigError> {
        let candidates = self
            .config
            .handshake_commands
            .iter()
            .map(String::as_str)
            .chain(FALLBACK_HANDSHAKES);

        for command in candidates {
            match self.send_command(command) {
                Ok(response) => {
                    info!("Stage verified with '{}' -> {:?}", command, response);
                    return Ok(());
                }
                Err(e) => debug!("Handshake '{}' failed: {}", command, e),
            }
        }

        Err(RigError::Connection(format!(
            "no response to any handshake command on {}",
            self.config.port
        )))
    }

    /// Kill motion and close the link
    pub fn disconnect(&self) -> Result<(), RigError> {
        if !self.is_connected() {
            return Ok(());
        }
        if let Err(e) = self.kill_motion() {
            warn!("Kill before disconnect failed: {}", e);
        }
        self.link.lock().take();
        info!("Stage disconnected");
        Ok(())
    }

    /// Send a query and return its response line.
    ///
    /// Retries with the configured backoff when no reply arrives. Surfaces
    /// [`RigError::CommandTimeout`] once the schedule is exhausted, or
    /// [`RigError::Connection`] if every attempt failed at the port level.
    pub fn send_command(&self, command: &str) -> Result<String, RigError> {
        self.dialogue(command, true, &self.backoff)
            .map(|response| response.unwrap_or_default())
    }

    /// Send a command that produces no reply, retrying write failures
    pub fn send_only(&self, command: &str) -> Result<(), RigError> {
        self.dialogue(command, false, &self.backoff).map(|_| ())
    }

    fn dialogue(
        &self,
        command: &str,
        expect_response: bool,
        backoff: &Backoff,
    ) -> Result<Option<String>, RigError> {
        let attempts = backoff.attempts();
        let mut io_failures = 0;

        for attempt in 0..attempts {
            let outcome = {
                let mut guard = self.link.lock();
                let link = guard.link_mut()?;
                if expect_response {
                    link.request(command)
                } else {
                    link.send_line(command).map(|_| Some(String::new()))
                }
            };

            match outcome {
                Ok(Some(response)) => {
                    debug!("'{}' -> {:?}", command, response);
                    return Ok(Some(response));
                }
                Ok(None) => debug!(
                    "No response to '{}' (attempt {}/{})",
                    command,
                    attempt + 1,
                    attempts
                ),
                Err(e) => {
                    io_failures += 1;
                    warn!(
                        "Serial error on '{}' (attempt {}/{}): {}",
                        command,
                        attempt + 1,
                        attempts,
                        e
                    );
                }
            }

            if let Some(delay) = backoff.delay_after(attempt) {
                std::thread::sleep(delay);
            }
        }

        if io_failures == attempts {
            Err(RigError::Connection(format!(
                "serial link failed for every attempt of '{}'",
                command
            )))
        } else {
            Err(RigError::CommandTimeout {
                command: command.to_string(),
                attempts,
            })
        }
    }

    pub(crate) fn update_cache(&self, f: impl FnOnce(&mut MotorPosition)) {
        f(&mut *self.position.lock());
    }
}

impl Stage for StageDriver {
    fn move_absolute(&self, target: MoveTarget) -> Result<bool, RigError> {
        StageDriver::move_absolute(self, target)
    }

    fn move_relative(&self, delta: MoveTarget) -> Result<bool, RigError> {
        StageDriver::move_relative(self, delta)
    }

    fn position(&self) -> Result<MotorPosition, RigError> {
        self.poll_position()
    }

    fn motion_status(&self) -> Result<MotionStatus, RigError> {
        self.is_motion_complete()
    }

    fn stop_motion(&self) -> Result<(), RigError> {
        StageDriver::stop_motion(self)
    }

    fn kill_motion(&self) -> Result<(), RigError> {
        StageDriver::kill_motion(self)
    }
}

impl Drop for StageDriver {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

//! Acoustic Doppler velocimeter streaming driver.
//!
//! After the start token the sensor emits one comma-separated line per sample
//! at roughly 10 Hz until it receives the stop token.

pub mod parse;

use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use parse::{parse_sample_line, validate_sample};

use crate::error::RigError;
use crate::link::{PortSettings, SerialLink, SerialPortTransport, Transport};
use crate::types::RawSample;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocimeterConfig {
    pub port: String,
    pub baud_rate: u32,
    pub line_terminator: String,
    pub read_timeout_ms: u64,
    pub start_command: String,
    pub stop_command: String,
    pub expected_fields: usize,
    /// Minimum signal-to-noise ratio (dB)
    pub min_snr: f64,
    /// Minimum correlation (%)
    pub min_correlation: f64,
    pub start_settle_ms: u64,
    pub stop_settle_ms: u64,
}

impl Default for VelocimeterConfig {
    fn default() -> Self {
        Self {
            port: "COM4".to_string(),
            baud_rate: 9600,
            line_terminator: "\r".to_string(),
            read_timeout_ms: 2000,
            start_command: "START".to_string(),
            stop_command: "STOP".to_string(),
            expected_fields: 8,
            min_snr: 5.0,
            min_correlation: 70.0,
            start_settle_ms: 500,
            stop_settle_ms: 200,
        }
    }
}

impl VelocimeterConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
        }
    }

    pub fn quality(&self) -> QualityThresholds {
        QualityThresholds {
            min_snr: self.min_snr,
            min_correlation: self.min_correlation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub min_snr: f64,
    pub min_correlation: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        VelocimeterConfig::default().quality()
    }
}

/// Operations the measurement layer needs from a velocity sensor
pub trait Velocimeter: Send + Sync {
    fn start_stream(&self) -> Result<bool, RigError>;

    fn stop_stream(&self) -> Result<bool, RigError>;

    /// Next parsed sample. `Ok(None)` for a silent read or a malformed line.
    fn read_sample(&self) -> Result<Option<RawSample>, RigError>;

    fn quality(&self) -> QualityThresholds;

    /// Gate `sample` against this sensor's thresholds, updating its flag
    fn validate_sample(&self, sample: &mut RawSample) -> bool {
        let q = self.quality();
        validate_sample(sample, q.min_snr, q.min_correlation)
    }
}

/// Public view of the link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    Closed,
    Idle,
    Streaming,
}

enum SensorLink {
    Closed,
    Idle(SerialLink),
    Streaming(SerialLink),
}

impl SensorLink {
    fn state(&self) -> SensorState {
        match self {
            SensorLink::Closed => SensorState::Closed,
            SensorLink::Idle(_) => SensorState::Idle,
            SensorLink::Streaming(_) => SensorState::Streaming,
        }
    }

    fn streaming_link(&mut self) -> Result<&mut SerialLink, RigError> {
        match self {
            SensorLink::Streaming(link) => Ok(link),
            SensorLink::Idle(_) => Err(RigError::InvalidCommand(
                "velocimeter is not streaming".to_string(),
            )),
            SensorLink::Closed => Err(RigError::Connection(
                "velocimeter link is not open".to_string(),
            )),
        }
    }

    fn take(&mut self) -> Option<SerialLink> {
        match std::mem::replace(self, SensorLink::Closed) {
            SensorLink::Idle(link) | SensorLink::Streaming(link) => Some(link),
            SensorLink::Closed => None,
        }
    }
}

pub struct VelocimeterDriver {
    config: VelocimeterConfig,
    link: Mutex<SensorLink>,
}

impl VelocimeterDriver {
    pub fn new(config: VelocimeterConfig) -> Self {
        Self {
            config,
            link: Mutex::new(SensorLink::Closed),
        }
    }

    pub fn config(&self) -> &VelocimeterConfig {
        &self.config
    }

    pub fn state(&self) -> SensorState {
        self.link.lock().state()
    }

    pub fn connect(&self) -> Result<(), RigError> {
        info!(
            "Connecting to velocimeter on {} @ {} baud",
            self.config.port, self.config.baud_rate
        );
        let transport = SerialPortTransport::open(&self.config.port_settings())?;
        self.connect_with(Box::new(transport))
    }

    /// Attach an already-open transport. The sensor has no handshake; the
    /// first successful stream read is the real check.
    pub fn connect_with(&self, transport: Box<dyn Transport>) -> Result<(), RigError> {
        let mut link = SerialLink::new(
            format!("adv:{}", self.config.port),
            transport,
            self.config.line_terminator.clone(),
            Duration::from_millis(self.config.read_timeout_ms),
        );
        link.clear_input()?;
        *self.link.lock() = SensorLink::Idle(link);
        info!("Velocimeter connected on {}", self.config.port);
        Ok(())
    }

    /// Stop streaming if needed and close the link
    pub fn disconnect(&self) -> Result<(), RigError> {
        if self.state() == SensorState::Streaming {
            if let Err(e) = self.stop_stream() {
                error!("Error stopping stream during disconnect: {}", e);
            }
        }
        if self.link.lock().take().is_some() {
            info!("Velocimeter disconnected");
        }
        Ok(())
    }

    fn send_token(&self, token: &str, settle_ms: u64, next: SensorState) -> Result<bool, RigError> {
        let mut guard = self.link.lock();
        match &mut *guard {
            SensorLink::Idle(link) | SensorLink::Streaming(link) => link.send_line(token)?,
            SensorLink::Closed => {
                warn!("Velocimeter not connected, cannot send {}", token);
                return Ok(false);
            }
        }

        if let Some(link) = guard.take() {
            *guard = match next {
                SensorState::Streaming => SensorLink::Streaming(link),
                _ => SensorLink::Idle(link),
            };
        }
        drop(guard);

        std::thread::sleep(Duration::from_millis(settle_ms));
        Ok(true)
    }

    /// Send the start token and switch to streaming
    pub fn start_stream(&self) -> Result<bool, RigError> {
        if self.state() == SensorState::Streaming {
            return Ok(true);
        }
        let started = self.send_token(
            &self.config.start_command,
            self.config.start_settle_ms,
            SensorState::Streaming,
        )?;
        if started {
            info!("Velocimeter streaming started");
        }
        Ok(started)
    }

    pub fn stop_stream(&self) -> Result<bool, RigError> {
        let stopped = self.send_token(
            &self.config.stop_command,
            self.config.stop_settle_ms,
            SensorState::Idle,
        )?;
        if stopped {
            info!("Velocimeter streaming stopped");
        }
        Ok(stopped)
    }

    /// One raw line from the stream, `None` if the read timed out
    pub fn read_raw_line(&self) -> Result<Option<String>, RigError> {
        let mut guard = self.link.lock();
        let link = guard.streaming_link()?;
        Ok(link.read_line()?)
    }

    pub fn read_sample(&self) -> Result<Option<RawSample>, RigError> {
        let Some(text) = self.read_raw_line()? else {
            return Ok(None);
        };
        match parse_sample_line(&text, self.config.expected_fields) {
            Ok(sample) => Ok(Some(sample)),
            Err(e) => {
                warn!("Discarding line: {}", e);
                Ok(None)
            }
        }
    }

    /// Read `count` lines and keep only those that pass the quality gate
    pub fn read_burst(&self, count: usize) -> Result<Vec<RawSample>, RigError> {
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            match self.read_sample()? {
                Some(mut sample) => {
                    if Velocimeter::validate_sample(self, &mut sample) {
                        samples.push(sample);
                    } else {
                        warn!("Invalid sample received");
                    }
                }
                None => warn!("No sample received"),
            }
        }
        Ok(samples)
    }

    /// Drop any buffered input
    pub fn flush_buffer(&self) -> Result<(), RigError> {
        match &mut *self.link.lock() {
            SensorLink::Idle(link) | SensorLink::Streaming(link) => Ok(link.clear_input()?),
            SensorLink::Closed => Ok(()),
        }
    }
}

impl Velocimeter for VelocimeterDriver {
    fn start_stream(&self) -> Result<bool, RigError> {
        VelocimeterDriver::start_stream(self)
    }

    fn stop_stream(&self) -> Result<bool, RigError> {
        VelocimeterDriver::stop_stream(self)
    }

    fn read_sample(&self) -> Result<Option<RawSample>, RigError> {
        VelocimeterDriver::read_sample(self)
    }

    fn quality(&self) -> QualityThresholds {
        self.config.quality()
    }
}

impl Drop for VelocimeterDriver {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockTransport;

    fn connected(transport: &MockTransport) -> VelocimeterDriver {
        let driver = VelocimeterDriver::new(VelocimeterConfig {
            read_timeout_ms: 30,
            start_settle_ms: 0,
            stop_settle_ms: 0,
            ..Default::default()
        });
        driver.connect_with(Box::new(transport.clone())).unwrap();
        driver
    }

    #[test]
    fn test_stream_lifecycle() {
        let transport = MockTransport::new();
        let driver = connected(&transport);
        assert_eq!(driver.state(), SensorState::Idle);

        assert!(driver.start_stream().unwrap());
        assert_eq!(driver.state(), SensorState::Streaming);
        assert!(driver.stop_stream().unwrap());
        assert_eq!(driver.state(), SensorState::Idle);

        driver.start_stream().unwrap();
        driver.disconnect().unwrap();
        assert_eq!(driver.state(), SensorState::Closed);
        assert_eq!(transport.commands(), vec!["START", "STOP", "START", "STOP"]);
        assert!(!driver.start_stream().unwrap());
    }

    #[test]
    fn test_read_requires_streaming() {
        let transport = MockTransport::new();
        let driver = connected(&transport);
        assert!(matches!(
            driver.read_sample(),
            Err(RigError::InvalidCommand(_))
        ));

        let closed = VelocimeterDriver::new(VelocimeterConfig::default());
        assert!(matches!(closed.read_sample(), Err(RigError::Connection(_))));
    }

    #[test]
    fn test_read_sample_distinguishes_silence_and_garbage() {
        let transport = MockTransport::new();
        let driver = connected(&transport);
        driver.start_stream().unwrap();

        transport.feed("0.1,0.2,0.0,30,90,0.4,150,16\r\n");
        let sample = driver.read_sample().unwrap().unwrap();
        assert_eq!(sample.depth, 0.4);

        transport.feed("0.1,0.2\r\n");
        assert_eq!(driver.read_sample().unwrap(), None);
        assert_eq!(driver.read_sample().unwrap(), None);
    }

    #[test]
    fn test_read_burst_keeps_valid_samples() {
        let transport = MockTransport::new();
        let driver = connected(&transport);
        driver.start_stream().unwrap();

        transport.feed("0.1,0,0,30,90,0.4,150,16\r");
        transport.feed("0.1,0,0,2,90,0.4,150,16\r");
        transport.feed("junk\r");
        transport.feed("0.2,0,0,30,95,0.4,150,16\r");

        let burst = driver.read_burst(4).unwrap();
        assert_eq!(burst.len(), 2);
        assert!(burst.iter().all(|s| s.valid));
    }

    #[test]
    fn test_flush_buffer_discards_backlog() {
        let transport = MockTransport::new();
        let driver = connected(&transport);
        driver.start_stream().unwrap();
        transport.feed("0.1,0,0,30,90,0.4,150,16\r");

        driver.flush_buffer().unwrap();
        assert_eq!(driver.read_raw_line().unwrap(), None);
    }
}

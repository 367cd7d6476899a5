use std::time::Duration;

use thiserror::Error;

use crate::types::{MotorPosition, SamplingState};

#[derive(Error, Debug)]
pub enum RigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Command '{command}' got no response after {attempts} attempts")]
    CommandTimeout { command: String, attempts: usize },
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),
    #[error("Sample rejected: {0}")]
    QualityRejected(String),
    #[error("Motion did not complete within {0:?}")]
    MotionTimeout(Duration),
    #[error("Position not verified at X={target_x}, Y={target_y} (last seen: {last:?})")]
    PositionVerifyTimeout {
        target_x: i32,
        target_y: i32,
        last: Option<MotorPosition>,
    },
    #[error("Controller reported fault or unknown status: {0}")]
    MotionFault(String),
    #[error("Cannot {operation} while {state}")]
    State {
        state: SamplingState,
        operation: String,
    },
    #[error("Calibration error: {0}")]
    Calibration(String),
    #[error("Data sink error: {0}")]
    Sink(String),
    #[error("Operation interrupted")]
    Interrupted,
}

impl RigError {
    /// Errors that end the current run rather than a single position.
    ///
    /// A closed or vanished link and a failing log sink cannot be retried
    /// around; everything else is reported against the position it hit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RigError::Connection(_) | RigError::Serial(_) | RigError::Sink(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RigError::Connection("port gone".into()).is_fatal());
        assert!(RigError::Sink("disk full".into()).is_fatal());
        assert!(!RigError::MotionTimeout(Duration::from_secs(60)).is_fatal());
        assert!(
            !RigError::CommandTimeout {
                command: "V".into(),
                attempts: 4
            }
            .is_fatal()
        );
        assert!(!RigError::Interrupted.is_fatal());
    }

    #[test]
    fn test_state_error_message() {
        let err = RigError::State {
            state: SamplingState::Idle,
            operation: "pause".into(),
        };
        assert_eq!(err.to_string(), "Cannot pause while idle");
    }
}

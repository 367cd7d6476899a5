pub mod calibration;
pub mod config;
pub mod error;
pub mod flow;
pub mod link;
pub mod logger;
pub mod record;
pub mod sampler;
pub mod sink;
pub mod stage;
pub mod synchronizer;
pub mod types;
pub mod utils;
pub mod velocimeter;

#[cfg(test)]
pub(crate) mod testing;

pub use calibration::{CalibrationManager, CalibrationPoint, GridDefinition, RoiZone, StepPoint};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::RigError;
pub use flow::{FlowRegime, adaptive_sampling_duration, froude_number};
pub use logger::{ExperimentLogger, Logger};
pub use record::DataRecord;
pub use sampler::{
    PositionOutcome, Sampler, SamplerConfig, SamplerEvent, SamplerHandle, SamplerStatus,
    SequenceSummary,
};
pub use sink::{DataSink, MemorySink};
pub use stage::{Stage, StageConfig, StageDriver};
pub use synchronizer::{SyncConfig, Synchronizer};
pub use types::{
    Axis, ControllerStatus, MotionStatus, MotorPosition, MoveTarget, RawSample,
    SamplingPosition, SamplingState,
};
pub use velocimeter::{QualityThresholds, SensorState, Velocimeter, VelocimeterConfig, VelocimeterDriver};

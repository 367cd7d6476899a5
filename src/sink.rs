use log::info;

use crate::error::RigError;
use crate::record::DataRecord;

/// Destination for finished records. The sampler never touches files itself.
pub trait DataSink: Send {
    /// Open a new experiment for one Z-plane/run
    fn create_experiment(&mut self, z_plane: f64, run_number: u32) -> Result<(), RigError>;

    fn append(&mut self, record: &DataRecord) -> Result<(), RigError>;

    /// Flush and close the current experiment
    fn finish(&mut self) -> Result<(), RigError> {
        Ok(())
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    experiments: Vec<(f64, u32)>,
    records: Vec<DataRecord>,
    fail_appends: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiments(&self) -> &[(f64, u32)] {
        &self.experiments
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    /// Make every following append fail, as a full disk would
    pub fn fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }
}

impl DataSink for MemorySink {
    fn create_experiment(&mut self, z_plane: f64, run_number: u32) -> Result<(), RigError> {
        info!("Experiment Z={} run={}", z_plane, run_number);
        self.experiments.push((z_plane, run_number));
        Ok(())
    }

    fn append(&mut self, record: &DataRecord) -> Result<(), RigError> {
        if self.fail_appends {
            return Err(RigError::Sink("append rejected".to_string()));
        }
        self.records.push(record.clone());
        Ok(())
    }
}

impl<T: DataSink + ?Sized> DataSink for Box<T> {
    fn create_experiment(&mut self, z_plane: f64, run_number: u32) -> Result<(), RigError> {
        (**self).create_experiment(z_plane, run_number)
    }

    fn append(&mut self, record: &DataRecord) -> Result<(), RigError> {
        (**self).append(record)
    }

    fn finish(&mut self) -> Result<(), RigError> {
        (**self).finish()
    }
}

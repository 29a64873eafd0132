//! Diagnostic output of intermediate matrices.
//!
//! The window BA hands its Jacobian and covariance to an optional
//! [`DiagnosticsSink`]. Failing to record is never fatal: callers log a
//! warning and carry on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use nalgebra::DMatrix;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::OptimizerResult;

pub trait DiagnosticsSink: Send + Sync {
    fn record_matrix(&self, name: &str, matrix: &DMatrix<f64>) -> OptimizerResult<()>;
}

/// Records `matrix` and downgrades a failure to a warning.
pub(crate) fn record_or_warn(sink: Option<&dyn DiagnosticsSink>, name: &str, matrix: &DMatrix<f64>) {
    let Some(sink) = sink else {
        return;
    };
    if let Err(err) = sink.record_matrix(name, matrix) {
        warn!("Could not record diagnostic {}: {}", name, err);
    }
}

/// Writes each matrix to `<dir>/<name>.csv`, one matrix row per line.
#[derive(Debug, Clone)]
pub struct CsvDiagnosticsSink {
    dir: PathBuf,
}

impl CsvDiagnosticsSink {
    pub fn new(dir: impl AsRef<Path>) -> OptimizerResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.csv"))
    }
}

impl DiagnosticsSink for CsvDiagnosticsSink {
    fn record_matrix(&self, name: &str, matrix: &DMatrix<f64>) -> OptimizerResult<()> {
        let path = self.path_for(name);
        let mut writer = WriterBuilder::new().has_headers(false).from_path(&path)?;
        for row in matrix.row_iter() {
            writer.write_record(row.iter().map(|v| v.to_string()))?;
        }
        writer.flush()?;
        debug!("Wrote {}x{} {} to {}", matrix.nrows(), matrix.ncols(), name, path.display());
        Ok(())
    }
}

/// Keeps the last matrix recorded under each name.
#[derive(Default)]
pub struct MemoryDiagnosticsSink {
    matrices: Mutex<BTreeMap<String, DMatrix<f64>>>,
}

impl MemoryDiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<DMatrix<f64>> {
        self.matrices.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.matrices.lock().keys().cloned().collect()
    }
}

impl DiagnosticsSink for MemoryDiagnosticsSink {
    fn record_matrix(&self, name: &str, matrix: &DMatrix<f64>) -> OptimizerResult<()> {
        self.matrices.lock().insert(name.to_string(), matrix.clone());
        Ok(())
    }
}

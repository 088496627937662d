use std::ffi::OsStr;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::Path;

use csv::Writer;

use crate::error::StageflowError;
use crate::log::info;

/// Population of every compartment at every completed iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResults {
    /// Calendar time of each iteration.
    pub time: Vec<f64>,
    /// One series per compartment, in output order, each aligned with `time`.
    pub series: Vec<(String, Vec<f64>)>,
}

impl SimulationResults {
    #[must_use]
    pub fn series(&self, name: &str) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|(series_name, _)| series_name == name)
            .map(|(_, values)| values.as_slice())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

// Checks that the path is a CSV file and creates its parent directories.
fn generate_validate_filepath(path: &Path) -> Result<File, StageflowError> {
    match path.extension().and_then(OsStr::to_str) {
        Some("csv") => {
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            Ok(File::create(path)?)
        }
        _ => Err(StageflowError::ConfigError(format!(
            "output file {} must be a CSV",
            path.display()
        ))),
    }
}

/// Writes `results` to `writer` as CSV with a `Time` column followed by one column per
/// compartment.
///
/// # Errors
///
/// Returns `StageflowError::CsvError` or `StageflowError::IoError` if writing fails.
pub fn write_results_to<W: Write>(writer: W, results: &SimulationResults) -> Result<(), StageflowError> {
    let mut writer = Writer::from_writer(writer);
    let header = std::iter::once("Time").chain(results.series.iter().map(|(name, _)| name.as_str()));
    writer.write_record(header)?;
    for (row, time) in results.time.iter().enumerate() {
        let values = results
            .series
            .iter()
            .map(|(_, values)| values.get(row).copied().unwrap_or(f64::NAN));
        let record: Vec<String> = std::iter::once(*time)
            .chain(values)
            .map(|value| value.to_string())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `results` to the CSV file at `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns `StageflowError::ConfigError` if `path` is not a `.csv` file, or an I/O or CSV error
/// if writing fails.
pub fn write_results(path: &Path, results: &SimulationResults) -> Result<(), StageflowError> {
    let file = generate_validate_filepath(path)?;
    write_results_to(file, results)?;
    info!("wrote {} rows to {}", results.len(), path.display());
    Ok(())
}

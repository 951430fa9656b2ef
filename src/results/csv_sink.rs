//! CSV result sink.
//!
//! One file per result set, named `<qualified_name>_<timestamp>.csv`. The
//! run metadata and step log are written first as `# `-prefixed JSON lines,
//! followed by the sample table.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::info;

use crate::error::{HarnessError, HarnessResult};
use crate::results::{ExportReceipt, ResultSet, ResultSink};

/// Writes result sets as CSV files under a directory.
#[derive(Debug, Clone)]
pub struct CsvResultSink {
    output_dir: PathBuf,
}

impl CsvResultSink {
    /// Sink writing into `output_dir` (created on first export).
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Directory files are written to.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_metadata(file: &mut File, result: &ResultSet) -> HarnessResult<()> {
        let metadata = json!({
            "run_id": result.run_id,
            "scenario": result.scenario_key,
            "scenario_name": result.scenario_name,
            "iteration": result.iteration_index,
            "iterations": result.iteration_count,
            "output_rate_hz": result.output_rate,
            "unit": result.unit.suffix(),
            "started_at": result.started_at.to_rfc3339(),
            "steps": result.steps,
        });
        let json_string = serde_json::to_string_pretty(&metadata)
            .map_err(|e| HarnessError::Export(e.to_string()))?;

        for line in json_string.lines() {
            file.write_all(b"# ")?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl ResultSink for CsvResultSink {
    fn export(&self, result: &ResultSet) -> HarnessResult<ExportReceipt> {
        fs::create_dir_all(&self.output_dir)?;

        let name = result.qualified_name();
        let file_name = format!(
            "{}_{}.csv",
            name,
            result.started_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.output_dir.join(file_name);

        let mut file = File::create(&path)?;
        Self::write_metadata(&mut file, result)?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(result.header())?;

        let mut rows = 0;
        for (index, values) in result.rows() {
            let record = std::iter::once(index.to_string())
                .chain(values.iter().map(|v| format!("{v:.6}")));
            writer.write_record(record)?;
            rows += 1;
        }
        writer.flush()?;

        info!(path = %path.display(), rows, "Result exported");
        Ok(ExportReceipt {
            name,
            location: Some(path),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::fixtures::result_set;

    #[test]
    fn test_writes_header_rows_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::new(dir.path().join("out"));

        let receipt = sink.export(&result_set(2, 3)).unwrap();
        assert_eq!(receipt.name, "screen_onoff_iter02");
        assert_eq!(receipt.rows, 3);

        let path = receipt.location.unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("screen_onoff_iter02_"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("# "));
        assert!(content.contains("\"iteration\": 2"));

        let table: Vec<&str> = content.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(table[0], "elapsed_index,VBAT (mA),VDD_MAIN (mA)");
        assert_eq!(table[1], "0,100.000000,10.000000");
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_iterations_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvResultSink::new(dir.path());

        let first = sink.export(&result_set(1, 2)).unwrap();
        let second = sink.export(&result_set(2, 2)).unwrap();
        assert_ne!(first.location, second.location);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}

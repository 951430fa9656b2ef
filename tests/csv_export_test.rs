//! CSV export of a full run into a temporary directory.

#![cfg(feature = "storage_csv")]

mod common;

use std::fs;
use std::sync::Arc;

use common::{fast_config, idle_scenario, ms};
use power_harness::experiment::{HarnessContext, RunEngine, RunStatus};
use power_harness::hardware::{MockMode, SimulatedHandset, SimulatedPowerSupply};
use power_harness::results::CsvResultSink;
use power_harness::scenario::ScenarioRegistry;
use power_harness::acquisition::SyntheticAcquisition;
use tempfile::TempDir;

fn csv_engine(dir: &TempDir) -> RunEngine {
    let registry = ScenarioRegistry::builder()
        .scenario("idle", idle_scenario(ms(100), ms(200)))
        .build()
        .unwrap();
    let context = HarnessContext::new(
        Arc::new(SimulatedPowerSupply::new(MockMode::Instant)),
        Arc::new(SimulatedHandset::new(MockMode::Instant)),
        Some(Arc::new(SyntheticAcquisition::new())),
        Arc::new(CsvResultSink::new(dir.path().join("results"))),
        fast_config(),
    )
    .with_registry(registry);
    RunEngine::new(context)
}

#[tokio::test]
async fn test_run_writes_metadata_and_rows() {
    let dir = TempDir::new().unwrap();
    let engine = csv_engine(&dir);

    let report = engine.run_scenario("idle").await.unwrap();
    assert_eq!(report.status, RunStatus::Completed, "{}", report.message);

    let receipt = report.export.expect("exported");
    let path = receipt.location.expect("file sink reports a path");
    assert!(path.starts_with(dir.path().join("results")));
    assert_eq!(receipt.rows, 200);

    let text = fs::read_to_string(&path).unwrap();
    let metadata: Vec<&str> = text.lines().take_while(|l| l.starts_with('#')).collect();
    assert!(metadata.iter().any(|l| l.contains(&report.run_id)));
    assert!(metadata.iter().any(|l| l.contains("\"scenario\": \"idle\"")));

    let data: Vec<&str> = text.lines().skip(metadata.len()).collect();
    assert_eq!(data[0], "elapsed_index,VBAT (mA),VDD_MAIN (mA)");
    assert_eq!(data.len(), 201);
    assert!(data[1].starts_with("0,"));
    assert!(data[200].starts_with("199,"));
}

#[tokio::test]
async fn test_runs_never_overwrite_each_other() {
    let dir = TempDir::new().unwrap();
    let engine = csv_engine(&dir);

    let first = engine.run_scenario("idle").await.unwrap();
    // file names carry second resolution
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let second = engine.run_scenario("idle").await.unwrap();

    let a = first.export.and_then(|r| r.location).unwrap();
    let b = second.export.and_then(|r| r.location).unwrap();
    assert_ne!(a, b);
    assert_eq!(fs::read_dir(dir.path().join("results")).unwrap().count(), 2);
}

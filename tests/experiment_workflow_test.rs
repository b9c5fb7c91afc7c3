//! Experiment begin/end and catalog sync against simulated instruments.
#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{closed_address, simulator, spec_for, wait_until, Stack};
use scpi_daq::{DaqError, ExperimentId};
use std::time::Duration;

#[tokio::test]
async fn test_sync_identifies_and_renames() {
    let left = simulator("TH2690").await;
    let right = simulator("TH2690A").await;
    let dead = closed_address().await;
    let stack = Stack::new();

    let mut named = spec_for(left.address());
    named.name = Some("bench".to_string());
    let specs = vec![named, spec_for(right.address()), spec_for(&dead)];

    let ids = stack.catalog.sync(&specs, &stack.client).await;
    assert_eq!(ids.len(), 3);

    let records = stack.catalog.list().await;
    assert_eq!(records[0].name, "bench");
    assert_eq!(records[0].model.as_deref(), Some("TH2690"));
    assert_eq!(records[1].name, "TH2690A");
    assert_eq!(
        records[1].serial,
        Some(format!("SIM{:05}", right.address().port))
    );
    assert_eq!(records[2].name, dead.to_string());
    assert!(records[2].last_seen.is_none());

    // Re-sync does not duplicate
    stack.catalog.sync(&specs, &stack.client).await;
    assert_eq!(stack.catalog.list().await.len(), 3);
}

#[tokio::test]
async fn test_begin_and_end_drive_instruments() {
    let left = simulator("TH2690").await;
    let right = simulator("TH2690").await;
    let stack = Stack::new();
    let ids = stack
        .catalog
        .sync(&[spec_for(left.address()), spec_for(right.address())], &stack.client)
        .await;
    let experiment = ExperimentId(21);

    assert!(stack.controller.begin(experiment, &ids).await.unwrap());
    assert!(left.is_measuring());
    assert!(right.is_measuring());

    let sink = stack.sink.clone();
    let flowing = wait_until(Duration::from_secs(3), || {
        let sink = sink.clone();
        async move { sink.count_for(ExperimentId(21)).await >= 4 }
    })
    .await;
    assert!(flowing);

    let status = stack.controller.status(experiment).await;
    assert!(status.polling_active);
    assert!(status.stats.unwrap().samples >= 4);

    assert!(stack.controller.end(experiment, &ids).await);
    assert!(!left.is_measuring());
    assert!(!right.is_measuring());

    let status = stack.controller.status(experiment).await;
    assert!(!status.polling_active);
    assert!(status.stats.is_none());

    let samples = stack.sink.samples().await;
    for id in &ids {
        assert!(samples.iter().any(|s| s.instrument_id == *id));
    }
    // Armed instruments source 1 kV
    assert!(samples.iter().all(|s| s.source == 1000.0));
}

#[tokio::test]
async fn test_begin_aborts_when_instrument_unreachable() {
    let sim = simulator("TH2690").await;
    let dead = closed_address().await;
    let stack = Stack::new();
    let ids = stack
        .catalog
        .sync(&[spec_for(sim.address()), spec_for(&dead)], &stack.client)
        .await;
    let experiment = ExperimentId(22);

    let err = stack.controller.begin(experiment, &ids).await.unwrap_err();
    assert!(matches!(err, DaqError::Connectivity { .. }), "{err:?}");
    assert!(!stack.runner.is_running(experiment).await);
    assert!(stack.sink.is_empty().await);

    // Ending still disarms whatever is reachable
    assert!(!stack.controller.end(experiment, &ids).await);
    assert!(!sim.is_measuring());
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_samples_written_to_csv() {
    use scpi_daq::data::{CsvSink, Sample};
    use scpi_daq::{InstrumentId, PollRunner, PollTarget, ScpiClient};
    use std::sync::Arc;

    let sim = simulator("TH2690").await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.csv");
    let sink = Arc::new(CsvSink::open(&path).unwrap());
    let runner = PollRunner::new(ScpiClient::tcp(common::TEST_TIMEOUT), sink);
    let experiment = ExperimentId(30);

    runner
        .start(
            experiment,
            vec![PollTarget::new(InstrumentId(5), sim.address().clone())],
            common::TEST_INTERVAL,
        )
        .await
        .unwrap();
    let runner_ref = &runner;
    let written = wait_until(Duration::from_secs(3), || async move {
        runner_ref
            .job_stats(experiment)
            .await
            .is_some_and(|stats| stats.samples >= 2)
    })
    .await;
    runner.shutdown(Duration::from_secs(1)).await;
    assert!(written);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let rows: Vec<Sample> = reader.deserialize().map(|r| r.unwrap()).collect();
    assert!(rows.len() >= 2);
    assert!(rows
        .iter()
        .all(|s| s.experiment_id == experiment && s.instrument_id == InstrumentId(5)));
}

//! Per-experiment polling scheduler.
//!
//! [`PollRunner`] owns the registry of active poll jobs, one per experiment.
//! Each job is a tokio task that, once per tick, sends `FETCH:ALL_S?` to each of
//! its instruments in order and hands every decoded reply to the sample sink.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --start--> Polling --stop--> Idle
//! ```
//!
//! `start` on a polling experiment and `stop` on an idle one are no-ops. The
//! registry mutex is held only for the map edit; exchanges and sink writes
//! happen inside the job task without it.
//!
//! ## Failure isolation
//!
//! A failed exchange, a malformed reply, or a sink error is logged with the
//! experiment and instrument ids and the loop moves on to the next instrument.
//! Nothing is retried within a tick.
//!
//! ## Ticks
//!
//! Ticks are serialized: a pass over the instruments always finishes before the
//! next one starts, and ticks missed while a slow pass was running are skipped
//! rather than replayed. A hung instrument therefore slows its own job down but
//! never piles up concurrent exchanges against itself.
//!
//! ## Cancellation
//!
//! `stop` raises a watch signal. The job checks it at every tick boundary and
//! before each exchange and each save; an exchange already on the wire is left to
//! finish. Worst-case exit latency is one exchange timeout plus one tick.

use crate::data::{Sample, SampleSink};
use crate::error::{DaqError, DaqResult};
use crate::experiment::ExperimentId;
use crate::instrument::{InstrumentAddress, InstrumentId};
use crate::scpi::ScpiClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::Instrument;

/// Default poll period (5 Hz).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One instrument polled by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollTarget {
    /// Id samples are attributed to
    pub instrument_id: InstrumentId,
    /// Where `FETCH:ALL_S?` is sent
    pub address: InstrumentAddress,
}

impl PollTarget {
    /// Pair an instrument id with its address.
    pub fn new(instrument_id: InstrumentId, address: InstrumentAddress) -> Self {
        Self {
            instrument_id,
            address,
        }
    }
}

/// Counters of a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Passes started over the instrument list
    pub ticks: u64,
    /// Samples handed to the sink successfully
    pub samples: u64,
    /// Failed exchanges, decodes, and saves
    pub failures: u64,
}

#[derive(Debug, Default)]
struct JobCounters {
    ticks: AtomicU64,
    samples: AtomicU64,
    failures: AtomicU64,
}

impl JobCounters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Registry entry for a running job.
///
/// Owns the cancel signal and the task handle; the job's state lives in its task.
struct JobHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    counters: Arc<JobCounters>,
}

/// Scheduler owning one polling task per active experiment.
///
/// Construct once and share behind an `Arc`. Dropping the runner cancels every
/// job at its next tick boundary.
pub struct PollRunner {
    client: ScpiClient,
    sink: Arc<dyn SampleSink>,
    jobs: Mutex<HashMap<ExperimentId, JobHandle>>,
}

impl PollRunner {
    /// Create a runner that polls through `client` and saves into `sink`.
    pub fn new(client: ScpiClient, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            client,
            sink,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `targets` every `interval` for `experiment_id`.
    ///
    /// Returns `Ok(false)` without touching anything if the experiment is
    /// already polling. A zero interval is rejected.
    pub async fn start(
        &self,
        experiment_id: ExperimentId,
        targets: Vec<PollTarget>,
        interval: Duration,
    ) -> DaqResult<bool> {
        if interval.is_zero() {
            return Err(DaqError::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&experiment_id) {
            tracing::debug!(%experiment_id, "Polling already active, start ignored");
            return Ok(false);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let counters = Arc::new(JobCounters::default());
        let instrument_count = targets.len();
        let job = PollJob {
            experiment_id,
            targets,
            interval,
            client: self.client.clone(),
            sink: self.sink.clone(),
            cancel_rx,
            counters: counters.clone(),
        };

        let span = tracing::info_span!("poll_job", experiment_id = %experiment_id);
        let task = tokio::spawn(job.run().instrument(span));
        jobs.insert(
            experiment_id,
            JobHandle {
                cancel_tx,
                task,
                counters,
            },
        );
        drop(jobs);

        tracing::info!(
            %experiment_id,
            instruments = instrument_count,
            interval_ms = interval.as_millis() as u64,
            "Polling started"
        );
        Ok(true)
    }

    /// Stop polling for `experiment_id`.
    ///
    /// Returns `false` if nothing was polling. Does not wait for the task: an
    /// exchange already in flight completes, and its reply is discarded. Use
    /// [`PollRunner::stop_and_wait`] when the caller must know the job is gone.
    pub async fn stop(&self, experiment_id: ExperimentId) -> bool {
        self.cancel(experiment_id).await.is_some()
    }

    /// Stop polling for `experiment_id` and wait up to `timeout` for its task.
    ///
    /// Returns `None` if nothing was polling, otherwise whether the task exited
    /// in time. A task that overruns keeps running detached until it observes
    /// the signal.
    pub async fn stop_and_wait(
        &self,
        experiment_id: ExperimentId,
        timeout: Duration,
    ) -> Option<bool> {
        let handle = self.cancel(experiment_id).await?;
        Some(join_job(experiment_id, handle.task, timeout).await)
    }

    /// Deregister a job and raise its cancel signal.
    async fn cancel(&self, experiment_id: ExperimentId) -> Option<JobHandle> {
        let handle = self.jobs.lock().await.remove(&experiment_id)?;

        // Receiver gone means the task already exited
        let _ = handle.cancel_tx.send(true);
        tracing::info!(
            %experiment_id,
            samples = handle.counters.samples.load(Ordering::Relaxed),
            "Polling stopped"
        );
        Some(handle)
    }

    /// Whether a job is registered for `experiment_id`.
    pub async fn is_running(&self, experiment_id: ExperimentId) -> bool {
        self.jobs.lock().await.contains_key(&experiment_id)
    }

    /// Ids of every polling experiment, ascending.
    pub async fn active_experiments(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<ExperimentId> = self.jobs.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Counters of a polling experiment.
    pub async fn job_stats(&self, experiment_id: ExperimentId) -> Option<JobStats> {
        self.jobs
            .lock()
            .await
            .get(&experiment_id)
            .map(|handle| handle.counters.snapshot())
    }

    /// Stop every job and wait up to `timeout` for each task to exit.
    ///
    /// Returns the number of tasks that did not exit in time (they keep running
    /// detached until they observe the signal).
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let handles: Vec<(ExperimentId, JobHandle)> = self.jobs.lock().await.drain().collect();
        if handles.is_empty() {
            return 0;
        }

        tracing::info!(jobs = handles.len(), "Shutting down poll jobs");
        for (_, handle) in &handles {
            let _ = handle.cancel_tx.send(true);
        }

        let waits = handles
            .into_iter()
            .map(|(experiment_id, handle)| join_job(experiment_id, handle.task, timeout));

        futures::future::join_all(waits)
            .await
            .into_iter()
            .filter(|exited| !exited)
            .count()
    }
}

/// Wait up to `timeout` for a cancelled job's task. True once it has exited.
async fn join_job(experiment_id: ExperimentId, task: JoinHandle<()>, timeout: Duration) -> bool {
    match time::timeout(timeout, task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(%experiment_id, error = %e, "Poll task failed");
            true
        }
        Err(_) => {
            tracing::warn!(%experiment_id, ?timeout, "Poll task did not exit in time");
            false
        }
    }
}

/// State owned by one polling task.
struct PollJob {
    experiment_id: ExperimentId,
    targets: Vec<PollTarget>,
    interval: Duration,
    client: ScpiClient,
    sink: Arc<dyn SampleSink>,
    cancel_rx: watch::Receiver<bool>,
    counters: Arc<JobCounters>,
}

impl PollJob {
    async fn run(mut self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = self.cancel_rx.changed() => {
                    // Sender dropped: the runner is gone
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.cancelled() {
                        break;
                    }
                    self.poll_once().await;
                }
            }
        }

        tracing::debug!(experiment_id = %self.experiment_id, "Poll loop exited");
    }

    /// Signal raised, or the runner dropped its sender.
    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow() || self.cancel_rx.has_changed().is_err()
    }

    /// One pass over every target.
    async fn poll_once(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        for target in &self.targets {
            if self.cancelled() {
                return;
            }

            let reply = match self.client.fetch_all(&target.address).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        experiment_id = %self.experiment_id,
                        instrument_id = %target.instrument_id,
                        address = %target.address,
                        error = %e,
                        "Instrument fetch failed"
                    );
                    continue;
                }
            };

            if self.cancelled() {
                return;
            }

            let sample = Sample::from_reply(
                self.experiment_id,
                target.instrument_id,
                reply,
                chrono::Utc::now(),
            );
            match self.sink.save(sample).await {
                Ok(()) => {
                    self.counters.samples.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        experiment_id = %self.experiment_id,
                        instrument_id = %target.instrument_id,
                        error = %e,
                        "Failed to save sample"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::hardware::mock::MockTransport;

    const REPLY: &str = "1.234,-0.001,0.0,1000000,12:00:00,0,0,25.5,40.0,0";

    fn target(id: u64) -> PollTarget {
        PollTarget::new(
            InstrumentId(id),
            InstrumentAddress::new(format!("10.0.0.{id}"), 45454),
        )
    }

    fn runner_with(transport: Arc<MockTransport>) -> (PollRunner, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let runner = PollRunner::new(ScpiClient::new(transport), sink.clone());
        (runner, sink)
    }

    #[tokio::test]
    async fn start_stop_toggles_registry() {
        let (runner, _) = runner_with(Arc::new(MockTransport::new()));
        let id = ExperimentId(1);

        assert!(!runner.is_running(id).await);
        assert!(runner
            .start(id, vec![target(1)], Duration::from_millis(10))
            .await
            .unwrap());
        assert!(runner.is_running(id).await);
        assert_eq!(runner.active_experiments().await, vec![id]);

        assert!(runner.stop(id).await);
        assert!(!runner.is_running(id).await);
        assert!(runner.active_experiments().await.is_empty());
    }

    #[tokio::test]
    async fn second_start_is_noop() {
        let (runner, _) = runner_with(Arc::new(MockTransport::new()));
        let id = ExperimentId(7);

        assert!(runner
            .start(id, vec![target(1)], Duration::from_millis(10))
            .await
            .unwrap());
        assert!(!runner
            .start(id, vec![target(1), target(2)], Duration::from_millis(1))
            .await
            .unwrap());
        assert!(runner.is_running(id).await);
        assert_eq!(runner.active_experiments().await.len(), 1);
        runner.stop(id).await;
    }

    #[tokio::test]
    async fn stop_without_job_is_noop() {
        let (runner, _) = runner_with(Arc::new(MockTransport::new()));
        assert!(!runner.stop(ExperimentId(42)).await);
        assert!(!runner.stop(ExperimentId(42)).await);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (runner, _) = runner_with(Arc::new(MockTransport::new()));
        let err = runner
            .start(ExperimentId(1), vec![target(1)], Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(!runner.is_running(ExperimentId(1)).await);
    }

    #[tokio::test]
    async fn samples_are_attributed_to_experiment_and_instrument() {
        let transport = Arc::new(MockTransport::new());
        transport.reply(&target(3).address, "FETCH:ALL_S?", REPLY);
        let (runner, sink) = runner_with(transport);
        let id = ExperimentId(9);

        runner
            .start(id, vec![target(3)], Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        runner.stop(id).await;

        let samples = sink.samples().await;
        assert!(!samples.is_empty());
        let first = &samples[0];
        assert_eq!(first.experiment_id, id);
        assert_eq!(first.instrument_id, InstrumentId(3));
        assert_eq!(first.voltage, 1.234);
        assert_eq!(first.device_time, "12:00:00");
    }

    #[tokio::test]
    async fn failing_instrument_does_not_block_others() {
        let transport = Arc::new(MockTransport::new());
        transport.set_unreachable(&target(1).address, true);
        transport.reply(&target(2).address, "FETCH:ALL_S?", "garbage");
        transport.reply(&target(3).address, "FETCH:ALL_S?", REPLY);
        let (runner, sink) = runner_with(transport.clone());
        let id = ExperimentId(2);

        runner
            .start(
                id,
                vec![target(1), target(2), target(3)],
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let stats = runner.job_stats(id).await.unwrap();
        runner.stop(id).await;

        assert!(stats.ticks >= 2, "{stats:?}");
        assert!(stats.failures >= 2, "{stats:?}");
        let samples = sink.samples().await;
        assert!(samples.len() >= 2);
        assert!(samples.iter().all(|s| s.instrument_id == InstrumentId(3)));
        assert!(transport.call_count(&target(1).address, "FETCH:ALL_S?") >= 2);
    }

    #[tokio::test]
    async fn slow_exchanges_do_not_overlap() {
        // Each exchange takes longer than the tick
        let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(50)));
        transport.reply(&target(1).address, "FETCH:ALL_S?", REPLY);
        let (runner, sink) = runner_with(transport.clone());
        let id = ExperimentId(3);

        runner
            .start(id, vec![target(1)], Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(175)).await;
        runner.stop(id).await;

        // Serialized passes: at most one exchange per 50ms, plus the first
        let calls = transport.call_count(&target(1).address, "FETCH:ALL_S?");
        assert!(calls <= 5, "exchanges overlapped: {calls}");
        assert!(sink.len().await <= calls);
    }

    #[tokio::test]
    async fn stop_and_wait_outlasts_in_flight_exchange() {
        let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(300)));
        transport.reply(&target(1).address, "FETCH:ALL_S?", REPLY);
        let (runner, sink) = runner_with(transport.clone());
        let id = ExperimentId(5);

        runner
            .start(id, vec![target(1)], Duration::from_millis(10))
            .await
            .unwrap();
        // First exchange is on the wire until ~300ms
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(runner.stop_and_wait(id, Duration::from_secs(2)).await, Some(true));
        assert!(
            started.elapsed() >= Duration::from_millis(150),
            "returned after {:?}",
            started.elapsed()
        );
        assert!(!runner.is_running(id).await);
        // Reply arrived after the signal and was dropped
        assert!(sink.is_empty().await);
        assert_eq!(runner.stop_and_wait(id, Duration::from_secs(2)).await, None);
    }

    #[tokio::test]
    async fn stop_and_wait_reports_overrun() {
        let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(300)));
        let (runner, _) = runner_with(transport);
        let id = ExperimentId(6);

        runner
            .start(id, vec![target(1)], Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            runner.stop_and_wait(id, Duration::from_millis(20)).await,
            Some(false)
        );
        assert!(!runner.is_running(id).await);
    }

    #[tokio::test]
    async fn dropped_runner_ends_pass_early() {
        let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(100)));
        transport.reply(&target(1).address, "FETCH:ALL_S?", REPLY);
        transport.reply(&target(2).address, "FETCH:ALL_S?", REPLY);
        let (runner, sink) = runner_with(transport.clone());

        runner
            .start(
                ExperimentId(7),
                vec![target(1), target(2)],
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(runner);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.call_count(&target(1).address, "FETCH:ALL_S?"), 1);
        assert_eq!(transport.call_count(&target(2).address, "FETCH:ALL_S?"), 0);
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_stops_every_job() {
        let (runner, _) = runner_with(Arc::new(MockTransport::new()));
        for id in 1..=3 {
            runner
                .start(ExperimentId(id), vec![target(id)], Duration::from_millis(10))
                .await
                .unwrap();
        }

        let stuck = runner.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stuck, 0);
        assert!(runner.active_experiments().await.is_empty());
        assert_eq!(runner.shutdown(Duration::from_secs(1)).await, 0);
    }
}

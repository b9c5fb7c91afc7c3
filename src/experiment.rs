//! Experiment start/stop workflow.
//!
//! Beginning an experiment arms every bound instrument with `FUNC:RUN` and then
//! starts a poll job; ending it stops the job and disarms the instruments with
//! `FUNC:STOP`.

use crate::error::{DaqError, DaqResult};
use crate::instrument::{InstrumentId, InstrumentResolver};
use crate::runner::{JobStats, PollRunner};
use crate::scpi::ScpiClient;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Numeric experiment identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub u64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Polling state of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExperimentStatus {
    /// Experiment the status describes
    pub experiment_id: ExperimentId,
    /// Whether a poll job is registered
    pub polling_active: bool,
    /// Job counters, present while polling
    pub stats: Option<JobStats>,
}

/// Drives instruments and the poll runner together.
///
/// `begin` calls for one experiment are serialized: while one is arming
/// instruments, a second returns `Ok(false)` without sending anything.
pub struct ExperimentController {
    resolver: Arc<dyn InstrumentResolver>,
    client: ScpiClient,
    runner: Arc<PollRunner>,
    poll_interval: Duration,
    stop_timeout: Option<Duration>,
    beginning: Mutex<HashSet<ExperimentId>>,
}

/// Claim on an experiment id for the duration of one `begin`.
struct BeginClaim<'a> {
    beginning: &'a Mutex<HashSet<ExperimentId>>,
    experiment_id: ExperimentId,
}

impl<'a> BeginClaim<'a> {
    fn acquire(
        beginning: &'a Mutex<HashSet<ExperimentId>>,
        experiment_id: ExperimentId,
    ) -> Option<Self> {
        let inserted = beginning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(experiment_id);
        inserted.then_some(Self {
            beginning,
            experiment_id,
        })
    }
}

impl Drop for BeginClaim<'_> {
    fn drop(&mut self) {
        self.beginning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.experiment_id);
    }
}

impl ExperimentController {
    /// Create a controller that starts jobs on `runner` every `poll_interval`.
    pub fn new(
        resolver: Arc<dyn InstrumentResolver>,
        client: ScpiClient,
        runner: Arc<PollRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            resolver,
            client,
            runner,
            poll_interval,
            stop_timeout: None,
            beginning: Mutex::new(HashSet::new()),
        }
    }

    /// Make `end` wait up to `timeout` for the poll task to exit before
    /// disarming the instruments.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// The runner this controller starts jobs on.
    pub fn runner(&self) -> &Arc<PollRunner> {
        &self.runner
    }

    /// Arm the instruments and start polling.
    ///
    /// Returns `Ok(false)` if the experiment is already polling or another
    /// `begin` for it is still in progress; nothing is sent in that case. The first `FUNC:RUN` failure aborts before polling starts;
    /// instruments armed before it are left running.
    pub async fn begin(
        &self,
        experiment_id: ExperimentId,
        instrument_ids: &[InstrumentId],
    ) -> DaqResult<bool> {
        if instrument_ids.is_empty() {
            return Err(DaqError::Configuration(format!(
                "experiment {experiment_id} has no instruments"
            )));
        }
        // Held until the job is registered, so a racing begin sees one or the other
        let Some(_claim) = BeginClaim::acquire(&self.beginning, experiment_id) else {
            tracing::debug!(%experiment_id, "Begin already in progress, ignored");
            return Ok(false);
        };
        if self.runner.is_running(experiment_id).await {
            return Ok(false);
        }

        let targets = self.resolver.resolve(instrument_ids).await?;
        for target in &targets {
            self.client.run(&target.address).await.inspect_err(|e| {
                tracing::error!(
                    %experiment_id,
                    instrument_id = %target.instrument_id,
                    error = %e,
                    "Failed to start instrument"
                );
            })?;
        }

        self.runner
            .start(experiment_id, targets, self.poll_interval)
            .await
    }

    /// Stop polling, then disarm every resolvable instrument.
    ///
    /// With a stop timeout set, the poll task is awaited first so no exchange
    /// or save of the job outlives this call. Instrument failures are logged
    /// only. Returns whether a job was stopped.
    pub async fn end(&self, experiment_id: ExperimentId, instrument_ids: &[InstrumentId]) -> bool {
        let stopped = match self.stop_timeout {
            Some(timeout) => self
                .runner
                .stop_and_wait(experiment_id, timeout)
                .await
                .is_some(),
            None => self.runner.stop(experiment_id).await,
        };

        for &instrument_id in instrument_ids {
            let target = match self.resolver.resolve(&[instrument_id]).await {
                Ok(mut targets) => match targets.pop() {
                    Some(target) => target,
                    None => continue,
                },
                Err(e) => {
                    tracing::warn!(%experiment_id, %instrument_id, error = %e, "Skipping instrument stop");
                    continue;
                }
            };

            if let Err(e) = self.client.stop(&target.address).await {
                tracing::warn!(
                    %experiment_id,
                    %instrument_id,
                    error = %e,
                    "Failed to stop instrument"
                );
            }
        }
        stopped
    }

    /// Whether the experiment is polling, with its counters.
    pub async fn status(&self, experiment_id: ExperimentId) -> ExperimentStatus {
        let stats = self.runner.job_stats(experiment_id).await;
        ExperimentStatus {
            experiment_id,
            polling_active: stats.is_some(),
            stats,
        }
    }
}

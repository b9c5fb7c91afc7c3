//! Sample sinks.
//!
//! The poll loop hands every decoded sample to a [`SampleSink`]. Sinks are
//! append-only; a failed `save` is logged by the caller and the sample is lost.
use crate::data::sample::Sample;
use crate::error::DaqResult;
use crate::experiment::ExperimentId;
use async_trait::async_trait;
use tokio::sync::Mutex;

#[cfg(feature = "storage_csv")]
use crate::data::sample::SAMPLE_COLUMNS;
#[cfg(feature = "storage_csv")]
use crate::error::DaqError;
#[cfg(feature = "storage_csv")]
use std::fs::{File, OpenOptions};
#[cfg(feature = "storage_csv")]
use std::path::{Path, PathBuf};

/// Append-only persistence for samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Persist one sample.
    async fn save(&self, sample: Sample) -> DaqResult<()>;
}

/// In-memory sink, queryable afterwards.
#[derive(Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every sample saved so far, in save order.
    pub async fn samples(&self) -> Vec<Sample> {
        self.samples.lock().await.clone()
    }

    /// Number of samples saved for one experiment.
    pub async fn count_for(&self, experiment_id: ExperimentId) -> usize {
        self.samples
            .lock()
            .await
            .iter()
            .filter(|s| s.experiment_id == experiment_id)
            .count()
    }

    /// Total number of samples saved.
    pub async fn len(&self) -> usize {
        self.samples.lock().await.len()
    }

    /// True when nothing has been saved.
    pub async fn is_empty(&self) -> bool {
        self.samples.lock().await.is_empty()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn save(&self, sample: Sample) -> DaqResult<()> {
        self.samples.lock().await.push(sample);
        Ok(())
    }
}

/// CSV file sink, one row per sample.
///
/// Appends to an existing file; the header row is written only when the file
/// starts out empty. Each row is flushed as it is written.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Open (or create) the CSV file at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> DaqResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DaqError::Storage(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DaqError::Storage(format!("Failed to open CSV file: {}", e)))?;
        let fresh = file
            .metadata()
            .map_err(|e| DaqError::Storage(e.to_string()))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer
                .write_record(SAMPLE_COLUMNS)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| DaqError::Storage(e.to_string()))?;
        }

        tracing::info!(path = %path.display(), fresh, "CSV sample sink opened");

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// File this sink appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl SampleSink for CsvSink {
    async fn save(&self, sample: Sample) -> DaqResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .serialize(&sample)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| DaqError::Storage(e.to_string()))
    }
}

//! In-memory registry of known instruments.
//!
//! The catalog hands out [`InstrumentId`]s, keeps what `*IDN?` reported about
//! each instrument, and resolves ids into [`PollTarget`]s for the runner.

use crate::config::InstrumentSpec;
use crate::error::{DaqError, DaqResult};
use crate::instrument::{InstrumentAddress, InstrumentId};
use crate::runner::PollTarget;
use crate::scpi::{IdentificationReply, ScpiClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Looks up the address of each requested instrument.
#[async_trait]
pub trait InstrumentResolver: Send + Sync {
    /// Resolve `ids` in order. Any unknown id fails the whole call.
    async fn resolve(&self, ids: &[InstrumentId]) -> DaqResult<Vec<PollTarget>>;
}

/// Catalog entry for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentRecord {
    /// Catalog-assigned id
    pub id: InstrumentId,
    /// Display name; `host:port` until identification supplies a model
    pub name: String,
    /// Unique per record
    pub address: InstrumentAddress,
    /// Inactive instruments cannot be bound to an experiment
    pub active: bool,
    /// Identification fields, unset until the first successful `*IDN?`
    pub model: Option<String>,
    /// Firmware version
    pub firmware: Option<String>,
    /// Serial number
    pub serial: Option<String>,
    /// Last successful identification
    pub last_seen: Option<DateTime<Utc>>,
}

impl InstrumentRecord {
    fn has_default_name(&self) -> bool {
        self.name == self.address.to_string()
    }

    fn apply_identification(&mut self, idn: &IdentificationReply) {
        if self.has_default_name() && !idn.model.is_empty() {
            self.name = idn.model.clone();
        }
        self.model = Some(idn.model.clone());
        self.firmware = Some(idn.firmware.clone());
        self.serial = Some(idn.serial.clone());
        self.last_seen = Some(Utc::now());
    }
}

/// Registry of instruments keyed by id.
pub struct InstrumentCatalog {
    records: RwLock<BTreeMap<InstrumentId, InstrumentRecord>>,
    next_id: AtomicU64,
}

impl Default for InstrumentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentCatalog {
    /// Create an empty catalog. Ids start at 1.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an instrument, or return the id already held by its address.
    ///
    /// The second element is `true` when a new record was created.
    pub async fn register(&self, spec: &InstrumentSpec) -> (InstrumentId, bool) {
        let address = spec.address();
        let mut records = self.records.write().await;

        if let Some(existing) = records.values().find(|r| r.address == address) {
            return (existing.id, false);
        }

        let id = InstrumentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = InstrumentRecord {
            id,
            name: spec.display_name(),
            address,
            active: true,
            model: None,
            firmware: None,
            serial: None,
            last_seen: None,
        };
        tracing::info!(instrument_id = %id, name = %record.name, address = %record.address, "Instrument registered");
        records.insert(id, record);
        (id, true)
    }

    /// Record for `id`.
    pub async fn get(&self, id: InstrumentId) -> Option<InstrumentRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Every record, ordered by id.
    pub async fn list(&self) -> Vec<InstrumentRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Ids of every active instrument, ascending.
    pub async fn active_ids(&self) -> Vec<InstrumentId> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.active)
            .map(|r| r.id)
            .collect()
    }

    /// Enable or disable an instrument.
    pub async fn set_active(&self, id: InstrumentId, active: bool) -> DaqResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or(DaqError::UnknownInstrument(id))?;
        record.active = active;
        Ok(())
    }

    /// Identify one instrument and store what it reports.
    pub async fn ping(
        &self,
        id: InstrumentId,
        client: &ScpiClient,
    ) -> DaqResult<IdentificationReply> {
        let address = self
            .get(id)
            .await
            .map(|r| r.address)
            .ok_or(DaqError::UnknownInstrument(id))?;

        // No lock held across the exchange
        let idn = client.identify(&address).await?;

        if let Some(record) = self.records.write().await.get_mut(&id) {
            record.apply_identification(&idn);
        }
        Ok(idn)
    }

    /// Register every spec and identify each registered instrument.
    ///
    /// Unreachable instruments stay registered; the failure is only logged.
    /// Returns the ids in spec order, duplicates collapsed.
    pub async fn sync(&self, specs: &[InstrumentSpec], client: &ScpiClient) -> Vec<InstrumentId> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let (id, _) = self.register(spec).await;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        for &id in &ids {
            match self.ping(id, client).await {
                Ok(idn) => {
                    tracing::info!(instrument_id = %id, model = %idn.model, serial = %idn.serial, "Instrument identified");
                }
                Err(e) if e.is_exchange_failure() => {
                    tracing::warn!(instrument_id = %id, error = %e, "Instrument identification failed");
                }
                Err(e) => {
                    tracing::error!(instrument_id = %id, error = %e, "Instrument sync failed");
                }
            }
        }
        ids
    }
}

#[async_trait]
impl InstrumentResolver for InstrumentCatalog {
    async fn resolve(&self, ids: &[InstrumentId]) -> DaqResult<Vec<PollTarget>> {
        let records = self.records.read().await;
        ids.iter()
            .map(|&id| {
                let record = records.get(&id).ok_or(DaqError::UnknownInstrument(id))?;
                if !record.active {
                    return Err(DaqError::Configuration(format!(
                        "instrument {id} ({}) is inactive",
                        record.name
                    )));
                }
                Ok(PollTarget::new(id, record.address.clone()))
            })
            .collect()
    }
}

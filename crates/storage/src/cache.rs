//! Supported-PID Cache
//!
//! Remembers which PIDs a vehicle answered during discovery so the next
//! session with the same VIN can skip the bitmap walk. A session without a
//! readable VIN gets an anonymous key that is never exported.

use crate::StorageError;
use chrono::{DateTime, Utc};
use obd_protocol::PidCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// PIDs a vehicle reported as supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedPidSet {
    pub vin: Option<String>,
    pub pids: BTreeSet<PidCode>,
    pub discovered_at: DateTime<Utc>,
}

/// Cache key: the VIN, or this session's anonymous identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Vin(String),
    Anonymous(Uuid),
}

/// Read-mostly map of vehicle identity to supported PIDs
#[derive(Debug)]
pub struct PidCache {
    session: Uuid,
    entries: RwLock<HashMap<CacheKey, SupportedPidSet>>,
}

impl PidCache {
    pub fn new() -> Self {
        let session = Uuid::new_v4();
        debug!("Creating PID cache for session {}", session);
        Self {
            session,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the key for an optional VIN; blank VINs are anonymous
    pub fn key(&self, vin: Option<&str>) -> CacheKey {
        match vin.map(|v| v.trim().to_ascii_uppercase()) {
            Some(vin) if !vin.is_empty() => CacheKey::Vin(vin),
            _ => CacheKey::Anonymous(self.session),
        }
    }

    /// Cached set for `vin`; `None` means discovery has to run
    pub fn get(&self, vin: Option<&str>) -> Result<Option<SupportedPidSet>, StorageError> {
        let key = self.key(vin);
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::Lock(format!("PID cache: {}", e)))?;
        Ok(entries.get(&key).cloned())
    }

    /// Store the discovered set for `vin`, replacing any previous one
    pub fn set(
        &self,
        vin: Option<&str>,
        pids: BTreeSet<PidCode>,
    ) -> Result<SupportedPidSet, StorageError> {
        let key = self.key(vin);
        let set = SupportedPidSet {
            vin: match &key {
                CacheKey::Vin(vin) => Some(vin.clone()),
                CacheKey::Anonymous(_) => None,
            },
            pids,
            discovered_at: Utc::now(),
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Lock(format!("PID cache: {}", e)))?;
        info!("Caching {} supported PIDs for {:?}", set.pids.len(), key);
        entries.insert(key, set.clone());
        Ok(set)
    }

    pub fn remove(&self, vin: Option<&str>) -> Result<Option<SupportedPidSet>, StorageError> {
        let key = self.key(vin);
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Lock(format!("PID cache: {}", e)))?;
        Ok(entries.remove(&key))
    }

    /// Entries keyed by VIN, for an external store
    pub fn export(&self) -> Result<Vec<SupportedPidSet>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::Lock(format!("PID cache: {}", e)))?;
        let mut sets: Vec<_> = entries
            .iter()
            .filter(|(key, _)| matches!(key, CacheKey::Vin(_)))
            .map(|(_, set)| set.clone())
            .collect();
        sets.sort_by(|a, b| a.vin.cmp(&b.vin));
        Ok(sets)
    }

    /// Load previously exported entries; sets without a VIN are skipped
    pub fn import(&self, sets: Vec<SupportedPidSet>) -> Result<usize, StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Lock(format!("PID cache: {}", e)))?;
        let mut loaded = 0;
        for set in sets {
            if let Some(vin) = set.vin.as_deref().map(|v| v.trim().to_ascii_uppercase()) {
                if !vin.is_empty() {
                    entries.insert(CacheKey::Vin(vin), set);
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PidCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Monotonic, durable UID allocation.
//!
//! One counter per kind, all guarded by a single mutex. The counter file
//! is rewritten atomically before a freshly allocated UID is returned, so
//! a crash observes either the pre- or post-increment value and restarts
//! never re-issue an identifier. No filesystem scanning happens on reload;
//! monotonicity is sufficient.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::fsio;
use melange_common::types::{Uid, UidKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterState {
    #[serde(default)]
    counters: BTreeMap<String, u64>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Per-kind monotonic counters with crash-safe persistence.
pub struct UidAllocator {
    state_path: PathBuf,
    counters: Mutex<BTreeMap<String, u64>>,
}

impl UidAllocator {
    /// Load persisted counters (or start fresh) from `state_path`.
    pub fn load(state_path: PathBuf) -> HubResult<Self> {
        let state: Option<CounterState> = fsio::load_json(&state_path)?;
        let counters = state.map(|s| s.counters).unwrap_or_default();
        if counters.is_empty() {
            info!("initialized new UID counters at {}", state_path.display());
        } else {
            info!(
                "loaded UID counters from {}: {:?}",
                state_path.display(),
                counters
            );
        }
        Ok(Self {
            state_path,
            counters: Mutex::new(counters),
        })
    }

    /// Allocate the next UID for `kind`. The incremented counter is
    /// persisted before the UID is returned; on persistence failure the
    /// in-memory counter is reverted and no UID is handed out.
    pub fn next(&self, kind: UidKind) -> HubResult<Uid> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry(kind.prefix().to_string()).or_insert(0);
        *entry += 1;
        let value = *entry;

        if let Err(err) = self.persist(&counters) {
            let entry = counters.entry(kind.prefix().to_string()).or_insert(0);
            *entry = entry.saturating_sub(1);
            return Err(HubError::new(
                ErrorCode::UidGenerationFailed,
                format!("failed to persist {kind} counter: {err}"),
            ));
        }

        let uid = Uid::new(kind, value);
        debug!("allocated {uid}");
        Ok(uid)
    }

    /// Current counter value for `kind`, without incrementing.
    pub fn current(&self, kind: UidKind) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(kind.prefix()).copied().unwrap_or(0)
    }

    /// Undo the most recent allocation for `kind`.
    ///
    /// Only legal immediately after an allocation whose follow-up work
    /// failed and whose UID was never exposed to another subsystem.
    /// Callers must verify no registry record exists for the UID first.
    pub fn rollback(&self, kind: UidKind) -> HubResult<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counters.entry(kind.prefix().to_string()).or_insert(0);
        if *entry == 0 {
            return Err(HubError::new(
                ErrorCode::UidGenerationFailed,
                format!("cannot roll back {kind} counter below zero"),
            ));
        }
        *entry -= 1;
        let value = *entry;
        self.persist(&counters)?;
        info!("rolled back {kind} counter to {value}");
        Ok(value)
    }

    fn persist(&self, counters: &BTreeMap<String, u64>) -> HubResult<()> {
        fsio::write_json_atomic(
            &self.state_path,
            &CounterState {
                counters: counters.clone(),
                last_updated: Some(Utc::now().to_rfc3339()),
            },
        )
    }
}

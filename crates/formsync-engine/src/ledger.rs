use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct LedgerState {
    transferred: BTreeSet<String>,
    unflushed: Vec<String>,
}

/// In-memory set of asset ids confirmed transferred, shared by transfer workers. New entries are
/// queued until the orchestrator flushes them to the state store.
#[derive(Debug, Clone, Default)]
pub struct TransferLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl TransferLedger {
    pub fn with_transferred(transferred: BTreeSet<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState {
                transferred,
                unflushed: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.lock().transferred.contains(asset_id)
    }

    /// Returns false when the id was already present.
    pub fn record(&self, asset_id: &str) -> bool {
        let mut state = self.lock();
        if !state.transferred.insert(asset_id.to_string()) {
            return false;
        }
        state.unflushed.push(asset_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.lock().transferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unflushed_len(&self) -> usize {
        self.lock().unflushed.len()
    }

    pub fn take_unflushed(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().unflushed)
    }

    /// Puts ids back after a failed flush so the next flush retries them.
    pub fn requeue(&self, asset_ids: Vec<String>) {
        let mut state = self.lock();
        let mut restored = asset_ids;
        restored.append(&mut state.unflushed);
        state.unflushed = restored;
    }
}

//! Pending table - correlation id to one-shot reply slot.
//!
//! Shared between callers (insert, remove on timeout) and the dispatcher
//! (take on reply). Lock-free for callers on different shards via DashMap.
//!
//! A slot is inserted strictly before its frame is queued, so a reply can
//! never arrive for an id that is not yet registered.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::bridge::protocol::CorrelationId;
use crate::error::BridgeError;

/// What a waiting caller eventually receives.
pub type SlotResult = Result<String, BridgeError>;

/// Single-assignment delivery side of a pending request.
pub type PendingSlot = oneshot::Sender<SlotResult>;

#[derive(Default)]
pub struct PendingTable {
    slots: DashMap<CorrelationId, PendingSlot>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: CorrelationId, slot: PendingSlot) {
        if let Some(previous) = self.slots.insert(id.clone(), slot) {
            // Ids are minted fresh per request; a collision means a caller bug.
            tracing::error!(%id, "Correlation id registered twice, failing the older request");
            let _ = previous.send(Err(BridgeError::Closed));
        }
    }

    /// Remove and return the slot for `id`, if still pending.
    pub fn take(&self, id: &str) -> Option<PendingSlot> {
        self.slots.remove(id).map(|(_, slot)| slot)
    }

    /// Drop the slot for `id` without resolving it. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Resolve the slot for `id` exactly once. Returns `false` for unknown ids.
    pub fn deliver(&self, id: &str, result: SlotResult) -> bool {
        match self.take(id) {
            Some(slot) => {
                if slot.send(result).is_err() {
                    tracing::debug!(%id, "Waiter went away before delivery");
                }
                true
            }
            None => false,
        }
    }

    /// Remove every entry, resolving each with a fresh error from `make_error`.
    pub fn fail_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<CorrelationId> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.send(Err(make_error()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Registration of one in-flight request.
///
/// Removes the entry on drop, so a caller that times out or whose future is
/// dropped never leaves a stale slot behind. After delivery the entry is
/// already gone and the removal is a no-op.
pub struct PendingGuard {
    id: CorrelationId,
    table: Arc<PendingTable>,
}

impl PendingGuard {
    /// Insert a fresh slot for `id` and return the guard plus the receiving side.
    pub fn register(
        table: &Arc<PendingTable>,
        id: CorrelationId,
    ) -> (Self, oneshot::Receiver<SlotResult>) {
        let (tx, rx) = oneshot::channel();
        table.insert(id.clone(), tx);
        (
            Self {
                id,
                table: Arc::clone(table),
            },
            rx,
        )
    }

    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.remove(self.id.as_str()) {
            tracing::trace!(id = %self.id, "Removed unresolved pending entry");
        }
    }
}

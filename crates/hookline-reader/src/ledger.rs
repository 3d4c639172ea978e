//! In-flight ledger keyed by correlation id.
//!
//! Every message handed to delivery has exactly one entry here until its
//! completion removes it. Inserts come from the pump, removals from
//! arbitrary completion contexts; the map is sharded so completions never
//! queue behind the receive loop. Only insert, remove and count are exposed.

use dashmap::{mapref::entry::Entry, DashMap};
use hookline_core::{CorrelationId, LockToken, ReceiverId, SlotId};

use crate::error::{ReaderError, Result};

/// Completion handle for one in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    /// Broker lock token needed to acknowledge the message.
    pub lock_token: LockToken,
    /// Receiver that produced the message.
    pub receiver_id: ReceiverId,
    /// Handler slot assigned to the message.
    pub slot: SlotId,
}

/// Thread-safe map from correlation id to message handle.
#[derive(Debug, Default)]
pub struct InFlightLedger {
    entries: DashMap<CorrelationId, MessageHandle>,
}

impl InFlightLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Records a message as in flight.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::DuplicateCorrelation` if the id is already
    /// tracked; the existing entry is left untouched.
    pub fn track(&self, correlation_id: CorrelationId, handle: MessageHandle) -> Result<()> {
        match self.entries.entry(correlation_id) {
            Entry::Occupied(_) => Err(ReaderError::DuplicateCorrelation { correlation_id }),
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                Ok(())
            },
        }
    }

    /// Atomically removes and returns a message's handle.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::LockTokenNotFound` if the id is unknown or was
    /// already completed.
    pub fn try_remove(&self, correlation_id: CorrelationId) -> Result<MessageHandle> {
        self.entries
            .remove(&correlation_id)
            .map(|(_, handle)| handle)
            .ok_or(ReaderError::LockTokenNotFound { correlation_id })
    }

    /// Whether a correlation id is in flight.
    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.entries.contains_key(&correlation_id)
    }

    /// Number of messages in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(slot: u32) -> MessageHandle {
        MessageHandle { lock_token: LockToken::new(), receiver_id: ReceiverId::new(), slot: SlotId(slot) }
    }

    #[test]
    fn track_then_remove_round_trips_handle() {
        let ledger = InFlightLedger::new();
        let correlation_id = CorrelationId::new();
        let expected = handle(1);

        ledger.track(correlation_id, expected).expect("fresh id is tracked");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains(correlation_id));

        let removed = ledger.try_remove(correlation_id).expect("tracked id is removable");
        assert_eq!(removed, expected);
        assert!(ledger.is_empty());
    }

    #[test]
    fn second_removal_reports_not_found() {
        let ledger = InFlightLedger::new();
        let correlation_id = CorrelationId::new();
        ledger.track(correlation_id, handle(1)).expect("fresh id is tracked");

        assert!(ledger.try_remove(correlation_id).is_ok());
        let second = ledger.try_remove(correlation_id);
        assert!(matches!(
            second,
            Err(ReaderError::LockTokenNotFound { correlation_id: id }) if id == correlation_id
        ));
    }

    #[test]
    fn duplicate_track_keeps_original_entry() {
        let ledger = InFlightLedger::new();
        let correlation_id = CorrelationId::new();
        let original = handle(1);
        ledger.track(correlation_id, original).expect("fresh id is tracked");

        let duplicate = ledger.track(correlation_id, handle(2));
        assert!(matches!(duplicate, Err(ReaderError::DuplicateCorrelation { .. })));
        assert_eq!(ledger.try_remove(correlation_id).ok(), Some(original));
    }

    #[tokio::test]
    async fn concurrent_removals_succeed_exactly_once() {
        let ledger = std::sync::Arc::new(InFlightLedger::new());
        let correlation_id = CorrelationId::new();
        ledger.track(correlation_id, handle(1)).expect("fresh id is tracked");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.try_remove(correlation_id).is_ok() })
            })
            .collect();

        let mut successes = 0;
        for task in tasks {
            if task.await.expect("removal task") {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}

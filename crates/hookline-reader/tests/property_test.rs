//! Property-based tests for the slot pool and in-flight ledger.
//!
//! Operation sequences are generated at random and replayed against both the
//! real structure and a trivial model, checking the invariants after every
//! step.

mod common;

use std::collections::{HashMap, HashSet};

use common::Harness;
use hookline_core::{CorrelationId, LockToken, ReceiverId, SlotId};
use hookline_reader::{HandlerSlotPool, InFlightLedger, MessageHandle, ReaderConfig, ReaderError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum SlotOp {
    Acquire,
    Release(usize),
}

fn slot_ops() -> impl Strategy<Value = Vec<SlotOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(SlotOp::Acquire),
            2 => any::<usize>().prop_map(SlotOp::Release),
        ],
        1..200,
    )
}

proptest! {
    /// No two open acquisitions ever share a slot id, and ids above the
    /// high-water mark are never handed out.
    #[test]
    fn open_slots_are_always_distinct(
        initial in 0u32..16,
        cap in prop::option::of(1u32..32),
        ops in slot_ops(),
    ) {
        let cap = cap.map(|cap| cap.max(initial));
        let pool = HandlerSlotPool::new(initial, cap);
        let mut open: Vec<SlotId> = Vec::new();

        for op in ops {
            match op {
                SlotOp::Acquire => {
                    if let Some(slot) = pool.try_acquire() {
                        prop_assert!(!open.contains(&slot), "slot {} handed out twice", slot);
                        prop_assert!(slot.0 >= 1 && slot.0 <= pool.high_water());
                        open.push(slot);
                    } else {
                        prop_assert_eq!(Some(pool.high_water()), cap);
                        prop_assert_eq!(open.len() as u32, pool.high_water());
                    }
                },
                SlotOp::Release(index) if !open.is_empty() => {
                    let slot = open.swap_remove(index % open.len());
                    prop_assert!(pool.release(slot));
                    prop_assert!(!pool.release(slot), "double release accepted");
                },
                SlotOp::Release(_) => {},
            }

            prop_assert_eq!(pool.leased(), open.len());
            if let Some(cap) = cap {
                prop_assert!(pool.high_water() <= cap);
            }
        }
    }

    /// The free-list is consulted before a new id is minted.
    #[test]
    fn minting_only_when_free_list_empty(initial in 0u32..16, ops in slot_ops()) {
        let pool = HandlerSlotPool::new(initial, None);
        let mut open: Vec<SlotId> = Vec::new();

        for op in ops {
            match op {
                SlotOp::Acquire => {
                    let free_before = pool.available();
                    let high_before = pool.high_water();
                    let slot = pool.try_acquire();
                    prop_assert!(slot.is_some());
                    if free_before > 0 {
                        prop_assert_eq!(pool.high_water(), high_before);
                    } else {
                        prop_assert_eq!(pool.high_water(), high_before + 1);
                    }
                    open.extend(slot);
                },
                SlotOp::Release(index) if !open.is_empty() => {
                    let slot = open.swap_remove(index % open.len());
                    pool.release(slot);
                },
                SlotOp::Release(_) => {},
            }
        }
    }

    /// The ledger behaves like a map with insert-if-absent and remove-once.
    #[test]
    fn ledger_matches_model(ops in prop::collection::vec((any::<bool>(), 0usize..8), 1..100)) {
        let ledger = InFlightLedger::new();
        let ids: Vec<CorrelationId> = (0..8).map(|_| CorrelationId::new()).collect();
        let mut model: HashMap<CorrelationId, MessageHandle> = HashMap::new();

        for (insert, index) in ops {
            let correlation_id = ids[index];
            if insert {
                let handle = MessageHandle {
                    lock_token: LockToken::new(),
                    receiver_id: ReceiverId::new(),
                    slot: SlotId(index as u32 + 1),
                };
                let result = ledger.track(correlation_id, handle);
                if model.contains_key(&correlation_id) {
                    let is_duplicate = matches!(result, Err(ReaderError::DuplicateCorrelation { .. }));
                    prop_assert!(is_duplicate);
                } else {
                    prop_assert!(result.is_ok());
                    model.insert(correlation_id, handle);
                }
            } else {
                let result = ledger.try_remove(correlation_id);
                match model.remove(&correlation_id) {
                    Some(expected) => prop_assert_eq!(result.ok(), Some(expected)),
                    None => {
                        let is_missing = matches!(result, Err(ReaderError::LockTokenNotFound { .. }));
                        prop_assert!(is_missing);
                    },
                }
            }
            prop_assert_eq!(ledger.len(), model.len());
        }
    }

    /// Completing messages in any order, any number of times, releases each
    /// slot exactly once and never leaves a slot leased without a ledger
    /// entry.
    #[test]
    fn completions_release_each_slot_once(
        message_count in 1usize..20,
        completions in prop::collection::vec((any::<usize>(), any::<bool>()), 1..60),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut harness = Harness::with_config(ReaderConfig {
                batch_size: message_count,
                initial_handler_slots: 4,
                ..Default::default()
            });
            harness.broker.push_messages(message_count).await;
            prop_assert_eq!(harness.poll().await, message_count);

            let dispatched = harness.dispatcher.take_all().await;
            let mut completed = HashSet::new();

            for (index, delivered) in completions {
                let message = &dispatched[index % dispatched.len()];
                let result = message.complete(delivered).await;
                if completed.insert(message.envelope.correlation_id) {
                    prop_assert!(result.is_ok());
                } else {
                    let is_missing = matches!(result, Err(ReaderError::LockTokenNotFound { .. }));
                    prop_assert!(is_missing);
                }

                let reader = harness.reader();
                prop_assert_eq!(reader.slots().leased(), reader.ledger().len());
                prop_assert_eq!(reader.ledger().len(), message_count - completed.len());
                prop_assert_eq!(harness.active_received_count() as usize, reader.ledger().len());
            }

            Ok(())
        })?;
    }
}

//! Coordinator - tracks the processing units of one delivered batch
//!
//! A batch is processed by one or more units (the whole batch, or one unit per virtual
//! partition). Workers decrement the coordinator when their unit finishes; the batch is
//! complete the first time the pending count drops to zero, and that completion is
//! signalled exactly once.
//!
//! The coordinator also collects which offsets of the batch were marked as consumed and
//! derives the highest contiguous position that is safe to commit.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::kafka::message::KafkaMessage;
use crate::kafka::types::Partition;

#[derive(Debug, Default)]
struct CoordinatorState {
    pending: usize,
    revoked: bool,
    failed: Option<Arc<anyhow::Error>>,
    completed: bool,
    /// Offsets of the batch in delivery order
    offsets: Vec<i64>,
    marked: BTreeSet<i64>,
}

pub struct Coordinator {
    partition: Partition,
    state: Mutex<CoordinatorState>,
    done: Notify,
}

impl Coordinator {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            state: Mutex::new(CoordinatorState::default()),
            done: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Reset for a new batch whose units are about to be dispatched
    pub fn start(&self, messages: &[KafkaMessage]) {
        let mut state = self.state();
        *state = CoordinatorState {
            offsets: messages.iter().map(|m| m.offset()).collect(),
            ..CoordinatorState::default()
        };
    }

    /// Register `n` dispatched units
    pub fn increment(&self, n: usize) {
        let mut state = self.state();
        if state.completed {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Unit registered after batch completion - it will not delay completion"
            );
        }
        state.pending += n;
    }

    /// Finish one unit. Returns true for the single call that completed the batch.
    pub fn decrement(&self) -> bool {
        let mut state = self.state();
        if state.pending == 0 {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Unit finished without being registered - ignoring"
            );
            return false;
        }

        state.pending -= 1;
        if state.pending > 0 || state.completed {
            return false;
        }

        state.completed = true;
        drop(state);

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            "All units finished"
        );
        self.done.notify_waiters();
        true
    }

    /// Flag the batch as belonging to a revoked assignment
    pub fn revoke(&self) {
        let mut state = self.state();
        if !state.revoked {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                pending = state.pending,
                "Coordinator revoked"
            );
        }
        state.revoked = true;
    }

    /// Record a unit failure. Only the first error is kept.
    pub fn fail(&self, error: anyhow::Error) {
        let mut state = self.state();
        match state.failed {
            Some(_) => debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                error = ?error,
                "Additional unit failure in batch"
            ),
            None => state.failed = Some(Arc::new(error)),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.state().revoked
    }

    pub fn failure(&self) -> Option<Arc<anyhow::Error>> {
        self.state().failed.clone()
    }

    pub fn pending(&self) -> usize {
        self.state().pending
    }

    pub fn is_finished(&self) -> bool {
        self.state().completed
    }

    /// Wait until the batch completes
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    /// Mark every batch offset up to and including `offset`
    pub fn mark_through(&self, offset: i64) {
        let mut state = self.state();
        let newly_marked: Vec<i64> = state
            .offsets
            .iter()
            .copied()
            .filter(|o| *o <= offset)
            .collect();
        state.marked.extend(newly_marked);
    }

    /// Mark specific offsets (one virtual partition's messages)
    pub fn mark_offsets(&self, offsets: impl IntoIterator<Item = i64>) {
        self.state().marked.extend(offsets);
    }

    /// Next offset to consume given the contiguous marked prefix of the batch.
    ///
    /// `None` when nothing at the start of the batch was marked.
    pub fn committable_offset(&self) -> Option<i64> {
        let state = self.state();
        let mut committable = None;
        for offset in &state.offsets {
            if !state.marked.contains(offset) {
                return committable.map(|_| *offset);
            }
            committable = Some(offset + 1);
        }
        committable
    }

    /// First offset of the batch that was not marked, if any
    pub fn first_unmarked(&self) -> Option<i64> {
        let state = self.state();
        state
            .offsets
            .iter()
            .copied()
            .find(|offset| !state.marked.contains(offset))
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.state().offsets.first().copied()
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.state().offsets.last().copied()
    }
}

//! Pause / resume / seek state machine for a single partition.
//!
//! [`PauseState`] is the pure state machine. [`PauseController`] wraps it in a mutex
//! shared by the owning partition worker and its resume timer, and issues the
//! corresponding calls on the [`ConsumerClient`].
//!
//! ```text
//!            pause(offset, timeout?)            pause (overwrite, attempt += 1)
//!  RUNNING ──────────────────────────► PAUSED ◄──────┐
//!     ▲                                  │  └────────┘
//!     └──────── resume() / timer ────────┘
//!               seek(override or pause_offset), resume
//! ```
//!
//! Every pause and every resume bumps a pause id. A timer only resumes the partition when
//! the id it was armed with is still current, so a timer racing an explicit resume (or a
//! newer pause) is a no-op even if it already woke up and was waiting for the lock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::client::ConsumerClient;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    PARTITION_PAUSES, PARTITION_RESUMES, PARTITION_SEEK_OVERRIDES, PAUSE_TIMEOUT_MS,
};
use crate::processing::backoff::{BackoffPolicy, PauseTimeout};
use crate::processing::seek::SeekOverride;

/// Outcome of a pause transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseDecision {
    pub timeout: PauseTimeout,
    pub pause_id: u64,
}

/// Outcome of a resume transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeDecision {
    /// Offset fetching continues from
    pub offset: i64,
    /// Epoch batches fetched after this resume carry
    pub seek_epoch: u64,
    /// Whether a staged seek replaced the pause offset
    pub overridden: bool,
}

#[derive(Debug, Default)]
pub struct PauseState {
    paused: bool,
    pause_offset: Option<i64>,
    timeout: Option<PauseTimeout>,
    attempt: u32,
    pause_id: u64,
    seek_epoch: u64,
    paused_during_batch: bool,
    seek: SeekOverride,
    timer: Option<AbortHandle>,
}

impl PauseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause_offset(&self) -> Option<i64> {
        self.pause_offset
    }

    pub fn timeout(&self) -> Option<PauseTimeout> {
        self.timeout
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn seek_epoch(&self) -> u64 {
        self.seek_epoch
    }

    pub fn staged_seek(&self) -> Option<i64> {
        self.seek.target()
    }

    /// Enter (or re-enter) PAUSED. A pause while paused overwrites the previous one.
    pub fn pause(
        &mut self,
        offset: i64,
        timeout: Option<Duration>,
        policy: &BackoffPolicy,
    ) -> PauseDecision {
        let timeout = match timeout {
            Some(timeout) => PauseTimeout::from_duration(timeout),
            None => PauseTimeout::from_duration(policy.timeout_for(self.attempt)),
        };

        self.cancel_timer();
        self.paused = true;
        self.pause_offset = Some(offset);
        self.timeout = Some(timeout);
        self.attempt = self.attempt.saturating_add(1);
        self.pause_id += 1;
        self.paused_during_batch = true;

        PauseDecision {
            timeout,
            pause_id: self.pause_id,
        }
    }

    /// Pause until explicitly resumed without counting towards backoff.
    ///
    /// Used by the runtime itself while a long-running job is outstanding.
    pub fn suspend(&mut self, offset: i64) -> PauseDecision {
        self.cancel_timer();
        self.paused = true;
        self.pause_offset = Some(offset);
        self.timeout = Some(PauseTimeout::Forever);
        self.pause_id += 1;

        PauseDecision {
            timeout: PauseTimeout::Forever,
            pause_id: self.pause_id,
        }
    }

    /// Stage where the next resume continues from
    pub fn seek(&mut self, offset: i64) {
        self.seek.stage(offset);
    }

    /// Stage a seek only when the application has not staged one itself
    pub fn seek_if_unset(&mut self, offset: i64) {
        if self.seek.target().is_none() {
            self.seek.stage(offset);
        }
    }

    /// Leave PAUSED. Returns `None` when already running.
    pub fn resume(&mut self) -> Option<ResumeDecision> {
        if !self.paused {
            return None;
        }

        self.cancel_timer();
        let pause_offset = self.pause_offset.unwrap_or_default();
        let staged = self.seek.take();

        self.paused = false;
        self.timeout = None;
        self.pause_id += 1;
        self.seek_epoch += 1;

        Some(ResumeDecision {
            offset: staged.unwrap_or(pause_offset),
            seek_epoch: self.seek_epoch,
            overridden: staged.is_some(),
        })
    }

    /// Whether a batch fetched in `seek_epoch` may be delivered to application code
    pub fn accepts(&self, seek_epoch: u64) -> bool {
        !self.paused && seek_epoch >= self.seek_epoch
    }

    pub fn begin_batch(&mut self) {
        self.paused_during_batch = false;
    }

    pub fn paused_during_batch(&self) -> bool {
        self.paused_during_batch
    }

    /// Reset the backoff attempt counter when the batch finished without pausing.
    /// Returns true when the counter was reset.
    pub fn complete_batch(&mut self) -> bool {
        if self.paused || self.paused_during_batch {
            return false;
        }
        self.attempt = 0;
        true
    }

    fn is_current(&self, pause_id: u64) -> bool {
        self.paused && self.pause_id == pause_id
    }

    fn set_timer(&mut self, timer: AbortHandle) {
        self.cancel_timer();
        self.timer = Some(timer);
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Why a resume happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTrigger {
    Explicit,
    Timer,
}

impl ResumeTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            ResumeTrigger::Explicit => "explicit",
            ResumeTrigger::Timer => "timer",
        }
    }
}

/// Shared handle over a partition's [`PauseState`]
pub struct PauseController {
    partition: Partition,
    client: Arc<dyn ConsumerClient>,
    policy: BackoffPolicy,
    state: Mutex<PauseState>,
}

impl PauseController {
    pub fn new(
        partition: Partition,
        client: Arc<dyn ConsumerClient>,
        policy: BackoffPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition,
            client,
            policy,
            state: Mutex::new(PauseState::new()),
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn state(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pause fetching at `offset`. Without a timeout the backoff policy picks one.
    pub fn pause(self: &Arc<Self>, offset: i64, timeout: Option<Duration>) -> PauseTimeout {
        let mut state = self.state();
        let decision = state.pause(offset, timeout, &self.policy);

        if let Err(e) = self.client.pause(&self.partition, offset) {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = offset,
                error = ?e,
                "Failed to pause partition"
            );
        }

        match decision.timeout {
            PauseTimeout::Finite(timeout) => {
                let controller = Arc::clone(self);
                let pause_id = decision.pause_id;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    controller.resume_from_timer(pause_id);
                });
                state.set_timer(timer.abort_handle());

                metrics::histogram!(PAUSE_TIMEOUT_MS).record(timeout.as_millis() as f64);
                metrics::counter!(PARTITION_PAUSES, "timer" => "armed").increment(1);
            }
            PauseTimeout::Forever => {
                metrics::counter!(PARTITION_PAUSES, "timer" => "none").increment(1);
            }
        }

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = offset,
            timeout = ?decision.timeout,
            attempt = state.attempt(),
            "Paused partition"
        );

        decision.timeout
    }

    /// Pause with no timer while work for the partition runs outside the worker
    pub fn suspend(&self, offset: i64) {
        let mut state = self.state();
        state.suspend(offset);

        if let Err(e) = self.client.pause(&self.partition, offset) {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = offset,
                error = ?e,
                "Failed to pause partition"
            );
        }
        metrics::counter!(PARTITION_PAUSES, "timer" => "none").increment(1);

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = offset,
            "Suspended partition until explicit resume"
        );
    }

    /// Stage the offset the next resume continues from
    pub fn seek(&self, offset: i64) {
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = offset,
            "Staged seek"
        );
        self.state().seek(offset);
    }

    pub fn seek_if_unset(&self, offset: i64) {
        self.state().seek_if_unset(offset);
    }

    /// Resume a paused partition. Returns the offset fetching continues from, or
    /// `None` when the partition was not paused.
    pub fn resume(&self) -> Option<i64> {
        let mut state = self.state();
        self.apply_resume(&mut state, ResumeTrigger::Explicit)
    }

    fn resume_from_timer(&self, pause_id: u64) {
        let mut state = self.state();
        if !state.is_current(pause_id) {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                pause_id = pause_id,
                "Ignoring stale pause timer"
            );
            return;
        }
        // the timer is the running task, dropping the handle is enough
        state.timer = None;
        self.apply_resume(&mut state, ResumeTrigger::Timer);
    }

    fn apply_resume(&self, state: &mut PauseState, trigger: ResumeTrigger) -> Option<i64> {
        let Some(decision) = state.resume() else {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Resume requested for running partition - ignoring"
            );
            return None;
        };

        if let Err(e) = self
            .client
            .seek(&self.partition, decision.offset, decision.seek_epoch)
        {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = decision.offset,
                error = ?e,
                "Failed to seek partition on resume"
            );
        }
        if let Err(e) = self.client.resume(&self.partition) {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                error = ?e,
                "Failed to resume partition"
            );
        }

        if decision.overridden {
            metrics::counter!(PARTITION_SEEK_OVERRIDES).increment(1);
        }
        metrics::counter!(PARTITION_RESUMES, "trigger" => trigger.as_str()).increment(1);

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = decision.offset,
            seek_epoch = decision.seek_epoch,
            trigger = trigger.as_str(),
            "Resumed partition"
        );

        Some(decision.offset)
    }

    /// Drop any armed timer without talking to the client (partition revoked)
    pub fn cancel(&self) {
        let mut state = self.state();
        if state.is_paused() {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                "Cancelling pause of revoked partition"
            );
        }
        state.cancel_timer();
    }

    pub fn is_paused(&self) -> bool {
        self.state().is_paused()
    }

    pub fn attempt(&self) -> u32 {
        self.state().attempt()
    }

    pub fn seek_epoch(&self) -> u64 {
        self.state().seek_epoch()
    }

    pub fn pause_offset(&self) -> Option<i64> {
        self.state().pause_offset()
    }

    pub fn staged_seek(&self) -> Option<i64> {
        self.state().staged_seek()
    }

    pub fn accepts(&self, seek_epoch: u64) -> bool {
        self.state().accepts(seek_epoch)
    }

    pub fn begin_batch(&self) {
        self.state().begin_batch();
    }

    pub fn paused_during_batch(&self) -> bool {
        self.state().paused_during_batch()
    }

    pub fn complete_batch(&self) -> bool {
        self.state().complete_batch()
    }
}

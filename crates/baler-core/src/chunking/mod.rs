//! Chunked, resumable execution of per-item actions.
//!
//! A [`ChunkingManager`] drives a [`SeekableIterator`] for a bounded slice of
//! work (iteration count or wall-clock budget), checkpointing through a
//! [`Persistence`] adapter so a later invocation continues where this one
//! stopped, or detects that it was killed.

pub mod iter;
pub mod persist;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::BalerError;

pub use iter::{ByteRangeIterator, SeekableIterator, VecIterator};
pub use persist::{CheckpointBackend, CheckpointRecord, FileBackend, MemoryBackend, Persistence};

/// Attempts per checkpoint save before the run is failed.
pub const SAVE_ATTEMPTS: usize = 3;
/// Fixed pause between checkpoint save attempts.
pub const SAVE_BACKOFF: Duration = Duration::from_millis(200);

/// Budget of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkLimits {
    /// Stop after this many items (0 = unlimited).
    pub max_iterations: u64,
    /// Stop once this much wall-clock time has passed since `start`.
    pub time_budget: Option<Duration>,
    /// Sleep after every item.
    pub throttle: Option<Duration>,
    /// Also persist every N items while running (0 = only when stopping).
    pub checkpoint_every: u64,
}

impl ChunkLimits {
    /// No bounds at all. The caller must bound total runtime externally.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Build from the raw microsecond values used by configuration and
    /// external triggers; zero means "none" for every field.
    pub fn from_micros(max_iterations: u64, time_out_us: u64, throttle_us: u64) -> Self {
        Self {
            max_iterations,
            time_budget: (time_out_us > 0).then(|| Duration::from_micros(time_out_us)),
            throttle: (throttle_us > 0).then(|| Duration::from_micros(throttle_us)),
            checkpoint_every: 0,
        }
    }

    pub fn with_max_iterations(mut self, n: u64) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_checkpoint_every(mut self, n: u64) -> Self {
        self.checkpoint_every = n;
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_iterations == 0 && self.time_budget.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Idle,
    Running,
    Complete,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IterationLimit,
    TimeBudget,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The persisted position could not be restored.
    Seek,
    /// The checkpoint could not be read or durably written.
    Persistence,
    /// The per-item action failed or panicked.
    Action,
    /// The iterator failed to advance.
    Iteration,
}

/// Structured description of why a run ended in [`ChunkState::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub message: String,
    /// `file:line` where the failure was raised, when known.
    pub location: Option<String>,
    /// Backoff requested by a rate-limited backend.
    pub retry_after: Option<Duration>,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failure: {}", self.kind, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " (at {loc})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Complete,
    Stopped(StopReason),
    Error(ChunkFailure),
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ChunkOutcome::Complete)
    }
}

/// Failure returned by a per-item action.
#[derive(Debug)]
pub struct ActionError {
    message: String,
    location: &'static std::panic::Location<'static>,
    source: Option<BalerError>,
}

impl ActionError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: std::panic::Location::caller(),
            source: None,
        }
    }

    /// The action completed without error but reported that it did not do
    /// its work.
    #[track_caller]
    pub fn rejected() -> Self {
        Self::new("action reported failure")
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source_error(&self) -> Option<&BalerError> {
        self.source.as_ref()
    }
}

impl From<BalerError> for ActionError {
    #[track_caller]
    fn from(err: BalerError) -> Self {
        Self {
            message: err.to_string(),
            location: std::panic::Location::caller(),
            source: Some(err),
        }
    }
}

impl From<std::io::Error> for ActionError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        BalerError::Io(err).into()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub type ActionResult = std::result::Result<(), ActionError>;

type CancelProbe = Box<dyn Fn() -> bool>;

/// Drives one iterator through a bounded slice of work.
pub struct ChunkingManager<I: SeekableIterator, E> {
    label: String,
    iterator: I,
    store: Persistence<E, I::Position>,
    extra: E,
    initial_extra: E,
    limits: ChunkLimits,
    state: ChunkState,
    processed: u64,
    last_position: Option<I::Position>,
    was_incomplete: bool,
    failure: Option<ChunkFailure>,
    save_backoff: Duration,
    cancel: Option<CancelProbe>,
}

impl<I, E> ChunkingManager<I, E>
where
    I: SeekableIterator,
    E: Serialize + DeserializeOwned + Clone,
{
    /// `extra` is the phase context used when no checkpoint exists; a loaded
    /// checkpoint's extra data replaces it.
    pub fn new(
        label: impl Into<String>,
        iterator: I,
        store: Persistence<E, I::Position>,
        extra: E,
        limits: ChunkLimits,
    ) -> Self {
        Self {
            label: label.into(),
            iterator,
            store,
            initial_extra: extra.clone(),
            extra,
            limits,
            state: ChunkState::Idle,
            processed: 0,
            last_position: None,
            was_incomplete: false,
            failure: None,
            save_backoff: SAVE_BACKOFF,
            cancel: None,
        }
    }

    /// Probe consulted between items; `true` stops the run as cancelled.
    pub fn with_cancel_probe(mut self, probe: impl Fn() -> bool + 'static) -> Self {
        self.cancel = Some(Box::new(probe));
        self
    }

    pub fn with_save_backoff(mut self, backoff: Duration) -> Self {
        self.save_backoff = backoff;
        self
    }

    /// Run until the iterator is exhausted, a budget is spent, or an item fails.
    ///
    /// With `rewind` the checkpoint is discarded and the iterator restarts.
    /// Otherwise the iterator resumes after the checkpointed position.
    pub fn start<F>(&mut self, rewind: bool, mut action: F) -> ChunkOutcome
    where
        F: FnMut(&I::Key, &I::Item, &mut E) -> ActionResult,
    {
        self.state = ChunkState::Running;
        self.processed = 0;
        self.failure = None;
        self.was_incomplete = false;

        if let Err(failure) = self.restore(rewind) {
            return self.finish_error(failure, false);
        }

        if self.limits.is_unbounded() {
            debug!(job = %self.label, "chunk run has no iteration or time budget");
        }

        // Fail closed: never run work that is not marked as in progress.
        self.store.set_processing(true);
        if let Err(e) = self.save_with_retry() {
            let failure = failure(
                FailureKind::Persistence,
                format!("cannot mark job as processing: {e}"),
            );
            return self.finish_error(failure, false);
        }

        let started = Instant::now();
        while self.iterator.is_valid() {
            let (Some(key), Some(item)) = (self.iterator.key(), self.iterator.current()) else {
                let f = failure(
                    FailureKind::Iteration,
                    "iterator is valid but has no current key or item".to_string(),
                );
                return self.finish_error(f, true);
            };
            let extra = &mut self.extra;
            let result = panic::catch_unwind(AssertUnwindSafe(|| action(&key, item, extra)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let f = ChunkFailure {
                        kind: FailureKind::Action,
                        retry_after: e.source_error().and_then(BalerError::retry_after),
                        message: format!("item {key:?}: {}", e.message),
                        location: Some(format!("{}:{}", e.location.file(), e.location.line())),
                    };
                    return self.finish_error(f, true);
                }
                Err(payload) => {
                    let f = failure(
                        FailureKind::Action,
                        format!("item {key:?}: panicked: {}", panic_message(&payload)),
                    );
                    return self.finish_error(f, true);
                }
            }

            self.last_position = self.iterator.position();
            self.processed += 1;

            if self.limits.checkpoint_every > 0
                && self.processed % self.limits.checkpoint_every == 0
            {
                if let Err(e) = self.save_with_retry() {
                    let f = failure(FailureKind::Persistence, format!("checkpoint failed: {e}"));
                    return self.finish_error(f, false);
                }
            }

            if let Some(throttle) = self.limits.throttle {
                std::thread::sleep(throttle);
            }

            if let Err(e) = self.iterator.advance() {
                let f = failure(FailureKind::Iteration, format!("advance failed: {e}"));
                return self.finish_error(f, true);
            }
            if !self.iterator.is_valid() {
                break;
            }

            if self.cancel.as_ref().is_some_and(|probe| probe()) {
                return self.finish_stopped(StopReason::Cancelled);
            }
            if self.limits.max_iterations > 0 && self.processed >= self.limits.max_iterations {
                return self.finish_stopped(StopReason::IterationLimit);
            }
            if self
                .limits
                .time_budget
                .is_some_and(|budget| started.elapsed() >= budget)
            {
                return self.finish_stopped(StopReason::TimeBudget);
            }
        }

        self.store.set_processing(false);
        if let Err(e) = self.save_with_retry() {
            let f = failure(
                FailureKind::Persistence,
                format!("final checkpoint failed: {e}"),
            );
            return self.finish_error(f, false);
        }
        self.iterator.stop_iteration();
        self.state = ChunkState::Complete;
        info!(job = %self.label, processed = self.processed, "chunk job complete");
        ChunkOutcome::Complete
    }

    /// Load (or discard) the checkpoint and position the iterator on the
    /// first item still to run.
    fn restore(&mut self, rewind: bool) -> Result<(), ChunkFailure> {
        if rewind {
            self.store
                .delete()
                .map_err(|e| failure(FailureKind::Persistence, format!("cannot reset: {e}")))?;
            self.last_position = None;
            self.extra = self.initial_extra.clone();
            return self
                .iterator
                .rewind()
                .map_err(|e| failure(FailureKind::Seek, format!("rewind failed: {e}")));
        }

        let record = self
            .store
            .load_record()
            .map_err(|e| failure(FailureKind::Persistence, format!("cannot load: {e}")))?
            .cloned();
        self.last_position = None;
        if let Some(record) = record {
            if record.is_processing {
                warn!(job = %self.label, "previous run ended without stopping; resuming after crash");
                self.was_incomplete = true;
            }
            self.extra = record.extra_data;
            self.last_position = record.position;
        }

        self.iterator
            .rewind()
            .map_err(|e| failure(FailureKind::Seek, format!("rewind failed: {e}")))?;
        if let Some(position) = self.last_position.clone() {
            match self.iterator.seek(&position) {
                Ok(true) => {
                    self.iterator
                        .advance()
                        .map_err(|e| failure(FailureKind::Seek, format!("advance after seek: {e}")))?;
                    debug!(job = %self.label, ?position, "resumed from checkpoint");
                }
                Ok(false) => {
                    return Err(failure(
                        FailureKind::Seek,
                        format!("stale checkpoint position {position:?}"),
                    ))
                }
                Err(e) => {
                    return Err(failure(
                        FailureKind::Seek,
                        format!("seek to {position:?} failed: {e}"),
                    ))
                }
            }
        }
        Ok(())
    }

    fn save_with_retry(&mut self) -> crate::error::Result<()> {
        let mut last_err = None;
        for attempt in 1..=SAVE_ATTEMPTS {
            match self.store.save(self.last_position.as_ref(), &self.extra) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        job = %self.label,
                        attempt,
                        max_attempts = SAVE_ATTEMPTS,
                        error = %e,
                        "checkpoint save failed"
                    );
                    last_err = Some(e);
                    if attempt < SAVE_ATTEMPTS {
                        std::thread::sleep(self.save_backoff);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BalerError::Other("checkpoint save failed".into())))
    }

    fn finish_stopped(&mut self, reason: StopReason) -> ChunkOutcome {
        self.store.set_processing(false);
        if let Err(e) = self.save_with_retry() {
            let f = failure(FailureKind::Persistence, format!("stop checkpoint failed: {e}"));
            return self.finish_error(f, false);
        }
        self.iterator.stop_iteration();
        self.state = ChunkState::Stopped;
        debug!(job = %self.label, ?reason, processed = self.processed, "chunk job stopped");
        ChunkOutcome::Stopped(reason)
    }

    /// `persist` records the last completed position with the processing flag
    /// cleared. It is skipped when the store itself is what failed, or when
    /// the run never got to mark itself as processing.
    fn finish_error(&mut self, failure: ChunkFailure, persist: bool) -> ChunkOutcome {
        if persist {
            self.store.set_processing(false);
            if let Err(e) = self.save_with_retry() {
                error!(job = %self.label, error = %e, "could not record failure checkpoint");
            }
        }
        self.iterator.stop_iteration();
        self.state = ChunkState::Error;
        error!(job = %self.label, %failure, "chunk job failed");
        self.failure = Some(failure.clone());
        ChunkOutcome::Error(failure)
    }

    /// Replace the extra data after a run and checkpoint it at the last
    /// position, for state the owner derives from the outcome.
    pub fn save_extra(&mut self, extra: E) -> crate::error::Result<()> {
        self.extra = extra;
        self.store.set_processing(false);
        self.save_with_retry()
    }

    /// Delete the checkpoint; called by the owner once a finished job's
    /// result has been durably recorded elsewhere.
    pub fn delete_checkpoint(&mut self) -> crate::error::Result<()> {
        self.store.delete()
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// `true` when the loaded checkpoint showed that the previous run was
    /// killed between start and stop.
    pub fn was_processing_incomplete(&self) -> bool {
        self.was_incomplete
    }

    /// Items completed by the last `start`.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn last_position(&self) -> Option<&I::Position> {
        self.last_position.as_ref()
    }

    pub fn failure(&self) -> Option<&ChunkFailure> {
        self.failure.as_ref()
    }

    pub fn extra(&self) -> &E {
        &self.extra
    }

    pub fn iterator(&self) -> &I {
        &self.iterator
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.iterator.progress_percent()
    }
}

fn failure(kind: FailureKind, message: String) -> ChunkFailure {
    ChunkFailure {
        kind,
        message,
        location: None,
        retry_after: None,
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

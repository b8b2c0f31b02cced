//! Completion handles of non-blocking operations

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::error::Result;

struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn value(&self) -> MutexGuard<'_, Option<Result<T>>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of one issued operation, available once it completes
///
/// Dropping the handle does not cancel the operation; its outcome still
/// reaches the next fence on the issuing context.
pub struct CompletionHandle<T> {
    sequence: u64,
    slot: Arc<Slot<T>>,
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("sequence", &self.sequence)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T> CompletionHandle<T> {
    /// Issue sequence number within the owning context
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_complete(&self) -> bool {
        self.slot.value().is_some()
    }

    /// Block until the operation completes and take its result
    pub fn wait(self) -> Result<T> {
        let mut value = self.slot.value();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            value = self
                .slot
                .ready
                .wait(value)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Producer side of a [`CompletionHandle`]
pub(crate) struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        *self.slot.value() = Some(result);
        self.slot.ready.notify_all();
    }
}

pub(crate) fn completion_pair<T>(sequence: u64) -> (Completer<T>, CompletionHandle<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Completer {
            slot: Arc::clone(&slot),
        },
        CompletionHandle { sequence, slot },
    )
}

//! Outstanding-operation accounting behind `quiet`

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{FamError, OperationFailure, Result};

#[derive(Debug, Default)]
struct State {
    next_sequence: u64,
    outstanding: u64,
    failures: Vec<OperationFailure>,
}

/// Operations issued through one context and not yet fenced
#[derive(Debug, Default)]
pub struct OutstandingSet {
    state: Mutex<State>,
    drained: Condvar,
}

impl OutstandingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a newly issued operation and return its sequence number
    pub fn issue(&self) -> u64 {
        let mut state = self.state();
        state.next_sequence += 1;
        state.outstanding += 1;
        state.next_sequence
    }

    /// Record the completion of an issued operation
    pub fn complete(&self, failure: Option<OperationFailure>) {
        let mut state = self.state();
        state.outstanding = state.outstanding.saturating_sub(1);
        if let Some(failure) = failure {
            state.failures.push(failure);
        }
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.state().outstanding
    }

    /// Block until every issued operation completed, then report the failures
    /// collected since the last fence in issue order
    pub fn quiet(&self) -> Result<()> {
        let mut state = self.state();
        while state.outstanding > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let mut failures = std::mem::take(&mut state.failures);
        drop(state);

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|failure| failure.sequence);
        Err(FamError::AggregateFailure { failures })
    }
}

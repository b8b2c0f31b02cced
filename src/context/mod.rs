//! Context / fence layer
//!
//! A [`Context`] owns one worker thread that executes its operations in issue
//! order, so operations of one context on the same offset complete in the
//! order they were issued. `quiet` drains the context and reports every
//! failure collected since the previous fence.

pub mod completion;
pub mod tracker;

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::{
    client::DataitemDescriptor,
    copy::CopyRequest,
    error::{FamError, OperationFailure, Result},
    ops::{AtomicValue, BitwiseOp, IndexedLayout, StridedLayout},
    service::MemoryService,
};

pub use completion::CompletionHandle;
pub use tracker::OutstandingSet;

use completion::completion_pair;

/// Process-unique context id; also the holder id of its CAS locks
pub type ContextId = u64;

type Job = Box<dyn FnOnce() + Send>;

fn next_context_id() -> ContextId {
    static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Ordered stream of non-blocking operations with its own fence
#[derive(Debug)]
pub struct Context {
    id: ContextId,
    service: Arc<dyn MemoryService>,
    tracker: Arc<OutstandingSet>,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Context {
    /// Open a context issuing against `service`
    pub fn open(service: Arc<dyn MemoryService>) -> Result<Self> {
        let id = next_context_id();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("fam-context-{}", id))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .map_err(|e| FamError::from_io(e, "Failed to spawn context worker"))?;

        debug!("context {} opened", id);
        Ok(Self {
            id,
            service,
            tracker: Arc::new(OutstandingSet::new()),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn service(&self) -> &Arc<dyn MemoryService> {
        &self.service
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Operations issued and not yet completed
    pub fn outstanding(&self) -> u64 {
        self.tracker.outstanding()
    }

    fn sender(&self) -> MutexGuard<'_, Option<Sender<Job>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `op` behind everything issued before it
    pub fn issue<T, F>(&self, op: F) -> Result<CompletionHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MemoryService) -> Result<T> + Send + 'static,
    {
        let sender = self.sender();
        let sender = sender
            .as_ref()
            .ok_or_else(|| FamError::invalid_state(format!("context {} is closed", self.id)))?;

        let sequence = self.tracker.issue();
        let (completer, handle) = completion_pair(sequence);
        let service = Arc::clone(&self.service);
        let tracker = Arc::clone(&self.tracker);
        let context_id = self.id;

        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| op(service.as_ref())))
                .unwrap_or_else(|cause| {
                    Err(FamError::invalid_state(format!(
                        "operation {} panicked: {}",
                        sequence,
                        panic_message(cause.as_ref())
                    )))
                });
            let failure = result
                .as_ref()
                .err()
                .map(|e| OperationFailure::from_error(sequence, e));
            if let Some(failure) = &failure {
                warn!("context {} operation {}", context_id, failure);
            }
            // The handle is filled before the fence can observe completion.
            completer.complete(result);
            tracker.complete(failure);
        });

        sender.send(job).map_err(|_| {
            self.tracker.complete(None);
            FamError::invalid_state(format!("context {} worker has stopped", self.id))
        })?;
        Ok(handle)
    }

    pub fn get(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        len: u64,
    ) -> Result<CompletionHandle<Vec<u8>>> {
        let item = item.clone();
        self.issue(move |service| {
            let at = item.absolute(offset, len)?;
            service.get_atomic(item.region_id(), item.capability(), at, len)
        })
    }

    pub fn put(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<CompletionHandle<()>> {
        let item = item.clone();
        self.issue(move |service| {
            let at = item.absolute(offset, data.len() as u64)?;
            service.put_atomic(item.region_id(), item.capability(), at, data)
        })
    }

    /// Write element `i` of `data` at byte `first + i * stride` of the dataitem
    pub fn scatter_strided(
        &self,
        item: &DataitemDescriptor,
        layout: StridedLayout,
        data: Vec<u8>,
    ) -> Result<CompletionHandle<()>> {
        let item = item.clone();
        self.issue(move |service| {
            service.scatter_strided_atomic(
                item.region_id(),
                item.capability(),
                item.offset(),
                layout,
                data,
            )
        })
    }

    pub fn gather_strided(
        &self,
        item: &DataitemDescriptor,
        layout: StridedLayout,
    ) -> Result<CompletionHandle<Vec<u8>>> {
        let item = item.clone();
        self.issue(move |service| {
            service.gather_strided_atomic(item.region_id(), item.capability(), item.offset(), layout)
        })
    }

    /// Write element `i` of `data` at element index `indexes[i]`
    pub fn scatter_indexed(
        &self,
        item: &DataitemDescriptor,
        layout: IndexedLayout,
        data: Vec<u8>,
    ) -> Result<CompletionHandle<()>> {
        let item = item.clone();
        self.issue(move |service| {
            service.scatter_indexed_atomic(
                item.region_id(),
                item.capability(),
                item.offset(),
                layout,
                data,
            )
        })
    }

    pub fn gather_indexed(
        &self,
        item: &DataitemDescriptor,
        layout: IndexedLayout,
    ) -> Result<CompletionHandle<Vec<u8>>> {
        let item = item.clone();
        self.issue(move |service| {
            service.gather_indexed_atomic(item.region_id(), item.capability(), item.offset(), layout)
        })
    }

    fn bitwise(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        op: BitwiseOp,
        value: AtomicValue,
    ) -> Result<CompletionHandle<()>> {
        let item = item.clone();
        self.issue(move |service| {
            let at = item.absolute(offset, value.width())?;
            service
                .bitwise_atomic(item.region_id(), item.capability(), at, op, value, false)
                .map(|_| ())
        })
    }

    fn fetching(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        op: BitwiseOp,
        value: AtomicValue,
    ) -> Result<CompletionHandle<AtomicValue>> {
        let item = item.clone();
        self.issue(move |service| {
            let at = item.absolute(offset, value.width())?;
            service
                .bitwise_atomic(item.region_id(), item.capability(), at, op, value, true)?
                .ok_or_else(|| FamError::invalid_state("fetching operation returned no value"))
        })
    }

    pub fn or(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<()>> {
        self.bitwise(item, offset, BitwiseOp::Or, value.into())
    }

    pub fn and(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<()>> {
        self.bitwise(item, offset, BitwiseOp::And, value.into())
    }

    pub fn xor(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<()>> {
        self.bitwise(item, offset, BitwiseOp::Xor, value.into())
    }

    /// OR `value` in and return the prior value
    pub fn fetch_or(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<AtomicValue>> {
        self.fetching(item, offset, BitwiseOp::Or, value.into())
    }

    pub fn fetch_and(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<AtomicValue>> {
        self.fetching(item, offset, BitwiseOp::And, value.into())
    }

    pub fn fetch_xor(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        value: impl Into<AtomicValue>,
    ) -> Result<CompletionHandle<AtomicValue>> {
        self.fetching(item, offset, BitwiseOp::Xor, value.into())
    }

    /// Issue a striped copy as one tracked operation
    pub fn copy(&self, request: CopyRequest) -> Result<CompletionHandle<()>> {
        self.issue(move |service| service.copy(&request))
    }

    /// Block until this context holds the CAS lock on `offset` of `item`
    pub fn acquire_cas_lock(&self, item: &DataitemDescriptor, offset: u64) -> Result<()> {
        let at = item.absolute(offset, 1)?;
        self.service.acquire_cas_lock(item.region_id(), at, self.id)
    }

    /// Take the CAS lock only if it is free
    pub fn try_acquire_cas_lock(&self, item: &DataitemDescriptor, offset: u64) -> Result<bool> {
        let at = item.absolute(offset, 1)?;
        self.service.try_acquire_cas_lock(item.region_id(), at, self.id)
    }

    pub fn release_cas_lock(&self, item: &DataitemDescriptor, offset: u64) -> Result<()> {
        let at = item.absolute(offset, 1)?;
        self.service.release_cas_lock(item.region_id(), at, self.id)
    }

    /// Replace the u64 at `offset` with `desired` if it equals `expected`,
    /// returning the value found
    ///
    /// Drains the context first, then reads and conditionally writes under
    /// the CAS lock of that offset.
    pub fn compare_swap_u64(
        &self,
        item: &DataitemDescriptor,
        offset: u64,
        expected: u64,
        desired: u64,
    ) -> Result<u64> {
        let at = item.absolute(offset, 8)?;
        self.quiet()?;
        self.acquire_cas_lock(item, offset)?;

        let swapped = (|| -> Result<u64> {
            let bytes = self
                .service
                .get_atomic(item.region_id(), item.capability(), at, 8)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            let current = u64::from_le_bytes(raw);
            if current == expected {
                self.service.put_atomic(
                    item.region_id(),
                    item.capability(),
                    at,
                    desired.to_le_bytes().to_vec(),
                )?;
            }
            Ok(current)
        })();

        let released = self.release_cas_lock(item, offset);
        let current = swapped?;
        released?;
        Ok(current)
    }

    /// Block until everything issued through this context has completed
    pub fn quiet(&self) -> Result<()> {
        self.tracker.quiet()
    }

    /// Fence, then stop the worker; later issues fail with `InvalidState`
    pub fn close(&self) -> Result<()> {
        let sender = self.sender().take().ok_or_else(|| {
            FamError::invalid_state(format!("context {} is already closed", self.id))
        })?;
        drop(sender);

        let fenced = self.quiet();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("context {} worker panicked", self.id);
            }
        }
        debug!("context {} closed", self.id);
        fenced
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!("context {} dropped with failed operations: {}", self.id, e);
            }
        }
    }
}

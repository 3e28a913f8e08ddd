use crate::{
    Result,
    promise::BatchPromise,
    source::FetchFn,
};
use core::hash::Hash;
use std::{cell::RefCell, collections::HashMap, mem, rc::Rc};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// The shared result of one flushed batch: the fetched key map, handed
/// to every awaiter of the batch's promise.
pub(crate) type ResultMap<K, V> = Rc<HashMap<K, V>>;

/// Per-source buffer of queued keys and the promise every queued caller
/// is waiting on.
///
/// A slot is reused across batches: each flush snapshots the buffer and
/// promise and installs fresh empties, so keys arriving afterwards join
/// the next batch. Keys are buffered verbatim; deduplication is the
/// bulk fetch's business.
pub(crate) struct BatchSlot<K, V> {
    fetch: Rc<FetchFn<K, V>>,
    batch_size: usize,
    default: Option<V>,
    buffer: RefCell<Vec<K>>,
    promise: RefCell<BatchPromise<ResultMap<K, V>>>,
}

impl<K, V> BatchSlot<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    pub(crate) fn new(fetch: Rc<FetchFn<K, V>>, batch_size: usize, default: Option<V>) -> Self {
        Self {
            fetch,
            batch_size,
            default,
            buffer: RefCell::new(Vec::new()),
            promise: RefCell::new(BatchPromise::new()),
        }
    }

    /// Appends a key to the current batch and returns the promise it
    /// joined.
    pub(crate) fn enqueue(&self, key: K) -> BatchPromise<ResultMap<K, V>> {
        self.buffer.borrow_mut().push(key);
        self.promise.borrow().clone()
    }

    /// Runs the bulk fetch synchronously for an immediate-mode lookup,
    /// bypassing the buffer entirely.
    pub(crate) fn fetch_now(&self, keys: &[K]) -> Result<HashMap<K, V>> {
        (self.fetch)(keys)
    }

    pub(crate) fn default_value(&self) -> Option<V> {
        self.default.clone()
    }
}

/// The untyped capability set the manager and driver need from a slot,
/// whatever its key and value types.
pub(crate) trait ErasedSlot {
    /// Number of keys buffered for the next batch.
    fn pending_count(&self) -> usize;

    /// The preferred batch size configured by the slot's source.
    fn batch_size(&self) -> usize;

    /// Invokes the bulk fetch on the buffered keys and swaps in a fresh
    /// buffer and promise.
    ///
    /// The fetch outcome, success or error, is captured into the
    /// returned [`EnqueuedResolution`]; settling it is what fulfills or
    /// fails the snapshotted promise, so a failing fetch reaches every
    /// caller queued on the batch instead of unwinding into the driver.
    fn flush(&self) -> EnqueuedResolution;
}

impl<K, V> ErasedSlot for BatchSlot<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    fn pending_count(&self) -> usize {
        self.buffer.borrow().len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    fn flush(&self) -> EnqueuedResolution {
        let keys = mem::take(&mut *self.buffer.borrow_mut());
        let promise = mem::replace(&mut *self.promise.borrow_mut(), BatchPromise::new());
        let outcome = (self.fetch)(&keys).map(Rc::new);
        EnqueuedResolution::new(promise, outcome)
    }
}

/// A settled batch outcome paired with the promise it resolves, queued
/// for the driver to apply at a safe point.
pub(crate) struct EnqueuedResolution {
    settle: Box<dyn FnOnce()>,
}

impl EnqueuedResolution {
    pub(crate) fn new<T: Clone + 'static>(promise: BatchPromise<T>, outcome: Result<T>) -> Self {
        Self {
            settle: Box::new(move || match outcome {
                Ok(value) => promise.fulfill(value),
                Err(error) => promise.fail(error),
            }),
        }
    }

    /// Settles the captured promise, synchronously waking its awaiters.
    pub(crate) fn settle(self) {
        (self.settle)()
    }
}

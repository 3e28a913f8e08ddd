use crate::{
    Error,
    lookup::{Lookup, LookupAll, Miss},
    scope::{ImmediateGuard, ScopeStack},
    slot::{BatchSlot, EnqueuedResolution, ErasedSlot},
    source::{BulkSource, GroupSource},
};
use core::{
    any::{Any, type_name},
    fmt,
    hash::Hash,
    slice,
};
use std::{cell::RefCell, rc::Rc};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Builds the error a required lookup fails with when its key is
/// absent from the fetch result. Receives the `Debug`-rendered key and
/// the value type's name.
pub(crate) type NotFoundFactory = Rc<dyn Fn(&str, &'static str) -> Error>;

/// The batching façade: registers one batch slot per source, buffers
/// keys, and schedules flushes.
///
/// A `BatchLookup` is a cheaply cloneable handle; lookup tasks capture
/// a clone, and the same handle is passed to [`resolve`](crate::resolve)
/// to drive them. The whole session is single-threaded and cooperative:
/// none of it is `Send`, and all mutation happens between suspension
/// points.
///
/// # Example
/// ```
/// use lodebatch::{BatchLookup, BulkSource, resolve};
///
/// let lookups = BatchLookup::new();
/// let users = BulkSource::new(
///     |ids: &[u32]| Ok(ids.iter().map(|id| format!("user-{id}")).collect()),
///     |name: &String| name[5..].parse().unwrap(),
/// );
///
/// let tasks = (0..3u32).map(|id| {
///     let lookups = lookups.clone();
///     let users = users.clone();
///     async move { lookups.load(id, &users).await }
/// });
///
/// // All three lookups are coalesced into a single bulk fetch.
/// let names = resolve(tasks, &lookups).collect::<lodebatch::Result<Vec<_>>>()?;
/// assert_eq!(names, ["user-0", "user-1", "user-2"]);
/// # Ok::<(), lodebatch::Error>(())
/// ```
pub struct BatchLookup {
    inner: Rc<RefCell<Inner>>,
    scopes: ScopeStack,
    not_found: NotFoundFactory,
}

impl Clone for BatchLookup {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scopes: self.scopes.clone(),
            not_found: self.not_found.clone(),
        }
    }
}

impl Default for BatchLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<SlotEntry>,
    resolve_queue: Vec<EnqueuedResolution>,
}

/// One registered batch slot: the source identity it was registered
/// under, the untyped capability handle the driver uses, and the typed
/// handle the lookup methods downcast on the hot path.
struct SlotEntry {
    ident: usize,
    erased: Rc<dyn ErasedSlot>,
    typed: Rc<dyn Any>,
}

impl BatchLookup {
    pub fn new() -> Self {
        Self::with_not_found(|key, value_type| Error::KeyNotFound {
            key: key.to_string(),
            value_type,
        })
    }

    /// Creates a manager whose required-lookup misses fail with an
    /// error built by `factory` instead of the default
    /// [`Error::KeyNotFound`]. The factory receives the
    /// `Debug`-rendered key and the value type's name.
    pub fn with_not_found(factory: impl Fn(&str, &'static str) -> Error + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
            scopes: ScopeStack::default(),
            not_found: Rc::new(factory),
        }
    }

    /// Looks up the value for `key`, failing with the not-found error
    /// if the bulk fetch does not return one.
    ///
    /// Outside an immediate scope the key joins the source's current
    /// batch and the returned future suspends until that batch is
    /// flushed; inside one, the bulk fetch runs synchronously with just
    /// this key and the future is already settled.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn load<K, V>(&self, key: K, source: &BulkSource<K, V>) -> Lookup<K, V>
    where
        K: Eq + Hash + Clone + fmt::Debug + 'static,
        V: Clone + 'static,
    {
        let slot = self.scalar_slot(source);
        if self.scopes.is_active() {
            let out = slot
                .fetch_now(slice::from_ref(&key))
                .and_then(|map| match map.get(&key) {
                    Some(value) => Ok(value.clone()),
                    None => Err((self.not_found)(&format!("{key:?}"), type_name::<V>())),
                });
            return Lookup::ready(out);
        }
        let promise = slot.enqueue(key.clone());
        self.flush_if_full(&*slot);
        Lookup::deferred(promise.wait(), key, Miss::Fail(self.not_found.clone()))
    }

    /// Like [`load`](Self::load), but a missing key yields the source's
    /// default value (its [`with_default`](BulkSource::with_default)
    /// override, or the type's [`Default`]) instead of failing.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn load_or_default<K, V>(&self, key: K, source: &BulkSource<K, V>) -> Lookup<K, V>
    where
        K: Eq + Hash + Clone + fmt::Debug + 'static,
        V: Clone + Default + 'static,
    {
        let slot = self.scalar_slot(source);
        let default = slot.default_value().unwrap_or_default();
        if self.scopes.is_active() {
            let out = slot
                .fetch_now(slice::from_ref(&key))
                .map(|map| map.get(&key).cloned().unwrap_or(default));
            return Lookup::ready(out);
        }
        let promise = slot.enqueue(key.clone());
        self.flush_if_full(&*slot);
        Lookup::deferred(promise.wait(), key, Miss::Substitute(default))
    }

    /// Looks up many keys against a scalar source in one call.
    ///
    /// Duplicates are preserved verbatim, the whole keyset joins a
    /// single batch, and the result keeps the requested key order. Keys
    /// the bulk fetch did not return are silently skipped.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn load_many<K, V>(
        &self,
        keys: impl IntoIterator<Item = K>,
        source: &BulkSource<K, V>,
    ) -> LookupAll<K, V>
    where
        K: Eq + Hash + Clone + fmt::Debug + 'static,
        V: Clone + 'static,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        let slot = self.scalar_slot(source);
        let Some(first) = keys.first() else {
            return LookupAll::ready(Ok(Vec::new()));
        };
        if self.scopes.is_active() {
            let out = slot.fetch_now(&keys).map(|map| {
                keys.iter().filter_map(|key| map.get(key).cloned()).collect()
            });
            return LookupAll::ready(out);
        }
        let promise = slot.enqueue(first.clone());
        for key in &keys[1..] {
            slot.enqueue(key.clone());
        }
        self.flush_if_full(&*slot);
        LookupAll::multi(promise.wait(), keys)
    }

    /// Looks up every value grouped under the requested keys.
    ///
    /// The result is the concatenation of each key's fetched list, in
    /// requested-key order; keys with no matches contribute nothing. A
    /// single key is just the one-element iterator case.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    pub fn load_grouped<K, V>(
        &self,
        keys: impl IntoIterator<Item = K>,
        source: &GroupSource<K, V>,
    ) -> LookupAll<K, V>
    where
        K: Eq + Hash + Clone + fmt::Debug + 'static,
        V: Clone + 'static,
    {
        let keys: Vec<K> = keys.into_iter().collect();
        let slot = self.slot_at(source.ident(), || {
            BatchSlot::new(source.fetch_handle(), source.batch_size(), None)
        });
        let Some(first) = keys.first() else {
            return LookupAll::ready(Ok(Vec::new()));
        };
        if self.scopes.is_active() {
            let out = slot.fetch_now(&keys).map(|map| {
                keys.iter()
                    .filter_map(|key| map.get(key))
                    .flat_map(|values| values.iter().cloned())
                    .collect()
            });
            return LookupAll::ready(out);
        }
        let promise = slot.enqueue(first.clone());
        for key in &keys[1..] {
            slot.enqueue(key.clone());
        }
        self.flush_if_full(&*slot);
        LookupAll::grouped(promise.wait(), keys)
    }

    /// Opens an immediate scope: until the returned guard is closed,
    /// every lookup through this manager executes its bulk fetch
    /// synchronously and returns an already-settled future. Scopes
    /// nest and close innermost-first.
    ///
    /// # Example
    /// ```
    /// use futures::FutureExt;
    /// use lodebatch::{BatchLookup, BulkSource};
    ///
    /// let lookups = BatchLookup::new();
    /// let squares = BulkSource::new(
    ///     |keys: &[u32]| Ok(keys.iter().map(|k| (*k, k * k)).collect()),
    ///     |row: &(u32, u32)| row.0,
    /// );
    ///
    /// let scope = lookups.immediate_scope();
    /// let square = lookups.load(4, &squares).now_or_never();
    /// assert_eq!(square, Some(Ok((4, 16))));
    /// scope.end()?;
    /// # Ok::<(), lodebatch::Error>(())
    /// ```
    pub fn immediate_scope(&self) -> ImmediateGuard {
        self.scopes.push()
    }

    /// True while any immediate scope is open.
    pub fn in_immediate_scope(&self) -> bool {
        self.scopes.is_active()
    }

    /// Number of batch slots registered so far (one per distinct
    /// source).
    pub fn slot_count(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    /// Returns the slot registered under `ident`, registering the one
    /// built by `make` on first use. Later registrations under the same
    /// identity never replace the original slot, so the parameters the
    /// slot captured at first use win.
    fn slot_at<K, W>(&self, ident: usize, make: impl FnOnce() -> BatchSlot<K, W>) -> Rc<BatchSlot<K, W>>
    where
        K: Eq + Hash + Clone + 'static,
        W: Clone + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.slots.iter().find(|entry| entry.ident == ident) {
            return match entry.typed.clone().downcast::<BatchSlot<K, W>>() {
                Ok(slot) => slot,
                // A slot keeps its source's fetch allocation alive, so
                // an identity cannot be reused for a different type.
                Err(_) => unreachable!("slot identity bound to one source type"),
            };
        }
        let slot = Rc::new(make());
        inner.slots.push(SlotEntry {
            ident,
            erased: slot.clone(),
            typed: slot.clone(),
        });
        slot
    }

    fn scalar_slot<K, V>(&self, source: &BulkSource<K, V>) -> Rc<BatchSlot<K, V>>
    where
        K: Eq + Hash + Clone + 'static,
        V: Clone + 'static,
    {
        self.slot_at(source.ident(), || {
            BatchSlot::new(
                source.fetch_handle(),
                source.batch_size(),
                source.default_value(),
            )
        })
    }

    /// Flushes `slot` onto the resolve queue once its buffer reaches
    /// the preferred batch size.
    fn flush_if_full(&self, slot: &dyn ErasedSlot) {
        if slot.pending_count() >= slot.batch_size() {
            let resolution = slot.flush();
            self.inner.borrow_mut().resolve_queue.push(resolution);
        }
    }

    pub(crate) fn resolve_queue_is_empty(&self) -> bool {
        self.inner.borrow().resolve_queue.is_empty()
    }

    /// Pops the most recently queued resolution. LIFO is fine here:
    /// each resolution only touches its own promise's awaiters, so the
    /// order among different flushes is not observable.
    pub(crate) fn pop_resolution(&self) -> Option<EnqueuedResolution> {
        self.inner.borrow_mut().resolve_queue.pop()
    }

    pub(crate) fn any_pending(&self) -> bool {
        self.inner
            .borrow()
            .slots
            .iter()
            .any(|entry| entry.erased.pending_count() > 0)
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .iter()
            .map(|entry| entry.erased.batch_size())
            .max()
            .unwrap_or(0)
    }

    /// Flushes the slot with the most buffered keys (ties broken by
    /// registration order) onto the resolve queue. Returns false when
    /// no slot has anything buffered.
    pub(crate) fn flush_fullest(&self) -> bool {
        let fullest = {
            let inner = self.inner.borrow();
            let mut best: Option<(usize, Rc<dyn ErasedSlot>)> = None;
            for entry in &inner.slots {
                let count = entry.erased.pending_count();
                if count > 0 && best.as_ref().is_none_or(|(most, _)| count > *most) {
                    best = Some((count, entry.erased.clone()));
                }
            }
            match best {
                Some((_, slot)) => slot,
                None => return false,
            }
        };
        // The user fetch runs inside flush; the manager must not be
        // borrowed while it does.
        let resolution = fullest.flush();
        self.inner.borrow_mut().resolve_queue.push(resolution);
        true
    }
}

impl fmt::Debug for BatchLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLookup")
            .field("slots", &self.slot_count())
            .field("immediate", &self.in_immediate_scope())
            .finish_non_exhaustive()
    }
}

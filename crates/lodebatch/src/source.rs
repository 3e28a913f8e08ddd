use crate::Result;
use core::{fmt, hash::Hash};
use std::{collections::HashMap, rc::Rc};

/// The preferred batch size used when a source does not override it.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A bulk fetch composed into `keys -> key map` form, as stored by a
/// batch slot.
pub(crate) type FetchFn<K, V> = dyn Fn(&[K]) -> Result<HashMap<K, V>>;

/// A bulk fetch producing one value per key.
///
/// A source pairs the caller's fetch callback with a key selector that
/// recovers each value's key, plus the slot parameters (preferred batch
/// size and the optional default for
/// [`load_or_default`](crate::BatchLookup::load_or_default)).
///
/// Cloning a source is cheap and clones share identity: every clone
/// addresses the same batch slot inside a [`BatchLookup`], and the
/// parameters captured when the slot was first registered win over any
/// later divergence. Two sources built from separate `new` calls are
/// distinct slots even if their callbacks are identical, since closures
/// carry no comparable identity of their own.
///
/// # Example
/// ```
/// use lodebatch::BulkSource;
///
/// let users = BulkSource::new(
///     |ids: &[u32]| Ok(ids.iter().map(|id| format!("user-{id}")).collect()),
///     |name: &String| name[5..].parse().unwrap(),
/// )
/// .with_batch_size(64);
/// ```
///
/// [`BatchLookup`]: crate::BatchLookup
pub struct BulkSource<K, V> {
    fetch: Rc<FetchFn<K, V>>,
    batch_size: usize,
    default: Option<V>,
}

impl<K, V> Clone for BulkSource<K, V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            fetch: self.fetch.clone(),
            batch_size: self.batch_size,
            default: self.default.clone(),
        }
    }
}

impl<K, V> BulkSource<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    /// Creates a scalar source from a fetch callback and a key
    /// selector.
    ///
    /// `fetch` receives the batched keys exactly as enqueued
    /// (duplicates preserved, in enqueue order) and returns the fetched
    /// values; `key_of` maps each value back to its key. If the fetch
    /// yields several values for one key, the last one wins.
    pub fn new<F, S>(fetch: F, key_of: S) -> Self
    where
        F: Fn(&[K]) -> Result<Vec<V>> + 'static,
        S: Fn(&V) -> K + 'static,
    {
        let composed = move |keys: &[K]| -> Result<HashMap<K, V>> {
            let rows = fetch(keys)?;
            Ok(rows.into_iter().map(|row| (key_of(&row), row)).collect())
        };
        Self {
            fetch: Rc::new(composed),
            batch_size: DEFAULT_BATCH_SIZE,
            default: None,
        }
    }

    /// Sets the preferred batch size: once this many keys are buffered,
    /// the slot is eagerly scheduled for flushing.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the value substituted by
    /// [`load_or_default`](crate::BatchLookup::load_or_default) when a
    /// key is absent from the fetch result. Without an override the
    /// type's [`Default`] is used.
    #[must_use]
    pub fn with_default(mut self, default: V) -> Self {
        self.default = Some(default);
        self
    }

    pub(crate) fn fetch_handle(&self) -> Rc<FetchFn<K, V>> {
        self.fetch.clone()
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn default_value(&self) -> Option<V> {
        self.default.clone()
    }

    /// Stable slot identity: the address of the composed fetch
    /// allocation, shared by every clone of this source.
    pub(crate) fn ident(&self) -> usize {
        Rc::as_ptr(&self.fetch) as *const () as usize
    }
}

impl<K, V> fmt::Debug for BulkSource<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkSource")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// A bulk fetch producing any number of values per key.
///
/// The fetch returns a flat list; the source groups it by the key
/// selector into per-key lists, preserving fetch order within each
/// key. [`load_grouped`](crate::BatchLookup::load_grouped) then
/// concatenates the lists for the requested keys.
pub struct GroupSource<K, V> {
    fetch: Rc<FetchFn<K, Vec<V>>>,
    batch_size: usize,
}

impl<K, V> Clone for GroupSource<K, V> {
    fn clone(&self) -> Self {
        Self {
            fetch: self.fetch.clone(),
            batch_size: self.batch_size,
        }
    }
}

impl<K, V> GroupSource<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    /// Creates a grouping source from a flat-list fetch and a key
    /// selector.
    pub fn new<F, S>(fetch: F, key_of: S) -> Self
    where
        F: Fn(&[K]) -> Result<Vec<V>> + 'static,
        S: Fn(&V) -> K + 'static,
    {
        let composed = move |keys: &[K]| -> Result<HashMap<K, Vec<V>>> {
            let rows = fetch(keys)?;
            let mut grouped: HashMap<K, Vec<V>> = HashMap::new();
            for row in rows {
                grouped.entry(key_of(&row)).or_default().push(row);
            }
            Ok(grouped)
        };
        Self {
            fetch: Rc::new(composed),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Sets the preferred batch size, as
    /// [`BulkSource::with_batch_size`].
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub(crate) fn fetch_handle(&self) -> Rc<FetchFn<K, Vec<V>>> {
        self.fetch.clone()
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn ident(&self) -> usize {
        Rc::as_ptr(&self.fetch) as *const () as usize
    }
}

impl<K, V> fmt::Debug for GroupSource<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSource")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

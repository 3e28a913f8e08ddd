use crate::{
    Result,
    manager::NotFoundFactory,
    promise::PromiseFuture,
    slot::ResultMap,
};
use core::{
    any::type_name,
    fmt,
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

/// What a single-value lookup does when its key is absent from the
/// batch result map.
pub(crate) enum Miss<V> {
    /// Fail with the manager's not-found error.
    Fail(NotFoundFactory),
    /// Yield a substitute value instead.
    Substitute(V),
}

/// The future of one deferred (or immediate) single-value lookup.
///
/// Awaiting it suspends the task until the batch the key joined is
/// flushed, then projects the key's value out of the shared result
/// map. A lookup issued inside an immediate scope is already settled
/// when returned.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Lookup<K, V> {
    state: LookupState<K, V>,
}

enum LookupState<K, V> {
    Ready(Option<Result<V>>),
    Deferred {
        fut: PromiseFuture<ResultMap<K, V>>,
        key: K,
        on_miss: Miss<V>,
    },
}

impl<K, V> Unpin for Lookup<K, V> {}

impl<K, V> Lookup<K, V> {
    pub(crate) fn ready(out: Result<V>) -> Self {
        Self {
            state: LookupState::Ready(Some(out)),
        }
    }

    pub(crate) fn deferred(
        fut: PromiseFuture<ResultMap<K, V>>,
        key: K,
        on_miss: Miss<V>,
    ) -> Self {
        Self {
            state: LookupState::Deferred { fut, key, on_miss },
        }
    }
}

impl<K, V> Future for Lookup<K, V>
where
    K: Eq + Hash + fmt::Debug,
    V: Clone,
{
    type Output = Result<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let settled = match &mut this.state {
            LookupState::Ready(out) => {
                return match out.take() {
                    Some(out) => Poll::Ready(out),
                    None => panic!("`Lookup` polled after completion"),
                };
            }
            LookupState::Deferred { fut, .. } => match Pin::new(fut).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(settled) => settled,
            },
        };
        let LookupState::Deferred { key, on_miss, .. } =
            mem::replace(&mut this.state, LookupState::Ready(None))
        else {
            unreachable!()
        };
        let out = settled.and_then(|map| match map.get(&key) {
            Some(value) => Ok(value.clone()),
            None => match on_miss {
                Miss::Substitute(default) => Ok(default),
                Miss::Fail(not_found) => {
                    Err(not_found(&format!("{key:?}"), type_name::<V>()))
                }
            },
        });
        Poll::Ready(out)
    }
}

/// The future of a multi-key lookup: [`load_many`] over a scalar
/// source, or [`load_grouped`] over a grouping source.
///
/// [`load_many`]: crate::BatchLookup::load_many
/// [`load_grouped`]: crate::BatchLookup::load_grouped
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct LookupAll<K, V> {
    state: AllState<K, V>,
}

enum AllState<K, V> {
    Ready(Option<Result<Vec<V>>>),
    Multi {
        fut: PromiseFuture<ResultMap<K, V>>,
        keys: Vec<K>,
    },
    Grouped {
        fut: PromiseFuture<ResultMap<K, Vec<V>>>,
        keys: Vec<K>,
    },
}

impl<K, V> Unpin for LookupAll<K, V> {}

impl<K, V> LookupAll<K, V> {
    pub(crate) fn ready(out: Result<Vec<V>>) -> Self {
        Self {
            state: AllState::Ready(Some(out)),
        }
    }

    pub(crate) fn multi(fut: PromiseFuture<ResultMap<K, V>>, keys: Vec<K>) -> Self {
        Self {
            state: AllState::Multi { fut, keys },
        }
    }

    pub(crate) fn grouped(fut: PromiseFuture<ResultMap<K, Vec<V>>>, keys: Vec<K>) -> Self {
        Self {
            state: AllState::Grouped { fut, keys },
        }
    }
}

impl<K, V> Future for LookupAll<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    type Output = Result<Vec<V>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let out = match &mut this.state {
            AllState::Ready(out) => {
                return match out.take() {
                    Some(out) => Poll::Ready(out),
                    None => panic!("`LookupAll` polled after completion"),
                };
            }
            // Keys absent from the result map contribute nothing; the
            // caller's key order is preserved for the rest.
            AllState::Multi { fut, keys } => match Pin::new(fut).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(settled) => settled.map(|map| {
                    keys.iter().filter_map(|key| map.get(key).cloned()).collect()
                }),
            },
            AllState::Grouped { fut, keys } => match Pin::new(fut).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(settled) => settled.map(|map| {
                    keys.iter()
                        .filter_map(|key| map.get(key))
                        .flat_map(|values| values.iter().cloned())
                        .collect()
                }),
            },
        };
        this.state = AllState::Ready(None);
        Poll::Ready(out)
    }
}

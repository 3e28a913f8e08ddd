use crate::{BatchLookup, BulkSource, Error, GroupSource, Result, resolve};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};
use futures::FutureExt;
use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

type BatchLog = Rc<RefCell<Vec<Vec<u32>>>>;

fn spell(key: u32) -> String {
    format!("Value for {key}")
}

fn key_of(value: &String) -> u32 {
    value
        .rsplit(' ')
        .next()
        .and_then(|tail| tail.parse().ok())
        .unwrap()
}

/// A scalar source that spells out each key and records every batch it
/// is invoked with.
fn recorded_source(log: &BatchLog, batch_size: usize) -> BulkSource<u32, String> {
    let log = log.clone();
    BulkSource::new(
        move |keys: &[u32]| {
            log.borrow_mut().push(keys.to_vec());
            Ok(keys.iter().copied().map(spell).collect())
        },
        key_of,
    )
    .with_batch_size(batch_size)
}

#[test]
fn concurrent_lookups_coalesce_into_one_batch() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    let tasks = (0..10u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move { lookups.load(key, &source).await }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(out, (0..10).map(spell).collect::<Vec<_>>());
    assert_eq!(*log.borrow(), vec![(0..10).collect::<Vec<u32>>()]);
}

#[test]
fn batches_split_at_the_preferred_size() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 4);

    let tasks = (0..10u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move { lookups.load(key, &source).await }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(out, (0..10).map(spell).collect::<Vec<_>>());
    assert_eq!(
        *log.borrow(),
        vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
    );
}

#[test]
fn chained_lookups_form_one_batch_per_round() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    let tasks = (0..10u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move {
            let first = lookups.load(key, &source).await?;
            let second = lookups.load(key + 100, &source).await?;
            Ok(format!("{first}{second}"))
        }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(
        out,
        (0..10)
            .map(|key| format!("{}{}", spell(key), spell(key + 100)))
            .collect::<Vec<_>>()
    );
    // Every first-round key batches before any second-round lookup runs.
    assert_eq!(
        *log.borrow(),
        vec![
            (0..10).collect::<Vec<u32>>(),
            (100..110).collect::<Vec<u32>>(),
        ]
    );
}

#[test]
fn grouped_lookups_concatenate_each_keys_values() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = {
        let log = log.clone();
        GroupSource::new(
            move |keys: &[u32]| {
                log.borrow_mut().push(keys.to_vec());
                Ok(keys
                    .iter()
                    .flat_map(|k| [format!("Value 1 for {k}"), format!("Value 2 for {k}")])
                    .collect())
            },
            key_of,
        )
    };

    let tasks = (0..10u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move {
            let values = lookups.load_grouped([key], &source).await?;
            Ok(values.join("_"))
        }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(
        out,
        (0..10)
            .map(|k| format!("Value 1 for {k}_Value 2 for {k}"))
            .collect::<Vec<_>>()
    );
    assert_eq!(*log.borrow(), vec![(0..10).collect::<Vec<u32>>()]);
}

#[test]
fn overlapping_keysets_batch_without_deduplication() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    let keysets = [vec![5u32, 3], vec![5, 2]];
    let tasks = keysets.into_iter().map(|keys| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move {
            let values = lookups.load_many(keys, &source).await?;
            Ok(values.join("_"))
        }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(
        out,
        vec![
            format!("{}_{}", spell(5), spell(3)),
            format!("{}_{}", spell(5), spell(2)),
        ]
    );
    assert_eq!(*log.borrow(), vec![vec![5, 3, 5, 2]]);
}

#[test]
fn a_failing_bulk_fetch_reaches_every_queued_caller_once() {
    let lookups = BatchLookup::new();
    let source = BulkSource::new(
        |_: &[u32]| -> Result<Vec<String>> { Err(Error::bulk("backing store offline")) },
        key_of,
    )
    .with_batch_size(100);

    let tasks = (0..10u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move { lookups.load(key, &source).await }
    });
    let mut out = resolve(tasks, &lookups);

    assert_eq!(out.next(), Some(Err(Error::bulk("backing store offline"))));
    // The driver is fused after the first failure.
    assert!(out.next().is_none());
}

#[test]
fn the_not_found_factory_shapes_the_error() {
    let lookups = BatchLookup::with_not_found(|_, _| Error::custom("oh noes"));
    let source = BulkSource::new(
        |_: &[u32]| Ok(vec![spell(123)]),
        key_of,
    )
    .with_batch_size(100);

    let tasks = (0..2u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move { lookups.load(key, &source).await }
    });
    let mut out = resolve(tasks, &lookups);

    assert_eq!(out.next(), Some(Err(Error::custom("oh noes"))));
    assert!(out.next().is_none());
}

#[test]
fn immediate_scopes_bypass_buffering() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    // Deferred: the future suspends and the key sits in the buffer.
    let deferred = lookups.load(0, &source);
    assert!(deferred.now_or_never().is_none());
    let slots_before = lookups.slot_count();

    // Immediate: the same call is settled on return, and the registry
    // does not grow.
    let scope = lookups.immediate_scope();
    let immediate = lookups.load(0, &source).now_or_never();
    scope.end().unwrap();

    assert_eq!(immediate, Some(Ok(spell(0))));
    assert_eq!(lookups.slot_count(), slots_before);
    // Only the immediate call reached the bulk fetch; the buffered key
    // is still waiting.
    assert_eq!(*log.borrow(), vec![vec![0]]);
    assert!(lookups.any_pending());
}

#[test]
fn the_fullest_slot_flushes_first() {
    let log: Rc<RefCell<Vec<(char, Vec<u32>)>>> = Rc::default();
    let lookups = BatchLookup::new();
    let tagged = |tag: char| {
        let log = log.clone();
        BulkSource::new(
            move |keys: &[u32]| {
                log.borrow_mut().push((tag, keys.to_vec()));
                Ok(keys.iter().copied().map(spell).collect())
            },
            key_of,
        )
    };
    let wide = tagged('a');
    let narrow = tagged('b');

    let tasks = (0..5u32).map(|key| {
        let lookups = lookups.clone();
        let wide = wide.clone();
        let narrow = narrow.clone();
        async move {
            if key < 3 {
                lookups.load(key, &wide).await
            } else {
                lookups.load(key, &narrow).await
            }
        }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(out, (0..5).map(spell).collect::<Vec<_>>());
    assert_eq!(
        *log.borrow(),
        vec![('a', vec![0, 1, 2]), ('b', vec![3, 4])]
    );
}

#[test]
fn a_small_initial_window_caps_the_first_batch() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    let tasks = (0..5u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move { lookups.load(key, &source).await }
    });
    let out = resolve(tasks, &lookups)
        .with_initial_window(2)
        .collect::<Result<Vec<_>>>()
        .unwrap();

    assert_eq!(out, (0..5).map(spell).collect::<Vec<_>>());
    // After the first flush the window is retuned to the slot's batch
    // size, so the remaining tasks share one batch.
    assert_eq!(*log.borrow(), vec![vec![0, 1], vec![2, 3, 4]]);
}

#[test]
fn iteration_stops_at_the_first_failed_task() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    let tasks = (0..5u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        async move {
            if key == 2 {
                return Err(Error::custom("task exploded"));
            }
            lookups.load(key, &source).await
        }
    });
    let mut out = resolve(tasks, &lookups);

    assert_eq!(out.next(), Some(Ok(spell(0))));
    assert_eq!(out.next(), Some(Ok(spell(1))));
    assert_eq!(out.next(), Some(Err(Error::custom("task exploded"))));
    assert!(out.next().is_none());
}

/// A timer the driver knows nothing about: completion comes from
/// another thread through the task's waker.
struct ThreadSleep {
    shared: Arc<SleepShared>,
    duration: Duration,
    started: bool,
}

struct SleepShared {
    done: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl ThreadSleep {
    fn new(duration: Duration) -> Self {
        Self {
            shared: Arc::new(SleepShared {
                done: AtomicBool::new(false),
                waker: Mutex::new(None),
            }),
            duration,
            started: false,
        }
    }
}

impl Future for ThreadSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.done.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
        if !self.started {
            self.started = true;
            let shared = self.shared.clone();
            let duration = self.duration;
            thread::spawn(move || {
                thread::sleep(duration);
                shared.done.store(true, Ordering::Release);
                if let Some(waker) = shared.waker.lock().unwrap().take() {
                    waker.wake();
                }
            });
        }
        Poll::Pending
    }
}

#[test]
fn the_driver_waits_out_non_lookup_futures() {
    let log = BatchLog::default();
    let lookups = BatchLookup::new();
    let source = recorded_source(&log, 100);

    // The second task's timer fires well before the first's, so its
    // lookup batches first; the output order is still the source order.
    let delays = [Duration::from_millis(40), Duration::from_millis(5)];
    let tasks = (0..2u32).map(|key| {
        let lookups = lookups.clone();
        let source = source.clone();
        let delay = delays[key as usize];
        async move {
            ThreadSleep::new(delay).await;
            lookups.load(key, &source).await
        }
    });
    let out = resolve(tasks, &lookups).collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(out, vec![spell(0), spell(1)]);
    assert_eq!(*log.borrow(), vec![vec![1], vec![0]]);
}

// Copyright 2025-2026 mvstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cell::{Cell, Enlisted};
use crate::result::{StmError, StmResult};
use crate::runtime::runtime;
use crate::transaction;

pub(crate) type TestFn = Box<dyn Fn() -> StmResult<bool> + Send + Sync>;
pub(crate) type BodyFn = Box<dyn Fn() -> StmResult<bool> + Send + Sync>;

/// Handle returned by [`conditional`](crate::conditional), used to cancel
/// the subscription.
#[derive(Debug, Clone)]
pub struct ConditionalHandle {
    pub(crate) id: u64,
}

/// A registered conditional: the test, the body, and the cells the test read
/// the last time it ran. An empty read set marks the subscription inactive,
/// for triggers that captured it before it was cancelled.
struct Subscription {
    id: u64,
    test: TestFn,
    body: BodyFn,
    read_set: Mutex<HashSet<usize>>,
}

/// Re-runs conditional subscriptions whose read set intersects a committed
/// write set.
///
/// The (cell → subscriptions) index lives in a [`Cell`] of its own, so
/// registration and re-indexing commit or roll back together with the
/// transaction performing them.
pub(crate) struct Subscriber {
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Arc<Subscription>>>,
    index: Cell<HashMap<usize, Vec<u64>>>,
}

impl Subscriber {
    pub(crate) fn new() -> Subscriber {
        Subscriber {
            next_id: AtomicU64::new(0),
            registry: Mutex::new(HashMap::new()),
            index: Cell::new(HashMap::new()),
        }
    }

    /// Register a new subscription.
    ///
    /// The test runs once, isolated, to capture its read set; its verdict is
    /// ignored here. The subscription only becomes visible to triggers when
    /// the enclosing transaction commits.
    pub(crate) fn register(&self, test: TestFn, body: BodyFn) -> StmResult<ConditionalHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let subscription = Arc::new(Subscription {
            id,
            test,
            body,
            read_set: Mutex::new(HashSet::new()),
        });
        runtime().run(|| {
            let (_, read_set) = transaction::run_isolated_capture(|| (subscription.test)())?;
            if read_set.is_empty() {
                return Err(StmError::EmptyConditionalReadSet);
            }
            self.index_insert(id, &read_set)?;
            let sub = subscription.clone();
            let captured = read_set.clone();
            crate::side_effect(move || {
                *sub.read_set.lock() = captured;
                runtime().subscriptions.registry.lock().insert(sub.id, sub.clone());
            })?;
            Ok(ConditionalHandle { id })
        })
    }

    /// Cancel a subscription: drop it from every index entry of its read set
    /// and blank the read set so in-flight triggers skip it.
    pub(crate) fn cancel(&self, id: u64) -> StmResult<()> {
        let subscription = { self.registry.lock().get(&id).cloned() };
        let Some(subscription) = subscription else {
            return Ok(());
        };
        runtime().run(|| {
            let current = subscription.read_set.lock().clone();
            self.deactivate(&subscription, &current)
        })
    }

    /// Fire every subscription whose read set intersects the trigger set.
    ///
    /// Runs on the committing thread, after that commit's side effects.
    pub(crate) fn notify(&self, trigger: &[Arc<dyn Enlisted>]) -> StmResult<()> {
        if self.registry.lock().is_empty() {
            return Ok(());
        }
        let index = self.index.get()?;
        let mut fired = Vec::new();
        let mut seen = HashSet::new();
        for core in trigger {
            if let Some(subscriptions) = index.get(&core.address()) {
                for id in subscriptions {
                    if seen.insert(*id) {
                        fired.push(*id);
                    }
                }
            }
        }
        for id in fired {
            let subscription = { self.registry.lock().get(&id).cloned() };
            if let Some(subscription) = subscription {
                self.fire(&subscription)?;
            }
        }
        Ok(())
    }

    /// Re-run one triggered subscription in a fresh transaction.
    fn fire(&self, subscription: &Arc<Subscription>) -> StmResult<()> {
        if subscription.read_set.lock().is_empty() {
            // Cancelled after the trigger captured it.
            return Ok(());
        }
        trace!(subscription = subscription.id, "conditional triggered");
        runtime().run(|| {
            let (hit, read_set) = transaction::run_isolated_capture(|| (subscription.test)())?;
            if read_set.is_empty() {
                return Err(StmError::EmptyConditionalReadSet);
            }
            let previous = subscription.read_set.lock().clone();
            if read_set != previous {
                self.reindex(subscription, &previous, &read_set)?;
            }
            if hit {
                let keep = (subscription.body)()?;
                if !keep {
                    self.deactivate(subscription, &read_set)?;
                }
            }
            Ok(())
        })
    }

    fn index_insert(&self, id: u64, cells: &HashSet<usize>) -> StmResult<()> {
        let cells: Vec<usize> = cells.iter().copied().collect();
        self.index.modify(move |mut map| {
            for cell in &cells {
                let subscriptions = map.entry(*cell).or_default();
                if !subscriptions.contains(&id) {
                    subscriptions.push(id);
                }
            }
            map
        })
    }

    /// Move the subscription to the cells its test reads now.
    fn reindex(
        &self,
        subscription: &Arc<Subscription>,
        previous: &HashSet<usize>,
        current: &HashSet<usize>,
    ) -> StmResult<()> {
        let id = subscription.id;
        let added: Vec<usize> = current.difference(previous).copied().collect();
        let removed: Vec<usize> = previous.difference(current).copied().collect();
        self.index.modify(move |mut map| {
            for cell in &removed {
                if let Some(subscriptions) = map.get_mut(cell) {
                    subscriptions.retain(|s| *s != id);
                    if subscriptions.is_empty() {
                        map.remove(cell);
                    }
                }
            }
            for cell in &added {
                let subscriptions = map.entry(*cell).or_default();
                if !subscriptions.contains(&id) {
                    subscriptions.push(id);
                }
            }
            map
        })?;
        let subscription = subscription.clone();
        let current = current.clone();
        crate::side_effect(move || {
            *subscription.read_set.lock() = current;
        })
    }

    /// Remove the subscription from the index; on commit, blank its read set
    /// and drop it from the registry.
    fn deactivate(
        &self,
        subscription: &Arc<Subscription>,
        current: &HashSet<usize>,
    ) -> StmResult<()> {
        let id = subscription.id;
        let cells: Vec<usize> = current.iter().copied().collect();
        self.index.modify(move |mut map| {
            for cell in &cells {
                if let Some(subscriptions) = map.get_mut(cell) {
                    subscriptions.retain(|s| *s != id);
                    if subscriptions.is_empty() {
                        map.remove(cell);
                    }
                }
            }
            map
        })?;
        let subscription = subscription.clone();
        crate::side_effect(move || {
            subscription.read_set.lock().clear();
            runtime()
                .subscriptions
                .registry
                .lock()
                .remove(&subscription.id);
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::{cancel_conditional, conditional, run_transaction, Cell, StmError};

    #[test]
    fn registration_requires_a_read_set() {
        let result = conditional(|| Ok(true), || Ok(true));
        assert_eq!(result.unwrap_err(), StmError::EmptyConditionalReadSet);
    }

    #[test]
    fn fires_on_every_matching_commit() {
        let flag = Cell::new(false);
        let counter = Cell::new(0);

        let flag_t = flag.clone();
        let counter_b = counter.clone();
        conditional(
            move || flag_t.get(),
            move || {
                counter_b.modify(|n| n + 1)?;
                Ok(true)
            },
        )
        .unwrap();

        let f = flag.clone();
        run_transaction(move || f.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 1);

        // Writing `true` again still triggers; the test passes again.
        let f = flag.clone();
        run_transaction(move || f.set(true)).unwrap();
        assert_eq!(counter.get().unwrap(), 2);

        // A trigger whose test fails does not run the body.
        let f = flag.clone();
        run_transaction(move || f.set(false)).unwrap();
        assert_eq!(counter.get().unwrap(), 2);
    }

    #[test]
    fn body_returning_false_unregisters() {
        let flag = Cell::new(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let flag_t = flag.clone();
        let runs_b = runs.clone();
        conditional(
            move || flag_t.get(),
            move || {
                runs_b.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            },
        )
        .unwrap();

        let f = flag.clone();
        run_transaction(move || f.set(true)).unwrap();
        let f = flag.clone();
        run_transaction(move || f.set(true)).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_stops_firing() {
        let flag = Cell::new(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let flag_t = flag.clone();
        let runs_b = runs.clone();
        let handle = conditional(
            move || flag_t.get(),
            move || {
                runs_b.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            },
        )
        .unwrap();

        cancel_conditional(&handle).unwrap();

        let f = flag.clone();
        run_transaction(move || f.set(true)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    /// When the test's read set changes, the subscription follows it.
    #[test]
    fn changed_read_set_is_reindexed() {
        let selector = Cell::new(false);
        let a = Cell::new(false);
        let b = Cell::new(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let sel_t = selector.clone();
        let a_t = a.clone();
        let b_t = b.clone();
        let runs_b = runs.clone();
        conditional(
            move || {
                if sel_t.get()? {
                    a_t.get()
                } else {
                    b_t.get()
                }
            },
            move || {
                runs_b.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            },
        )
        .unwrap();

        // Watched set is {selector, b}: a write to `a` does not trigger.
        let a2 = a.clone();
        run_transaction(move || a2.set(true)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Flipping the selector triggers and re-indexes onto {selector, a};
        // the test now reads `a`, which is already true.
        let s2 = selector.clone();
        run_transaction(move || s2.set(true)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // `b` is no longer watched.
        let b2 = b.clone();
        run_transaction(move || b2.set(true)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // `a` is.
        let a2 = a.clone();
        run_transaction(move || a2.set(false)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let a2 = a.clone();
        run_transaction(move || a2.set(true)).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}

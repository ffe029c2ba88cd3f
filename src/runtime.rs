// Copyright 2025-2026 mvstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cell::Enlisted;
use crate::conditional::Subscriber;
use crate::result::{StmError, StmResult};
use crate::transaction::{self, TransactionContext};

/// A version number handed out by the runtime.
///
/// Start stamps are read-only snapshots; write stamps are assigned at commit
/// and are strictly increasing across all committed transactions.
pub type Stamp = u64;

/// Reclamation runs once per this many commits.
const RECLAIM_INTERVAL: u64 = 16;

static RUNTIME: Lazy<Runtime> = Lazy::new(Runtime::new);

/// The process-wide runtime.
pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

enum CommitOutcome {
    Committed,
    /// Preflight lost against a concurrent commit; the whole transaction
    /// must re-run.
    Conflict,
    Failed(StmError),
}

/// Process-wide transaction services: stamp allocation, the active
/// transaction set, two-phase commit under the stamp lock, and reclamation
/// of obsolete cell versions.
pub(crate) struct Runtime {
    /// The newest committed stamp. Written only by the commit path while it
    /// holds `stamp_lock`.
    last_stamp: AtomicU64,
    /// Serializes write-stamp assignment; held only for the `can_commit`
    /// sweep and the stamp increment.
    stamp_lock: Mutex<()>,
    /// Start stamps of live transactions, with multiplicity.
    active_starts: Mutex<BTreeMap<Stamp, usize>>,
    /// Cells that accumulated history, tagged with the commit that made the
    /// previous version obsolete. Producers are committing threads; the
    /// reclaimer drains from the front.
    retired: Mutex<VecDeque<(Stamp, Vec<Arc<dyn Enlisted>>)>>,
    commits: AtomicU64,
    reclaiming: AtomicBool,
    pub(crate) subscriptions: Subscriber,
}

/// Rolls the transaction back if the body unwinds.
struct PanicGuard<'a> {
    runtime: &'a Runtime,
    start: Stamp,
    active: bool,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.runtime.abort_current(self.start);
        }
    }
}

impl Runtime {
    fn new() -> Runtime {
        Runtime {
            last_stamp: AtomicU64::new(0),
            stamp_lock: Mutex::new(()),
            active_starts: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(VecDeque::new()),
            commits: AtomicU64::new(0),
            reclaiming: AtomicBool::new(false),
            subscriptions: Subscriber::new(),
        }
    }

    /// Drive `body` through the start / retry / commit protocol.
    ///
    /// When a transaction is already running on this thread, the body simply
    /// joins it.
    pub(crate) fn run<T, F>(&self, mut body: F) -> StmResult<T>
    where
        F: FnMut() -> StmResult<T>,
    {
        if transaction::in_transaction() {
            return body();
        }
        loop {
            let start = self.open_transaction();
            transaction::install(start);
            let mut guard = PanicGuard {
                runtime: self,
                start,
                active: true,
            };
            let outcome = body();
            guard.active = false;
            match outcome {
                Ok(value) => match self.commit_current(start) {
                    CommitOutcome::Committed => return Ok(value),
                    CommitOutcome::Conflict => continue,
                    CommitOutcome::Failed(e) => return Err(e),
                },
                Err(e) => {
                    self.abort_current(start);
                    if e.is_retry() {
                        debug!(error = %e, "transaction re-running");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Allocate a start stamp and make the transaction live, as one step.
    fn open_transaction(&self) -> Stamp {
        let mut starts = self.active_starts.lock();
        let stamp = self.last_stamp.load(Ordering::SeqCst);
        *starts.entry(stamp).or_insert(0) += 1;
        stamp
    }

    fn close(&self, start: Stamp) {
        let mut starts = self.active_starts.lock();
        if let Some(count) = starts.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                starts.remove(&start);
            }
        }
    }

    /// Roll the context's cells back, close the transaction and deliver the
    /// rollback side effects, in that order.
    fn rollback_ctx(&self, start: Stamp, mut ctx: TransactionContext) {
        for core in ctx.commute_cores() {
            core.rollback();
        }
        for core in ctx.outer_cores() {
            core.rollback();
        }
        self.close(start);
        for effect in ctx.side_effects.drain(..) {
            if let Some(on_rollback) = effect.on_rollback {
                on_rollback();
            }
        }
    }

    pub(crate) fn abort_current(&self, start: Stamp) {
        match transaction::uninstall() {
            Some(ctx) => self.rollback_ctx(start, ctx),
            None => self.close(start),
        }
    }

    fn deliver_on_commit(mut ctx: TransactionContext) {
        for effect in ctx.side_effects.drain(..) {
            if let Some(on_commit) = effect.on_commit {
                on_commit();
            }
        }
    }

    /// Two-phase commit of the transaction on this thread.
    fn commit_current(&self, start: Stamp) -> CommitOutcome {
        let info = transaction::with_context(|ctx| (ctx.has_commutes(), ctx.outer_cores()));
        let (has_commutes, outer) = match info {
            Ok(info) => info,
            Err(e) => return CommitOutcome::Failed(e),
        };
        let has_writes = outer.iter().any(|core| core.has_changes());

        // A transaction that changed nothing commits against its own
        // snapshot with no validation at all.
        if !has_commutes && !has_writes {
            for core in &outer {
                core.commit();
            }
            self.close(start);
            if let Some(ctx) = transaction::uninstall() {
                Self::deliver_on_commit(ctx);
            }
            self.tick_reclaim();
            return CommitOutcome::Committed;
        }

        let (version, trigger) = loop {
            // Execute deferred commutes against the newest committed state,
            // so disjoint commuters don't invalidate each other.
            let mut commute_stamp = start;
            let mut commute_cores: Vec<Arc<dyn Enlisted>> = Vec::new();
            if has_commutes {
                commute_stamp = self.last_stamp.load(Ordering::SeqCst);
                if let Err(e) = transaction::enter_commute_phase(commute_stamp) {
                    return CommitOutcome::Failed(e);
                }
                let ran = transaction::run_all_commutes();
                commute_cores =
                    transaction::with_context(|ctx| ctx.commute_cores()).unwrap_or_default();
                if let Err(e) = ran {
                    for core in &commute_cores {
                        core.rollback();
                    }
                    if let Err(left) = transaction::leave_commute_phase(start) {
                        return CommitOutcome::Failed(left);
                    }
                    if e.is_retry() {
                        debug!("commute lost against a newer commit, re-running commutes");
                        continue;
                    }
                    self.abort_current(start);
                    return CommitOutcome::Failed(e);
                }
            }

            // Phase 1: claim every written cell under the stamp lock.
            let mut acked: Vec<Arc<dyn Enlisted>> = Vec::new();
            let stamp_guard = self.stamp_lock.lock();
            let proposed = self.last_stamp.load(Ordering::SeqCst) + 1;

            let commutes_ok = commute_cores.iter().all(|core| {
                let ok = core.can_commit(commute_stamp, proposed);
                if ok {
                    acked.push(core.clone());
                }
                ok
            });
            if !commutes_ok {
                drop(stamp_guard);
                for core in &acked {
                    core.rollback();
                }
                for core in &commute_cores {
                    core.rollback();
                }
                if let Err(left) = transaction::leave_commute_phase(start) {
                    return CommitOutcome::Failed(left);
                }
                debug!("commute preflight conflicted, re-running commutes");
                continue;
            }

            // The outer cells are validated against the body's own snapshot.
            if let Err(left) = transaction::leave_commute_phase(start) {
                return CommitOutcome::Failed(left);
            }
            let outer_ok = outer.iter().all(|core| {
                let ok = core.can_commit(start, proposed);
                if ok {
                    acked.push(core.clone());
                }
                ok
            });
            if !outer_ok {
                drop(stamp_guard);
                for core in &acked {
                    core.rollback();
                }
                debug!(start, "commit conflict, restarting transaction");
                self.abort_current(start);
                return CommitOutcome::Conflict;
            }

            self.last_stamp.store(proposed, Ordering::SeqCst);
            drop(stamp_guard);

            // Phase 2: link the new versions; other transactions may commit
            // or roll back concurrently from here on.
            let mut trigger: Vec<Arc<dyn Enlisted>> = Vec::new();
            for core in commute_cores.iter().chain(outer.iter()) {
                if core.has_changes() {
                    trigger.push(core.clone());
                }
                core.commit();
            }
            break (proposed, trigger);
        };

        if !trigger.is_empty() {
            self.retired.lock().push_back((version, trigger.clone()));
        }
        self.close(start);
        debug!(version, cells = trigger.len(), "transaction committed");
        if let Some(ctx) = transaction::uninstall() {
            Self::deliver_on_commit(ctx);
        }
        let outcome = if trigger.is_empty() {
            CommitOutcome::Committed
        } else {
            match self.subscriptions.notify(&trigger) {
                Ok(()) => CommitOutcome::Committed,
                Err(e) => CommitOutcome::Failed(e),
            }
        };
        self.tick_reclaim();
        outcome
    }

    /// Drop history no live transaction can still see.
    ///
    /// Runs on the committing thread once every `RECLAIM_INTERVAL` commits,
    /// single-flighted behind a flag. Any record at or below the threshold
    /// stays reachable, so every live snapshot keeps a value to read.
    fn tick_reclaim(&self) {
        let ticks = self.commits.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % RECLAIM_INTERVAL != 0 {
            return;
        }
        if self
            .reclaiming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let threshold = {
            let starts = self.active_starts.lock();
            starts
                .keys()
                .next()
                .copied()
                .unwrap_or_else(|| self.last_stamp.load(Ordering::SeqCst))
        };
        let mut victims: BTreeMap<usize, Arc<dyn Enlisted>> = BTreeMap::new();
        loop {
            let entry = {
                let mut retired = self.retired.lock();
                match retired.front() {
                    Some((version, _)) if *version < threshold => retired.pop_front(),
                    _ => None,
                }
            };
            let Some((_, cells)) = entry else { break };
            for core in cells {
                victims.insert(core.address(), core);
            }
        }
        for core in victims.values() {
            core.trim(threshold);
        }
        trace!(threshold, cells = victims.len(), "trimmed obsolete versions");
        self.reclaiming.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::{rollback, run_transaction, Cell};

    #[test]
    fn commit_stamps_are_monotone() {
        let cell = Cell::new(0);
        let mut last = cell.head_version();
        for i in 1..=5 {
            let c = cell.clone();
            run_transaction(move || c.set(i)).unwrap();
            let version = cell.head_version();
            assert!(version > last);
            last = version;
        }
    }

    #[test]
    fn read_only_commit_keeps_head_version() {
        let cell = Cell::new(7);
        let before = cell.head_version();
        let c = cell.clone();
        run_transaction(move || c.get()).unwrap();
        assert_eq!(cell.head_version(), before);
    }

    #[test]
    fn nested_transactions_join() {
        let a = Cell::new(0);
        let b = Cell::new(0);
        let a2 = a.clone();
        let b2 = b.clone();

        run_transaction(move || {
            a2.set(1)?;
            run_transaction(|| b2.set(2))
        })
        .unwrap();

        assert_eq!(a.get().unwrap(), 1);
        assert_eq!(b.get().unwrap(), 2);
    }

    #[test]
    fn rollback_discards_transaction() {
        let cell = Cell::new(1);
        let c = cell.clone();
        let result: StmResult<()> = run_transaction(move || {
            c.set(2)?;
            rollback(false)
        });
        assert_eq!(result, Err(StmError::ExplicitRollback { retry: false }));
        assert_eq!(cell.get().unwrap(), 1);
    }

    /// A transaction whose read set moved under it re-runs and sees the
    /// newer commit.
    #[test]
    fn conflicting_write_is_rerun() {
        let cell = Cell::new(0);
        let cellc = cell.clone();

        let worker = thread::spawn(move || {
            run_transaction(|| {
                let x = cellc.get()?;
                // Hold the snapshot long enough for the other commit to land.
                thread::sleep(Duration::from_millis(300));
                cellc.set(x + 10)
            })
            .unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        let c = cell.clone();
        run_transaction(move || c.set(32)).unwrap();

        worker.join().unwrap();
        assert_eq!(cell.get().unwrap(), 42);
    }

    /// History older than every live snapshot is trimmed away.
    #[test]
    fn reclamation_trims_history() {
        let cell = Cell::new(0u64);
        for i in 1..=(4 * RECLAIM_INTERVAL) {
            let c = cell.clone();
            run_transaction(move || c.set(i)).unwrap();
            // Spread the commits out so snapshots held by concurrently
            // running tests stop pinning the reclamation threshold.
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cell.chain_len() < 3 * RECLAIM_INTERVAL as usize);
        assert_eq!(cell.get().unwrap(), 4 * RECLAIM_INTERVAL);
    }
}

// Copyright 2025-2026 mvstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::parker::Parker;
use crate::result::{StmError, StmResult};
use crate::runtime::Stamp;
use crate::transaction;

/// One committed value in a cell's history.
///
/// Records form a chain ordered by strictly decreasing `version`. A record is
/// never mutated after it is linked; only its `older` pointer is detached by
/// the reclaimer, so readers that walked past the detach point stay valid.
pub(crate) struct Record<T> {
    pub(crate) version: Stamp,
    pub(crate) value: T,
    older: RwLock<Option<Arc<Record<T>>>>,
}

/// The cell-level lock, held by a committer between phase 1 and phase 2.
struct WriteStamp {
    owner: ThreadId,
    /// The proposed commit version. `None` means claimed but not yet
    /// stamped; readers treat that as "not yet visible, wait".
    version: Option<Stamp>,
}

/// The capability set a cell exposes to the transaction machinery.
///
/// Cells of heterogeneous value types are enlisted through this object-safe
/// interface; the typed [`Cell`] front is only a convenience.
pub(crate) trait Enlisted: Send + Sync {
    /// Stable identity of the cell, unique while it is alive.
    fn address(&self) -> usize;
    /// Opaque grouping tag, for callers that manage families of cells.
    fn owner(&self) -> u64;
    /// Whether the current thread holds a tentative write for this cell.
    fn has_changes(&self) -> bool;
    /// Phase-1 check: no competing writer and no commit past `start_stamp`.
    /// Claims the write stamp at `proposed` when local changes exist.
    fn can_commit(&self, start_stamp: Stamp, proposed: Stamp) -> bool;
    /// Phase-2 apply: link the pending value as the new head and release.
    fn commit(&self);
    /// Discard the current thread's tentative state and release the cell.
    fn rollback(&self);
    /// Detach history older than the newest record at or below `below`.
    fn trim(&self, below: Stamp);
    /// Park until no competing writer is visible at `start_stamp`.
    fn wait_for_writer(&self, start_stamp: Stamp);
}

/// `CellCore` is the shared, untyped-agnostic inner of a [`Cell`].
///
/// It owns the version chain, the write stamp and the per-thread tentative
/// writes. It is accessed from other threads directly, whereas `Cell` is the
/// typesafe wrapper around it.
pub(crate) struct CellCore<T> {
    /// Head of the version chain; the newest committed record.
    head: RwLock<Arc<Record<T>>>,
    write_stamp: Mutex<Option<WriteStamp>>,
    parker: Parker,
    /// Tentative new values, one slot per writing thread.
    pending: Mutex<HashMap<ThreadId, T>>,
    owner_tag: Option<u64>,
}

impl<T> CellCore<T>
where
    T: Send + Sync + Clone + 'static,
{
    fn new(value: T, owner_tag: Option<u64>) -> Arc<CellCore<T>> {
        Arc::new(CellCore {
            head: RwLock::new(Arc::new(Record {
                version: 0,
                value,
                older: RwLock::new(None),
            })),
            write_stamp: Mutex::new(None),
            parker: Parker::new(),
            pending: Mutex::new(HashMap::new()),
            owner_tag,
        })
    }

    fn cell_address(&self) -> usize {
        self as *const CellCore<T> as *const () as usize
    }

    /// The newest committed value, ignoring any transaction.
    fn head_value(&self) -> T {
        self.head.read().value.clone()
    }

    fn head_version(&self) -> Stamp {
        self.head.read().version
    }

    /// Walk the chain for the newest record with `version <= stamp`.
    fn snapshot(&self, stamp: Stamp) -> T {
        let mut record = self.head.read().clone();
        loop {
            if record.version <= stamp {
                return record.value.clone();
            }
            let older = record.older.read().clone();
            match older {
                Some(next) => record = next,
                // The oldest reachable record backs every earlier stamp.
                None => return record.value.clone(),
            }
        }
    }

    fn pending_value(&self) -> Option<T> {
        self.pending.lock().get(&thread::current().id()).cloned()
    }

    fn store_pending(&self, value: T) {
        self.pending.lock().insert(thread::current().id(), value);
    }

    /// True while a competing writer's stamp must become visible in a
    /// snapshot taken at `start_stamp`.
    fn writer_visible(&self, start_stamp: Stamp, reader: ThreadId) -> bool {
        match &*self.write_stamp.lock() {
            Some(stamp) if stamp.owner != reader => match stamp.version {
                None => true,
                Some(version) => version <= start_stamp,
            },
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut record = self.head.read().clone();
        loop {
            let older = record.older.read().clone();
            match older {
                Some(next) => {
                    len += 1;
                    record = next;
                }
                None => return len,
            }
        }
    }
}

impl<T> Enlisted for CellCore<T>
where
    T: Send + Sync + Clone + 'static,
{
    fn address(&self) -> usize {
        self.cell_address()
    }

    fn owner(&self) -> u64 {
        self.owner_tag.unwrap_or(self.cell_address() as u64)
    }

    fn has_changes(&self) -> bool {
        self.pending.lock().contains_key(&thread::current().id())
    }

    fn can_commit(&self, start_stamp: Stamp, proposed: Stamp) -> bool {
        let me = thread::current().id();
        let mut write_stamp = self.write_stamp.lock();
        if matches!(&*write_stamp, Some(stamp) if stamp.owner != me) {
            return false;
        }
        if self.head_version() > start_stamp {
            return false;
        }
        if self.pending.lock().contains_key(&me) {
            *write_stamp = Some(WriteStamp {
                owner: me,
                version: Some(proposed),
            });
        }
        true
    }

    fn commit(&self) {
        let me = thread::current().id();
        let owned = matches!(&*self.write_stamp.lock(), Some(stamp) if stamp.owner == me);
        if !owned {
            // Read-only participant; nothing was claimed.
            return;
        }
        let pending = self.pending.lock().remove(&me);
        let mut write_stamp = self.write_stamp.lock();
        let claimed = write_stamp.take();
        if let Some(WriteStamp {
            version: Some(version),
            ..
        }) = claimed
        {
            if let Some(value) = pending {
                let mut head = self.head.write();
                let record = Arc::new(Record {
                    version,
                    value,
                    older: RwLock::new(Some(head.clone())),
                });
                *head = record;
            }
        }
        drop(write_stamp);
        self.parker.unpark_all();
    }

    fn rollback(&self) {
        let me = thread::current().id();
        self.pending.lock().remove(&me);
        let mut write_stamp = self.write_stamp.lock();
        if matches!(&*write_stamp, Some(stamp) if stamp.owner == me) {
            *write_stamp = None;
            drop(write_stamp);
            self.parker.unpark_all();
        }
    }

    fn trim(&self, below: Stamp) {
        let mut record = self.head.read().clone();
        loop {
            if record.version <= below {
                *record.older.write() = None;
                return;
            }
            let older = record.older.read().clone();
            match older {
                Some(next) => record = next,
                None => return,
            }
        }
    }

    fn wait_for_writer(&self, start_stamp: Stamp) {
        let me = thread::current().id();
        if !self.writer_visible(start_stamp, me) {
            return;
        }
        trace!(cell = self.cell_address(), "waiting for competing writer");
        self.parker
            .park_while(|| self.writer_visible(start_stamp, me));
    }
}

/// A single transactionally managed location holding a value of type `T`.
///
/// Reads inside a transaction see the snapshot the transaction started at;
/// writes stay tentative until the transaction commits. Outside a
/// transaction, [`get`](Cell::get) returns the newest committed value.
///
/// `Cell` is cheap to clone; clones refer to the same location.
///
/// # Examples
///
/// ```
/// use mvstm::{run_transaction, Cell};
///
/// let cell = Cell::new(0);
///
/// run_transaction(|| {
///     cell.set(42)?;
///     cell.get()
/// }).unwrap();
///
/// assert_eq!(cell.get().unwrap(), 42);
/// ```
#[derive(Clone)]
pub struct Cell<T> {
    core: Arc<CellCore<T>>,
}

impl<T> Cell<T>
where
    T: Send + Sync + Clone + 'static,
{
    /// Create a new `Cell` holding `value` at version 0.
    pub fn new(value: T) -> Cell<T> {
        Cell {
            core: CellCore::new(value, None),
        }
    }

    /// Create a new `Cell` tagged with an owner identity.
    ///
    /// The tag is opaque to the runtime; higher layers use it to group cells
    /// that belong to one logical object.
    pub fn with_owner(value: T, owner: u64) -> Cell<T> {
        Cell {
            core: CellCore::new(value, Some(owner)),
        }
    }

    /// The owner tag of this cell, or its own identity when untagged.
    pub fn owner(&self) -> u64 {
        self.core.owner()
    }

    fn as_enlisted(&self) -> Arc<dyn Enlisted> {
        self.core.clone()
    }

    /// Read the cell.
    ///
    /// Inside a transaction this returns the value as of the transaction's
    /// start stamp, or the tentative value if this transaction already wrote
    /// the cell. Outside a transaction it returns the newest committed value.
    pub fn get(&self) -> StmResult<T> {
        if !transaction::in_transaction() {
            return Ok(self.core.head_value());
        }
        transaction::enlist(&self.as_enlisted())?;
        let start_stamp = transaction::start_stamp()?;
        if let Some(value) = self.core.pending_value() {
            if self.core.head_version() > start_stamp {
                return Err(StmError::WritableReadCollision);
            }
            return Ok(value);
        }
        Ok(self.core.snapshot(start_stamp))
    }

    /// Read the snapshot value, ignoring a tentative write made earlier in
    /// this transaction.
    ///
    /// ```
    /// use mvstm::{run_transaction, Cell};
    ///
    /// let cell = Cell::new(1);
    /// run_transaction(|| {
    ///     cell.set(2)?;
    ///     assert_eq!(cell.read_old()?, 1);
    ///     assert_eq!(cell.get()?, 2);
    ///     Ok(())
    /// }).unwrap();
    /// ```
    pub fn read_old(&self) -> StmResult<T> {
        transaction::require()?;
        transaction::enlist(&self.as_enlisted())?;
        let start_stamp = transaction::start_stamp()?;
        Ok(self.core.snapshot(start_stamp))
    }

    /// Write the cell.
    ///
    /// The write is not visible to other threads until the transaction
    /// commits.
    pub fn set(&self, value: T) -> StmResult<()> {
        transaction::require()?;
        transaction::enlist(&self.as_enlisted())?;
        if self.core.head_version() > transaction::start_stamp()? {
            return Err(StmError::WriteCollision);
        }
        self.core.store_pending(value);
        Ok(())
    }

    /// Modify the content of the cell with the function `f`.
    ///
    /// ```
    /// use mvstm::{run_transaction, Cell};
    ///
    /// let cell = Cell::new(21);
    /// run_transaction(|| cell.modify(|x| x * 2)).unwrap();
    ///
    /// assert_eq!(cell.get().unwrap(), 42);
    /// ```
    pub fn modify<F>(&self, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T,
    {
        transaction::require()?;
        let value = self.get()?;
        self.set(f(value))
    }

    /// Replace the value of the cell, returning the old one.
    ///
    /// ```
    /// use mvstm::{run_transaction, Cell};
    ///
    /// let cell = Cell::new(0);
    /// let old = run_transaction(|| cell.replace(42)).unwrap();
    ///
    /// assert_eq!(old, 0);
    /// assert_eq!(cell.get().unwrap(), 42);
    /// ```
    pub fn replace(&self, value: T) -> StmResult<T> {
        transaction::require()?;
        let old = self.get()?;
        self.set(value)?;
        Ok(old)
    }

    /// Register a commutable update of this cell.
    ///
    /// `f` is deferred and runs just before commit under a fresh snapshot, so
    /// disjoint transactions commuting the same cell commit without
    /// conflicting. The closure may touch only this cell; it runs under a
    /// strict enlistment block.
    ///
    /// If the cell is already enlisted in this transaction, or commuting is
    /// currently blocked, the update degenerates: it executes immediately
    /// like an ordinary [`modify`](Cell::modify). A later read of the cell in
    /// the same transaction also degenerates the pending commute, so the read
    /// observes the updated value.
    ///
    /// ```
    /// use mvstm::{run_transaction, Cell};
    ///
    /// let counter = Cell::new(0);
    /// run_transaction(|| counter.commute(|n| n + 1)).unwrap();
    ///
    /// assert_eq!(counter.get().unwrap(), 1);
    /// ```
    pub fn commute<F>(&self, f: F) -> StmResult<()>
    where
        F: Fn(T) -> T + 'static,
    {
        transaction::require()?;
        let address = self.core.cell_address();
        let degenerate = transaction::with_context(|ctx| ctx.commute_degenerates(address))?;
        if degenerate {
            return transaction::run_strict(address, || self.modify(|value| f(value)));
        }
        let cell = self.clone();
        transaction::push_commute(
            address,
            Box::new(move || {
                transaction::run_strict(cell.core.cell_address(), || {
                    let value = cell.get()?;
                    cell.set(f(value))
                })
            }),
        )
    }

    /// Check if two `Cell`s refer to the same location.
    pub fn ref_eq(this: &Cell<T>, other: &Cell<T>) -> bool {
        Arc::ptr_eq(&this.core, &other.core)
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        self.core.chain_len()
    }

    #[cfg(test)]
    pub(crate) fn head_version(&self) -> Stamp {
        self.core.head_version()
    }
}

impl<T> Default for Cell<T>
where
    T: Send + Sync + Clone + Default + 'static,
{
    /// Create a `Cell` containing `T::default()`.
    fn default() -> Cell<T> {
        Cell::new(T::default())
    }
}

/// Debug output prints the newest committed value.
///
/// Note that this does not reflect a tentative in-transaction write; it is a
/// plain head read, the same view `get` gives outside a transaction.
impl<T> Debug for Cell<T>
where
    T: Send + Sync + Clone + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let value = self.core.head_value();
        f.debug_struct("Cell").field("value", &value).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Link a committed record directly through the capability interface.
    fn push_version(core: &Arc<CellCore<i32>>, version: Stamp, value: i32) {
        core.store_pending(value);
        *core.write_stamp.lock() = Some(WriteStamp {
            owner: thread::current().id(),
            version: Some(version),
        });
        core.commit();
    }

    #[test]
    fn snapshot_walks_to_stamp() {
        let core = CellCore::new(0, None);
        push_version(&core, 3, 30);
        push_version(&core, 7, 70);

        assert_eq!(core.snapshot(0), 0);
        assert_eq!(core.snapshot(2), 0);
        assert_eq!(core.snapshot(3), 30);
        assert_eq!(core.snapshot(6), 30);
        assert_eq!(core.snapshot(7), 70);
        assert_eq!(core.snapshot(100), 70);
    }

    #[test]
    fn trim_detaches_older_history() {
        let core = CellCore::new(0, None);
        push_version(&core, 3, 30);
        push_version(&core, 7, 70);
        assert_eq!(core.chain_len(), 3);

        core.trim(5);
        // Newest record at or below 5 is version 3; everything older is gone.
        assert_eq!(core.chain_len(), 2);
        assert_eq!(core.snapshot(4), 30);

        core.trim(100);
        assert_eq!(core.chain_len(), 1);
        assert_eq!(core.snapshot(7), 70);
    }

    #[test]
    fn rollback_discards_pending_and_releases() {
        let core = CellCore::new(1, None);
        core.store_pending(2);
        assert!(core.has_changes());
        assert!(core.can_commit(0, 1));

        core.rollback();
        assert!(!core.has_changes());
        assert!(core.write_stamp.lock().is_none());
        assert_eq!(core.head_value(), 1);
    }

    #[test]
    fn can_commit_rejects_moved_head() {
        let core = CellCore::new(0, None);
        push_version(&core, 5, 50);

        // A transaction that started at stamp 3 must not commit over stamp 5.
        core.store_pending(99);
        assert!(!core.can_commit(3, 6));
        assert!(core.can_commit(5, 6));
    }

    #[test]
    fn read_outside_transaction_returns_head() {
        let cell = Cell::new(vec![1, 2, 3]);
        assert_eq!(cell.get().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mutation_requires_transaction() {
        let cell = Cell::new(0);
        assert_eq!(cell.set(1), Err(StmError::OutOfTransaction));
        assert_eq!(cell.read_old(), Err(StmError::OutOfTransaction));
        assert_eq!(cell.modify(|x| x + 1), Err(StmError::OutOfTransaction));
        assert_eq!(cell.commute(|x| x + 1), Err(StmError::OutOfTransaction));
    }

    #[test]
    fn owner_tag_round_trip() {
        let tagged = Cell::with_owner(0, 77);
        assert_eq!(tagged.owner(), 77);

        let untagged = Cell::new(0);
        let untagged2 = untagged.clone();
        assert_eq!(untagged.owner(), untagged2.owner());
    }

    #[test]
    fn debug_prints_committed_value() {
        let cell = Cell::new(42);
        assert_eq!(format!("{:?}", cell), "Cell { value: 42 }");
    }
}

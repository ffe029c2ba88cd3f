// Copyright 2025-2026 mvstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM, on top of multi-version concurrency control.
//!
//! Application code groups reads and writes of shared [`Cell`]s into atomic
//! transactions that either commit as a whole or have no visible effect.
//! Every cell keeps a short chain of committed versions, so a transaction
//! reads a consistent snapshot of the world as of its start stamp without
//! taking any locks, and writers only collide with writers.
//!
//! Three things set this implementation apart from a plain read-log STM:
//!
//! * **Snapshot isolation.** A transaction started at stamp `s` observes
//!   exactly the commits with stamp at most `s`, never a torn intermediate
//!   state.
//! * **Commutable operations.** [`Cell::commute`] defers an update like
//!   `n + 1` to commit time and re-runs it against the newest state, so
//!   disjoint transactions incrementing the same counter commit without
//!   conflicting. When the transaction later reads the cell, the commute
//!   degenerates into an ordinary write, keeping reads consistent.
//! * **Conditional transactions.** [`conditional`] registers a reactive
//!   test/body pair that re-runs whenever a commit touches the cells the
//!   test read.
//!
//! # Usage
//!
//! Run the top-level atomic operation by calling [`run_transaction`]. Inside
//! the body, use `?` on every cell operation to pass transaction errors to
//! the driver; do not handle an [`StmError`] yourself. The driver re-runs
//! the body on conflicts, so the body must be free of side effects other
//! than cell operations. Use [`side_effect`] for actions that may only
//! happen once, after the commit.
//!
//! ```
//! use mvstm::{run_transaction, Cell};
//!
//! let account = Cell::new(100);
//!
//! let balance = run_transaction(|| {
//!     account.modify(|x| x - 30)?;
//!     account.get()
//! }).unwrap();
//!
//! assert_eq!(balance, 70);
//! ```
//!
//! Nested [`run_transaction`] calls simply join the enclosing transaction.
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, but
//! a few rules keep the semantics intact:
//!
//! * Don't run code with side effects in the body, especially no IO-code.
//!   Bodies repeat on conflicts. Register a [`side_effect`] instead.
//! * Don't handle retry-class errors yourself. Always use `?`.
//! * Don't mix locks and transactions; a lock held across a retry easily
//!   deadlocks.
//! * Don't use inner mutability to change the content of a [`Cell`].
//!
//! Panicking in a transaction is safe. The transaction aborts, all cells
//! roll back and rollback side effects run; no half-written state remains.

mod cell;
mod conditional;
mod parker;
mod result;
mod runtime;
mod transaction;

#[cfg(test)]
mod test;

pub use cell::Cell;
pub use conditional::ConditionalHandle;
pub use result::{StmError, StmResult};
pub use runtime::Stamp;

/// Run `body` as an atomic transaction.
///
/// On a conflict with a concurrent commit the body is rolled back and
/// re-executed under a fresh snapshot, until it commits. Retry-class errors
/// never escape this function; every other error rolls the transaction back
/// and propagates.
///
/// A `run_transaction` call inside a running transaction is a no-op wrapper:
/// the body joins the enclosing transaction and commits with it.
///
/// # Examples
///
/// ```
/// use mvstm::{run_transaction, Cell};
///
/// let var = Cell::new(0);
///
/// let x = run_transaction(|| {
///     var.set(42)?; // Pass failure to the driver.
///     var.get()     // Return the value saved in var.
/// }).unwrap();
///
/// assert_eq!(x, 42);
/// ```
pub fn run_transaction<T, F>(body: F) -> StmResult<T>
where
    F: FnMut() -> StmResult<T>,
{
    runtime::runtime().run(body)
}

/// Check whether a transaction is running on this thread.
pub fn in_transaction() -> bool {
    transaction::in_transaction()
}

/// The snapshot stamp of the running transaction, if any.
pub fn current_start_stamp() -> Option<Stamp> {
    transaction::current_start_stamp()
}

/// Fail with [`StmError::OutOfTransaction`] unless a transaction is running.
pub fn assert_in_transaction() -> StmResult<()> {
    transaction::require()
}

/// Abort the current transaction.
///
/// With `retry` set the driver restarts the body; otherwise the transaction
/// terminates without commit and the error surfaces to the caller of
/// [`run_transaction`]. The returned value composes with `?`.
///
/// # Examples
///
/// ```
/// use mvstm::{rollback, run_transaction, Cell, StmError, StmResult};
///
/// let cell = Cell::new(1);
///
/// let result: StmResult<()> = run_transaction(|| {
///     cell.set(2)?;
///     rollback(false)
/// });
///
/// assert_eq!(result, Err(StmError::ExplicitRollback { retry: false }));
/// assert_eq!(cell.get().unwrap(), 1);
/// ```
pub fn rollback<T>(retry: bool) -> StmResult<T> {
    Err(StmError::ExplicitRollback { retry })
}

/// Register an action to run once, after the transaction commits.
///
/// Actions run in registration order, after phase 2, on the committing
/// thread. A rolled back or retried execution discards the registration.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use mvstm::{run_transaction, side_effect, Cell};
///
/// let cell = Cell::new(0);
/// let published = Arc::new(AtomicUsize::new(0));
///
/// run_transaction(|| {
///     cell.set(7)?;
///     let published = published.clone();
///     side_effect(move || {
///         published.fetch_add(1, Ordering::SeqCst);
///     })
/// }).unwrap();
///
/// assert_eq!(published.load(Ordering::SeqCst), 1);
/// ```
pub fn side_effect<F>(on_commit: F) -> StmResult<()>
where
    F: FnOnce() + 'static,
{
    transaction::push_side_effect(Some(Box::new(on_commit)), None)
}

/// Register a commit action together with a rollback action.
///
/// `on_rollback` runs whenever the registering execution rolls back, whether
/// through an explicit [`rollback`], an error, or a conflict retry.
pub fn side_effect_with_rollback<C, R>(on_commit: C, on_rollback: R) -> StmResult<()>
where
    C: FnOnce() + 'static,
    R: FnOnce() + 'static,
{
    transaction::push_side_effect(Some(Box::new(on_commit)), Some(Box::new(on_rollback)))
}

/// Register a reactive conditional transaction.
///
/// `test` runs once at registration to capture the cells it reads; from then
/// on, every commit that touches one of those cells re-runs `test` in a new
/// transaction. When `test` returns true, `body` runs in the same
/// transaction; a `body` returning false removes the subscription. When the
/// test's read set changes between runs, the subscription follows it.
///
/// Registration fails with [`StmError::EmptyConditionalReadSet`] when the
/// test reads no cells at all.
///
/// # Examples
///
/// ```
/// use mvstm::{conditional, run_transaction, Cell};
///
/// let flag = Cell::new(false);
/// let counter = Cell::new(0);
///
/// let flag_t = flag.clone();
/// let counter_b = counter.clone();
/// conditional(
///     move || flag_t.get(),
///     move || {
///         counter_b.modify(|n| n + 1)?;
///         Ok(true)
///     },
/// ).unwrap();
///
/// run_transaction(|| flag.set(true)).unwrap();
/// assert_eq!(counter.get().unwrap(), 1);
/// ```
pub fn conditional<T, B>(test: T, body: B) -> StmResult<ConditionalHandle>
where
    T: Fn() -> StmResult<bool> + Send + Sync + 'static,
    B: Fn() -> StmResult<bool> + Send + Sync + 'static,
{
    runtime::runtime()
        .subscriptions
        .register(Box::new(test), Box::new(body))
}

/// Cancel a conditional subscription.
///
/// The subscription is removed from every cell it watched; a trigger that
/// already captured it will skip it. Cancelling twice is harmless.
pub fn cancel_conditional(handle: &ConditionalHandle) -> StmResult<()> {
    runtime::runtime().subscriptions.cancel(handle.id)
}

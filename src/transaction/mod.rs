// Copyright 2025-2026 mvstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

pub(crate) mod commute;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::mem;
use std::sync::Arc;

use tracing::trace;

use self::commute::{Commute, CommuteState};
use crate::cell::Enlisted;
use crate::result::{StmError, StmResult};
use crate::runtime::Stamp;

thread_local!(static CONTEXT: RefCell<Option<TransactionContext>> = RefCell::new(None));

/// A deferred action delivered when the transaction resolves.
pub(crate) struct SideEffect {
    pub(crate) on_commit: Option<Box<dyn FnOnce()>>,
    pub(crate) on_rollback: Option<Box<dyn FnOnce()>>,
}

/// Per-thread state of the running transaction.
///
/// The context tracks every cell the transaction touched, keyed by the cell's
/// address so heterogeneous cells share one map, the way the reference log
/// keys its entries by control-block identity.
pub(crate) struct TransactionContext {
    /// The snapshot this transaction reads at.
    pub(crate) start_stamp: Stamp,
    /// Cells touched by the transaction body.
    pub(crate) enlisted: BTreeMap<usize, Arc<dyn Enlisted>>,
    /// Cells touched while executing commutes at commit time. Kept apart so
    /// they can be validated under the refreshed stamp and rolled back
    /// without disturbing the body's enlistments.
    pub(crate) commute_enlisted: BTreeMap<usize, Arc<dyn Enlisted>>,
    pub(crate) commutes: Vec<Commute>,
    pub(crate) side_effects: Vec<SideEffect>,
    /// Index of the commute currently executing, if any.
    commute_time: Option<usize>,
    /// The only cell a strict commute closure may touch.
    block_enlist: Option<usize>,
    /// When set, newly issued commutes degenerate immediately.
    block_commute: bool,
    /// True while the commit path executes commutes under a refreshed stamp.
    commute_phase: bool,
}

impl TransactionContext {
    fn new(start_stamp: Stamp) -> TransactionContext {
        TransactionContext {
            start_stamp,
            enlisted: BTreeMap::new(),
            commute_enlisted: BTreeMap::new(),
            commutes: Vec::new(),
            side_effects: Vec::new(),
            commute_time: None,
            block_enlist: None,
            block_commute: false,
            commute_phase: false,
        }
    }

    /// Whether a commute on `address` must execute immediately instead of
    /// being deferred.
    pub(crate) fn commute_degenerates(&self, address: usize) -> bool {
        self.block_commute
            || self.enlisted.contains_key(&address)
            || self.commute_enlisted.contains_key(&address)
    }

    pub(crate) fn has_commutes(&self) -> bool {
        !self.commutes.is_empty()
    }

    pub(crate) fn outer_cores(&self) -> Vec<Arc<dyn Enlisted>> {
        self.enlisted.values().cloned().collect()
    }

    pub(crate) fn commute_cores(&self) -> Vec<Arc<dyn Enlisted>> {
        self.commute_enlisted.values().cloned().collect()
    }
}

/// Run `f` on the current transaction context.
pub(crate) fn with_context<R, F>(f: F) -> StmResult<R>
where
    F: FnOnce(&mut TransactionContext) -> R,
{
    CONTEXT.with(|slot| match slot.borrow_mut().as_mut() {
        Some(ctx) => Ok(f(ctx)),
        None => Err(StmError::OutOfTransaction),
    })
}

/// Install a fresh context for the outermost `run_transaction` call.
pub(crate) fn install(start_stamp: Stamp) {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        debug_assert!(slot.is_none(), "transaction context already installed");
        *slot = Some(TransactionContext::new(start_stamp));
    });
}

/// Remove and return the current context, if any.
pub(crate) fn uninstall() -> Option<TransactionContext> {
    CONTEXT.with(|slot| slot.borrow_mut().take())
}

pub(crate) fn in_transaction() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

pub(crate) fn current_start_stamp() -> Option<Stamp> {
    CONTEXT.with(|slot| slot.borrow().as_ref().map(|ctx| ctx.start_stamp))
}

pub(crate) fn start_stamp() -> StmResult<Stamp> {
    with_context(|ctx| ctx.start_stamp)
}

pub(crate) fn require() -> StmResult<()> {
    with_context(|_| ())
}

/// Register a cell with the running transaction.
///
/// On first touch the caller is held back while a competing writer's stamp
/// would have to appear in this transaction's snapshot, and pending commutes
/// broken by the enlistment are flushed.
pub(crate) fn enlist(core: &Arc<dyn Enlisted>) -> StmResult<()> {
    let address = core.address();
    let (newly, start_stamp) = with_context(|ctx| -> StmResult<(bool, Stamp)> {
        if let Some(allowed) = ctx.block_enlist {
            if allowed != address {
                return Err(StmError::ForbiddenEnlist);
            }
        }
        let newly = if ctx.commute_phase {
            if ctx.enlisted.contains_key(&address) {
                return Err(StmError::InvalidCommute);
            }
            ctx.commute_enlisted.insert(address, core.clone()).is_none()
        } else {
            ctx.enlisted.insert(address, core.clone()).is_none()
        };
        Ok((newly, ctx.start_stamp))
    })??;
    if newly {
        core.wait_for_writer(start_stamp);
        degenerate_commutes_for(address)?;
    }
    Ok(())
}

/// Break the isolation of commutes affected by a fresh enlistment of
/// `address` and flush the ones that must run now.
fn degenerate_commutes_for(address: usize) -> StmResult<()> {
    let run = with_context(|ctx| {
        if ctx.commutes.is_empty() {
            return false;
        }
        let limit = ctx.commute_time.unwrap_or(usize::MAX);
        let mut run = false;
        for (index, commute) in ctx.commutes.iter_mut().enumerate() {
            if commute.state == CommuteState::Ok && commute.cell == address {
                commute.state = CommuteState::Broken;
                if index < limit {
                    run = true;
                }
            }
        }
        run
    })?;
    if run {
        trace!(cell = address, "enlistment degenerated pending commutes");
        run_commutes()?;
    }
    Ok(())
}

/// Execute broken commutes in registration order.
///
/// Commuting is blocked for the whole flush, so commutes issued from inside a
/// running commute degenerate on the spot. Each closure is taken out of its
/// slot while it runs and put back afterwards; a failed commute phase needs
/// to run it again.
fn run_commutes() -> StmResult<()> {
    let (saved_time, saved_block) = with_context(|ctx| {
        let saved = (ctx.commute_time, ctx.block_commute);
        ctx.block_commute = true;
        saved
    })?;
    let limit = saved_time.unwrap_or(usize::MAX);
    let result = loop {
        let next = with_context(|ctx| {
            ctx.commutes
                .iter()
                .position(|commute| commute.state == CommuteState::Broken)
                .filter(|index| *index < limit)
        })?;
        let Some(index) = next else {
            break Ok(());
        };
        let taken = with_context(|ctx| {
            let commute = &mut ctx.commutes[index];
            commute.state = CommuteState::Executed;
            ctx.commute_time = Some(index);
            commute.perform.take()
        })?;
        let mut perform = match taken {
            Some(perform) => perform,
            None => unreachable!("commute closure missing"),
        };
        let outcome = perform();
        with_context(|ctx| ctx.commutes[index].perform = Some(perform))?;
        if let Err(e) = outcome {
            break Err(e);
        }
    };
    with_context(|ctx| {
        ctx.commute_time = saved_time;
        ctx.block_commute = saved_block;
        if result.is_ok() && saved_time.is_none() && !ctx.commute_phase {
            ctx.commutes.retain(|commute| commute.state == CommuteState::Ok);
        }
    })?;
    result
}

/// Run `f` with enlistment restricted to `cell`.
///
/// An already-active restriction is kept in place, so strictness holds
/// recursively for commutes flushed from inside another strict closure.
pub(crate) fn run_strict<R, F>(cell: usize, f: F) -> StmResult<R>
where
    F: FnOnce() -> StmResult<R>,
{
    let saved = with_context(|ctx| {
        let saved = ctx.block_enlist;
        if saved.is_none() {
            ctx.block_enlist = Some(cell);
        }
        saved
    })?;
    let result = f();
    with_context(|ctx| ctx.block_enlist = saved)?;
    result
}

/// Defer a commutable update for execution at commit time.
pub(crate) fn push_commute(
    cell: usize,
    perform: Box<dyn FnMut() -> StmResult<()>>,
) -> StmResult<()> {
    with_context(|ctx| ctx.commutes.push(Commute::new(cell, perform)))
}

/// Switch the context into the commit path's commute phase: fresh stamp, a
/// clean commute enlistment set, and every surviving commute queued to run.
pub(crate) fn enter_commute_phase(stamp: Stamp) -> StmResult<()> {
    with_context(|ctx| {
        ctx.commute_phase = true;
        ctx.start_stamp = stamp;
        ctx.commute_enlisted.clear();
        for commute in &mut ctx.commutes {
            commute.state = CommuteState::Broken;
        }
    })
}

pub(crate) fn run_all_commutes() -> StmResult<()> {
    run_commutes()
}

/// Leave the commute phase, restoring the body's snapshot so the outer
/// enlistments are validated against their original stamp.
pub(crate) fn leave_commute_phase(original: Stamp) -> StmResult<()> {
    with_context(|ctx| {
        ctx.commute_phase = false;
        ctx.start_stamp = original;
    })
}

/// Run `f` with an empty enlistment set and report which cells it touched.
///
/// The captured cells are merged back afterwards so the enclosing
/// transaction still validates them; the capture only serves callers that
/// need the read set itself, like conditional registration.
pub(crate) fn run_isolated_capture<R, F>(f: F) -> StmResult<(R, HashSet<usize>)>
where
    F: FnOnce() -> StmResult<R>,
{
    let saved = with_context(|ctx| mem::take(&mut ctx.enlisted))?;
    let result = f();
    let captured = with_context(|ctx| {
        let captured = mem::replace(&mut ctx.enlisted, saved);
        let ids: HashSet<usize> = captured.keys().copied().collect();
        for (address, core) in captured {
            ctx.enlisted.entry(address).or_insert(core);
        }
        ids
    })?;
    Ok((result?, captured))
}

/// Register deferred side-effect handlers with the running transaction.
pub(crate) fn push_side_effect(
    on_commit: Option<Box<dyn FnOnce()>>,
    on_rollback: Option<Box<dyn FnOnce()>>,
) -> StmResult<()> {
    with_context(|ctx| {
        ctx.side_effects.push(SideEffect {
            on_commit,
            on_rollback,
        });
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{run_transaction, Cell, StmError};

    #[test]
    fn enlist_requires_transaction() {
        let cell = Cell::new(0);
        assert_eq!(cell.set(1), Err(StmError::OutOfTransaction));
        assert!(!in_transaction());
    }

    /// Two commutes on the same cell degenerate in registration order when
    /// the cell is read.
    #[test]
    fn degeneration_preserves_order() {
        let cell = Cell::new(0);
        let c1 = cell.clone();
        let c2 = cell.clone();

        let seen = run_transaction(move || {
            c1.commute(|x| x + 1)?;
            c1.commute(|x| x * 10)?;
            c2.get()
        })
        .unwrap();

        // (0 + 1) * 10, not 0 * 10 + 1.
        assert_eq!(seen, 10);
        assert_eq!(cell.get().unwrap(), 10);
    }

    /// A commute on an already enlisted cell executes immediately.
    #[test]
    fn commute_on_enlisted_cell_degenerates() {
        let cell = Cell::new(5);
        let c = cell.clone();

        run_transaction(move || {
            let _ = c.get()?;
            c.commute(|x| x + 1)?;
            // The commute already happened; the read sees it.
            assert_eq!(c.get()?, 6);
            Ok(())
        })
        .unwrap();

        assert_eq!(cell.get().unwrap(), 6);
    }

    /// A strict commute closure may only touch its own cell.
    #[test]
    fn strict_commute_blocks_foreign_enlist() {
        let a = Cell::new(0);
        let b = Cell::new(0);
        let b2 = b.clone();
        let a2 = a.clone();

        run_transaction(move || {
            let b3 = b2.clone();
            a2.commute(move |x| {
                assert_eq!(b3.get(), Err(StmError::ForbiddenEnlist));
                x + 1
            })
        })
        .unwrap();

        assert_eq!(a.get().unwrap(), 1);
        assert_eq!(b.get().unwrap(), 0);
    }

    /// Isolated capture reports exactly the cells the closure touched and
    /// leaves them enlisted in the enclosing transaction.
    #[test]
    fn isolated_capture_reports_read_set() {
        let a = Cell::new(1);
        let b = Cell::new(2);
        let a2 = a.clone();
        let b2 = b.clone();

        run_transaction(move || {
            let _ = a2.get()?;
            let (sum, captured) = run_isolated_capture(|| Ok(a2.get()? + b2.get()?))?;
            assert_eq!(sum, 3);
            assert_eq!(captured.len(), 2);
            let enlisted = with_context(|ctx| ctx.enlisted.len())?;
            assert_eq!(enlisted, 2);
            Ok(())
        })
        .unwrap();
    }
}

use crate::result::StmResult;

/// State of a deferred commutable update.
///
/// `Ok` commutes run just before commit under a fresh stamp. Enlisting one of
/// their affecting cells breaks the isolation they rely on and flips them to
/// `Broken`; broken commutes are executed in registration order and marked
/// `Executed`. Only `Ok` commutes survive a degeneration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommuteState {
    Ok,
    Broken,
    Executed,
}

/// A deferred update registered with [`Cell::commute`](crate::Cell::commute).
pub(crate) struct Commute {
    pub(crate) state: CommuteState,
    /// The single affecting cell; the closure is strict over it.
    pub(crate) cell: usize,
    /// The update itself. Taken out of the slot while it runs, so the
    /// context can be borrowed underneath it, and put back afterwards
    /// because a failed commute phase re-runs it.
    pub(crate) perform: Option<Box<dyn FnMut() -> StmResult<()>>>,
}

impl Commute {
    pub(crate) fn new(cell: usize, perform: Box<dyn FnMut() -> StmResult<()>>) -> Commute {
        Commute {
            state: CommuteState::Ok,
            cell,
            perform: Some(perform),
        }
    }
}

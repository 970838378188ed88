use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::function::Function;
use crate::variable::{Variable, WeakVariable};

// Tape: the arena that owns the computation graph
//
// Every recorded operation lives in a per-thread Vec. A Variable names its
// creator with an OpId (slot index + stamp) and never owns it; the tape
// entry owns the operation, strong handles to its inputs and only a weak
// handle to its output. Ownership therefore always points from the tape
// towards the leaves and no reference cycle can form.
//
// The graph is reclaimed as a unit: a GraphEpoch remembers the tape length
// when it is created and truncates back to it when dropped, and
// clear_graph() empties the whole tape. Stamps are never reused, so an OpId
// that outlived its epoch is detected instead of silently resolving to a
// newer operation in the same slot.

/// Non-owning handle to a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    index: usize,
    stamp: u64,
}

impl OpId {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.index)
    }
}

/// One recorded operation.
pub struct TapeEntry {
    pub(crate) id: OpId,
    pub(crate) func: Box<dyn Function>,
    pub(crate) inputs: Vec<Variable>,
    pub(crate) output: WeakVariable,
}

impl TapeEntry {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.func.name()
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    /// The output node, if anything still holds it.
    pub fn output(&self) -> Option<Variable> {
        self.output.upgrade()
    }
}

#[derive(Default)]
struct Tape {
    entries: Vec<Rc<TapeEntry>>,
    next_stamp: u64,
}

thread_local! {
    static TAPE: RefCell<Tape> = RefCell::new(Tape::default());
}

/// Append an operation and return its handle.
pub(crate) fn record(
    func: Box<dyn Function>,
    inputs: Vec<Variable>,
    output: WeakVariable,
) -> OpId {
    TAPE.with(|t| {
        let mut tape = t.borrow_mut();
        let id = OpId {
            index: tape.entries.len(),
            stamp: tape.next_stamp,
        };
        tape.next_stamp += 1;
        tape.entries.push(Rc::new(TapeEntry {
            id,
            func,
            inputs,
            output,
        }));
        id
    })
}

/// Resolve an OpId. The entry is cloned out of the tape so callers can run
/// backward rules (which record new entries) without holding a borrow.
pub fn entry(id: OpId) -> Result<Rc<TapeEntry>> {
    TAPE.with(|t| {
        t.borrow()
            .entries
            .get(id.index)
            .filter(|e| e.id.stamp == id.stamp)
            .cloned()
    })
    .ok_or_else(|| {
        Error::unsupported(format!(
            "{id} is no longer on the tape (its graph was cleared)"
        ))
    })
}

/// Whether `id` still resolves.
pub fn is_live(id: OpId) -> bool {
    entry(id).is_ok()
}

/// Number of operations currently recorded on this thread.
pub fn len() -> usize {
    TAPE.with(|t| t.borrow().entries.len())
}

fn truncate(mark: usize) {
    // Dropping entries drops their inputs, which may be the last handles on
    // variables; take them out first so no borrow is held during drop.
    let removed: Vec<Rc<TapeEntry>> = TAPE.with(|t| {
        let mut tape = t.borrow_mut();
        if tape.entries.len() > mark {
            tape.entries.split_off(mark)
        } else {
            Vec::new()
        }
    });
    if !removed.is_empty() {
        log::debug!("releasing {} recorded ops", removed.len());
    }
    drop(removed);
}

/// Drop every recorded operation on this thread. Variables that were
/// produced by them keep their data but can no longer be differentiated.
pub fn clear_graph() {
    truncate(0);
}

/// Scope of a computation graph. Operations recorded while the epoch is
/// alive are released when it is dropped.
///
/// ```ignore
/// for batch in batches {
///     let _epoch = GraphEpoch::new();
///     let loss = model.forward(&batch)?;
///     loss.backward(false, false)?;
///     optimizer.update(&model)?;
/// } // the step's graph is freed here
/// ```
#[must_use = "the graph is released as soon as the epoch is dropped"]
pub struct GraphEpoch {
    mark: usize,
}

impl GraphEpoch {
    pub fn new() -> Self {
        GraphEpoch { mark: len() }
    }

    /// Operations recorded since this epoch began.
    pub fn recorded(&self) -> usize {
        len().saturating_sub(self.mark)
    }
}

impl Default for GraphEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GraphEpoch {
    fn drop(&mut self) {
        truncate(self.mark);
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};
use crate::tape::{self, OpId};

// Graph scheduling
//
// Orders the recorded operations reachable from a root so that every
// operation comes before the operations that produced its inputs:
//
//   1. DFS from the root's creator through input creators. Each edge
//      producer -> consumer is stored once per use, and the consumer's
//      in-degree counts its recorded producers (with multiplicity).
//   2. Kahn's algorithm from the operations with no recorded producers
//      yields a forward (producers-first) order.
//   3. Reversing it gives the backward order: root first.
//
// The traversal is over BTreeMaps keyed by OpId, so the order is
// deterministic for a given tape.

/// Backward order of the operations upstream of `root`.
pub fn topological_order(root: OpId) -> Result<Vec<OpId>> {
    let mut consumers: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
    let mut in_degree: BTreeMap<OpId, usize> = BTreeMap::new();
    let mut seen: BTreeSet<OpId> = BTreeSet::new();

    let mut stack = vec![root];
    seen.insert(root);
    while let Some(op) = stack.pop() {
        let entry = tape::entry(op)?;
        in_degree.entry(op).or_insert(0);
        for input in entry.inputs() {
            let Some(prev) = input.creator() else {
                continue;
            };
            consumers.entry(prev).or_default().push(op);
            *in_degree.entry(op).or_insert(0) += 1;
            if seen.insert(prev) {
                stack.push(prev);
            }
        }
    }

    let mut queue: VecDeque<OpId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(op, _)| *op)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(op) = queue.pop_front() {
        order.push(op);
        if let Some(next) = consumers.get(&op) {
            for c in next {
                if let Some(d) = in_degree.get_mut(c) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*c);
                    }
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        return Err(Error::unsupported(format!(
            "graph upstream of {root} contains a cycle"
        )));
    }
    order.reverse();
    Ok(order)
}

use crate::bail;
use crate::config::{self, ConfigKey};
use crate::error::{Error, Result};
use crate::function;
use crate::functions;
use crate::graph;
use crate::tape;
use crate::tensor::Tensor;
use crate::variable::{Origin, Variable};

// Backpropagation: reverse-mode automatic differentiation
//
//   1. If the root has no gradient yet, seed it with ones of its shape.
//   2. Order the recorded operations upstream of the root (graph.rs).
//   3. Walk that order. For each operation whose output holds a gradient,
//      call its backward rule with recording set to `create_graph`, then
//      hand each returned gradient to the matching input:
//
//        first contribution   stored as is (a fresh handle unless
//                             create_graph)
//        later contributions  added to the stored gradient
//
//      Inputs that do not require a gradient, and `None` entries, are
//      skipped. Unless `retain_grad`, the output's gradient is released once
//      the operation has been processed.
//
// With create_graph the gradient computations are themselves recorded, so
// x.grad() can be differentiated again (higher-order derivatives).

/// Differentiate from `root`, accumulating into the `grad` of every node
/// upstream of it that requires a gradient.
///
/// Fails with `UnsupportedOperation` if `root` was produced while
/// recording was disabled or its graph has been cleared.
pub fn backward(root: &Variable, retain_grad: bool, create_graph: bool) -> Result<()> {
    let creator = match root.origin() {
        Origin::Detached => {
            return Err(Error::unsupported(
                "backward() on a node produced while recording was disabled",
            ))
        }
        Origin::Leaf => None,
        Origin::Recorded(op) => {
            if !tape::is_live(op) {
                return Err(Error::unsupported(format!(
                    "backward() through {op}, whose graph was cleared"
                )));
            }
            Some(op)
        }
    };

    if root.grad().is_none() {
        root.set_grad(Some(Variable::constant(Tensor::ones_like(&root.data()))));
    }
    let Some(creator) = creator else {
        return Ok(());
    };

    let order = graph::topological_order(creator)?;
    log::debug!(
        "backward over {} ops (retain_grad={retain_grad}, create_graph={create_graph})",
        order.len()
    );

    for op in order {
        let entry = tape::entry(op)?;
        let Some(output) = entry.output() else {
            continue;
        };
        let Some(gy) = output.grad() else {
            continue;
        };

        let gxs = {
            let _g = config::using_config(ConfigKey::EnableBackprop, create_graph);
            function::run_backward(&entry, &output, &gy)?
        };
        if gxs.len() != entry.inputs().len() {
            bail!(
                "{} backward returned {} gradients for {} inputs",
                entry.name(),
                gxs.len(),
                entry.inputs().len()
            );
        }
        log::trace!("{op} {} backward", entry.name());

        for (x, gx) in entry.inputs().iter().zip(gxs) {
            let Some(gx) = gx else {
                continue;
            };
            if !x.requires_grad() {
                continue;
            }
            if gx.shape() != x.shape() {
                bail!(
                    "{} backward produced a {} gradient for a {} input",
                    entry.name(),
                    gx.shape(),
                    x.shape()
                );
            }
            accumulate(x, gx, create_graph)?;
        }

        if !retain_grad {
            output.cleargrad();
        }
    }
    Ok(())
}

fn accumulate(x: &Variable, gx: Variable, create_graph: bool) -> Result<()> {
    let grad = match x.grad() {
        None if create_graph => gx,
        None => gx.detach(),
        Some(prev) => {
            let _g = config::using_config(ConfigKey::EnableBackprop, create_graph);
            let sum = functions::add(&prev, &gx)?;
            if create_graph {
                sum
            } else {
                sum.detach()
            }
        }
    };
    x.set_grad(Some(grad));
    Ok(())
}

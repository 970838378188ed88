use crate::config;
use crate::error::Result;
use crate::tape;
use crate::tensor::Tensor;
use crate::variable::Variable;

// Function: a differentiable primitive
//
// A Function evaluates on plain tensors in forward() and states its
// vector-Jacobian product in backward(). backward() is written with
// Variable operations, so when the backward pass runs with recording
// enabled (create_graph) the gradient it returns carries its own graph and
// can be differentiated again.
//
// Each call site builds a fresh Function value; forward() may stash
// whatever backward() needs (input shapes, saved statistics, argmax
// indices) in the value itself, which then moves onto the tape.

/// What a backward rule can see of the recorded call.
pub struct BackwardCtx<'a> {
    inputs: &'a [Variable],
    output: &'a Variable,
}

impl<'a> BackwardCtx<'a> {
    pub fn inputs(&self) -> &'a [Variable] {
        self.inputs
    }

    pub fn input(&self, i: usize) -> &'a Variable {
        &self.inputs[i]
    }

    pub fn output(&self) -> &'a Variable {
        self.output
    }
}

/// A differentiable operation.
pub trait Function {
    /// Short name for logs and debugging.
    fn name(&self) -> &'static str;

    /// Compute the output from the input tensors.
    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor>;

    /// Gradients with respect to each input, given the output gradient `gy`.
    /// Must return one entry per input, shaped like that input; `None` means
    /// the input receives no gradient.
    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>>;
}

/// Evaluate `func` on `inputs` and, if recording is enabled, put it on the
/// tape as the creator of the returned node.
pub fn apply<F: Function + 'static>(mut func: F, inputs: &[&Variable]) -> Result<Variable> {
    let xs: Vec<Tensor> = inputs.iter().map(|v| v.data()).collect();
    let y = func.forward(&xs)?;

    if !config::is_recording() {
        return Ok(Variable::detached(y));
    }

    let requires_grad = inputs.iter().any(|v| v.requires_grad());
    let output = Variable::pending(y, requires_grad);
    let name = func.name();
    let id = tape::record(
        Box::new(func),
        inputs.iter().map(|v| (*v).clone()).collect(),
        output.downgrade(),
    );
    output.set_creator(id);
    log::trace!("recorded {name} as {id}");
    Ok(output)
}

pub(crate) fn run_backward(
    entry: &tape::TapeEntry,
    output: &Variable,
    gy: &Variable,
) -> Result<Vec<Option<Variable>>> {
    let ctx = BackwardCtx {
        inputs: &entry.inputs,
        output,
    };
    entry.func.backward(&ctx, gy)
}

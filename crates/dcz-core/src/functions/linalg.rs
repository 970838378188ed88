use super::{reduce_to, sum_to, transpose};
use crate::error::{Error, Result};
use crate::function::{apply, BackwardCtx, Function};
use crate::tensor::Tensor;
use crate::variable::Variable;

// Matrix products
//
//   y = x @ W        gx = gy @ W^T     gW = x^T @ gy
//   y = x @ W + b    gb = sum_to(gy, b.shape)
//
// Batch axes broadcast in forward, so gx and gW are summed back to their
// input shapes.

/// Swap the two trailing axes.
fn mt(x: &Variable) -> Result<Variable> {
    let rank = x.rank();
    if rank < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: rank,
        });
    }
    let mut axes: Vec<usize> = (0..rank).collect();
    axes.swap(rank - 2, rank - 1);
    transpose(x, &axes)
}

fn matmul_grads(x: &Variable, w: &Variable, gy: &Variable) -> Result<(Variable, Variable)> {
    let gx = reduce_to(matmul(gy, &mt(w)?)?, &x.shape())?;
    let gw = reduce_to(matmul(&mt(x)?, gy)?, &w.shape())?;
    Ok((gx, gw))
}

struct MatMul;

impl Function for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        xs[0].matmul(&xs[1])
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (gx, gw) = matmul_grads(ctx.input(0), ctx.input(1), gy)?;
        Ok(vec![Some(gx), Some(gw)])
    }
}

/// Batched matrix product over the two trailing axes.
pub fn matmul(x: &Variable, w: &Variable) -> Result<Variable> {
    apply(MatMul, &[x, w])
}

struct Linear;

impl Function for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let y = xs[0].matmul(&xs[1])?;
        match xs.get(2) {
            Some(b) => y.add(b),
            None => Ok(y),
        }
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (gx, gw) = matmul_grads(ctx.input(0), ctx.input(1), gy)?;
        let mut gxs = vec![Some(gx), Some(gw)];
        if let Some(b) = ctx.inputs().get(2) {
            gxs.push(Some(sum_to(gy, b.shape())?));
        }
        Ok(gxs)
    }
}

/// `x @ W + b`; the bias is optional.
pub fn linear(x: &Variable, w: &Variable, b: Option<&Variable>) -> Result<Variable> {
    match b {
        Some(b) => apply(Linear, &[x, w, b]),
        None => apply(Linear, &[x, w]),
    }
}

use super::{constant, mul_scalar};
use crate::error::{Error, Result};
use crate::function::{apply, BackwardCtx, Function};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::variable::Variable;

// Shape manipulation and reductions
//
// The pairs below are adjoints of each other, so each backward is the
// forward of its partner:
//
//   reshape       <-> reshape back
//   transpose     <-> inverse permutation
//   broadcast_to  <-> sum_to
//   sum           <-> broadcast over the reduced axes
//   get_item      <-> get_item_grad (scatter-add into zeros)
//   slice         <-> zero padding via concat

struct Reshape {
    shape: Shape,
    in_shape: Shape,
}

impl Function for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        xs[0].reshape(&self.shape)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(reshape(gy, &self.in_shape)?)])
    }
}

/// Reshape; a view of the input when its layout allows it.
pub fn reshape(x: &Variable, shape: impl Into<Shape>) -> Result<Variable> {
    let shape = shape.into();
    if x.shape() == shape {
        return Ok(x.clone());
    }
    apply(
        Reshape {
            shape,
            in_shape: Shape::default(),
        },
        &[x],
    )
}

struct Transpose {
    axes: Vec<usize>,
}

impl Function for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        xs[0].transpose(&self.axes)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        if self.axes.is_empty() {
            return Ok(vec![Some(transpose(gy, &[])?)]);
        }
        let mut inverse = vec![0; self.axes.len()];
        for (i, &a) in self.axes.iter().enumerate() {
            inverse[a] = i;
        }
        Ok(vec![Some(transpose(gy, &inverse)?)])
    }
}

/// Permute axes; an empty `axes` reverses them all.
pub fn transpose(x: &Variable, axes: &[usize]) -> Result<Variable> {
    apply(
        Transpose {
            axes: axes.to_vec(),
        },
        &[x],
    )
}

struct BroadcastTo {
    shape: Shape,
    in_shape: Shape,
}

impl Function for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        xs[0].broadcast_to(&self.shape)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(sum_to(gy, &self.in_shape)?)])
    }
}

pub fn broadcast_to(x: &Variable, shape: impl Into<Shape>) -> Result<Variable> {
    let shape = shape.into();
    if x.shape() == shape {
        return Ok(x.clone());
    }
    apply(
        BroadcastTo {
            shape,
            in_shape: Shape::default(),
        },
        &[x],
    )
}

struct SumTo {
    shape: Shape,
    in_shape: Shape,
}

impl Function for SumTo {
    fn name(&self) -> &'static str {
        "sum_to"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        xs[0].sum_to(&self.shape)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(broadcast_to(gy, &self.in_shape)?)])
    }
}

/// Sum a broadcast value back down to `shape`.
pub fn sum_to(x: &Variable, shape: impl Into<Shape>) -> Result<Variable> {
    let shape = shape.into();
    if x.shape() == shape {
        return Ok(x.clone());
    }
    apply(
        SumTo {
            shape,
            in_shape: Shape::default(),
        },
        &[x],
    )
}

struct Sum {
    axes: Vec<usize>,
    keepdims: bool,
    in_shape: Shape,
}

impl Function for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        xs[0].sum(&self.axes, self.keepdims)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        // restore the reduced axes as extent 1, then broadcast
        let kept: Vec<usize> = self
            .in_shape
            .dims()
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                if self.axes.is_empty() || self.axes.contains(&i) {
                    1
                } else {
                    d
                }
            })
            .collect();
        let gy = reshape(gy, kept)?;
        Ok(vec![Some(broadcast_to(&gy, &self.in_shape)?)])
    }
}

/// Sum over `axes` (every axis when empty).
pub fn sum(x: &Variable, axes: &[usize], keepdims: bool) -> Result<Variable> {
    apply(
        Sum {
            axes: axes.to_vec(),
            keepdims,
            in_shape: Shape::default(),
        },
        &[x],
    )
}

/// Mean over `axes` (every axis when empty).
pub fn mean(x: &Variable, axes: &[usize], keepdims: bool) -> Result<Variable> {
    let dims = x.dims();
    let count: usize = if axes.is_empty() {
        dims.iter().product()
    } else {
        let mut count = 1;
        for &a in axes {
            count *= *dims.get(a).ok_or(Error::DimOutOfRange {
                dim: a,
                rank: dims.len(),
            })?;
        }
        count
    };
    if count == 0 {
        return Err(Error::msg(format!("mean over an empty axis of {}", x.shape())));
    }
    mul_scalar(&sum(x, axes, keepdims)?, 1.0 / count as f32)
}

struct GetItem {
    path: Vec<usize>,
    in_shape: Shape,
}

impl Function for GetItem {
    fn name(&self) -> &'static str {
        "get_item"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        let mut t = xs[0].clone();
        for &i in &self.path {
            t = t.index(i)?;
        }
        Ok(t)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(get_item_grad(gy, &self.path, &self.in_shape)?)])
    }
}

/// Index axis 0 successively with each entry of `path`:
/// `get_item(x, &[1, 2])` is `x[1][2]`.
pub fn get_item(x: &Variable, path: &[usize]) -> Result<Variable> {
    apply(
        GetItem {
            path: path.to_vec(),
            in_shape: Shape::default(),
        },
        &[x],
    )
}

struct GetItemGrad {
    path: Vec<usize>,
    in_shape: Shape,
}

impl Function for GetItemGrad {
    fn name(&self) -> &'static str {
        "get_item_grad"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let gx = Tensor::zeros(&self.in_shape);
        gx.add_at(&self.path, &xs[0])?;
        Ok(gx)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, ggx: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(get_item(ggx, &self.path)?)])
    }
}

/// Scatter-add `gy` into zeros of `in_shape` at `path`; the adjoint of
/// [`get_item`].
pub fn get_item_grad(gy: &Variable, path: &[usize], in_shape: &Shape) -> Result<Variable> {
    apply(
        GetItemGrad {
            path: path.to_vec(),
            in_shape: in_shape.clone(),
        },
        &[gy],
    )
}

struct Slice {
    dim: usize,
    start: usize,
    end: usize,
    in_shape: Shape,
}

impl Function for Slice {
    fn name(&self) -> &'static str {
        "slice"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.in_shape = xs[0].shape().clone();
        xs[0].slice(self.dim, self.start, self.end)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let extent = |len: usize| {
            let mut dims = self.in_shape.dims().to_vec();
            dims[self.dim] = len;
            constant(Tensor::zeros(dims))
        };
        let before = extent(self.start);
        let after = extent(self.in_shape.dims()[self.dim] - self.end);
        Ok(vec![Some(concat(&[&before, gy, &after], self.dim)?)])
    }
}

/// `start..end` along `dim`.
pub fn slice(x: &Variable, dim: usize, start: usize, end: usize) -> Result<Variable> {
    apply(
        Slice {
            dim,
            start,
            end,
            in_shape: Shape::default(),
        },
        &[x],
    )
}

struct Concat {
    axis: usize,
    sizes: Vec<usize>,
}

impl Function for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let y = Tensor::concat(xs, self.axis)?;
        self.sizes = xs.iter().map(|x| x.dims()[self.axis]).collect();
        Ok(y)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let mut start = 0;
        let mut gxs = Vec::with_capacity(self.sizes.len());
        for &len in &self.sizes {
            gxs.push(Some(slice(gy, self.axis, start, start + len)?));
            start += len;
        }
        Ok(gxs)
    }
}

/// Join along `axis`.
pub fn concat(xs: &[&Variable], axis: usize) -> Result<Variable> {
    apply(
        Concat {
            axis,
            sizes: Vec::new(),
        },
        xs,
    )
}

/// Nearest-neighbour upsampling of `[N, C, H, W]` by `scale` on both
/// spatial axes.
pub fn upsample(x: &Variable, scale: usize) -> Result<Variable> {
    let dims = x.dims();
    if dims.len() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: dims.len(),
        });
    }
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let y = reshape(x, vec![n, c, h, 1, w, 1])?;
    let y = broadcast_to(&y, vec![n, c, h, scale, w, scale])?;
    reshape(&y, (n, c, h * scale, w * scale))
}

use super::{reshape, sum};
use crate::conv::{self as kernels, Pair};
use crate::error::{Error, Result};
use crate::function::{apply, BackwardCtx, Function};
use crate::tensor::Tensor;
use crate::variable::Variable;

// Convolution and pooling
//
// Each primitive's backward is another primitive of this file, so every
// rule is itself differentiable:
//
//   conv2d(x, W, b)          gx  = deconv2d(gy, W)       (sized back to x)
//                            gW  = conv2d_grad_w(x, gy)
//                            gb  = sum(gy, [0, 2, 3])
//   deconv2d(x, W, b)        gx  = conv2d(gy, W)
//                            gW  = conv2d_grad_w(gy, x)
//   conv2d_grad_w(x, gy)     gx  = deconv2d(gy, ggW)     ggy = conv2d(x, ggW)
//   im2col  <-> col2im
//
// Max pooling saves the argmax of each window. Its gradient scatters gy to
// those positions (pooling2d_grad); the derivative of that scatter gathers
// with the same indexes (pooling2d_with_indexes), and back again.

fn image_dims(x: &Variable) -> Result<[usize; 4]> {
    let d = x.dims();
    match d.as_slice() {
        &[n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::RankMismatch {
            expected: 4,
            got: d.len(),
        }),
    }
}

fn bias_grad(gy: &Variable) -> Result<Variable> {
    let channels = gy.dims()[1];
    reshape(&sum(gy, &[0, 2, 3], false)?, channels)
}

fn kernel_of(w: &Variable) -> Result<Pair> {
    let [_, _, kh, kw] = image_dims(w)?;
    Ok((kh, kw))
}

struct Conv2d {
    stride: Pair,
    pad: Pair,
}

impl Function for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        kernels::conv2d(&xs[0], &xs[1], xs.get(2), self.stride, self.pad)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x, w) = (ctx.input(0), ctx.input(1));
        let [_, _, h, wd] = image_dims(x)?;
        let gx = deconv2d(gy, w, None, self.stride, self.pad, Some((h, wd)))?;
        let gw = conv2d_grad_w(x, gy, kernel_of(w)?, self.stride, self.pad)?;
        let mut gxs = vec![Some(gx), Some(gw)];
        if ctx.inputs().len() == 3 {
            gxs.push(Some(bias_grad(gy)?));
        }
        Ok(gxs)
    }
}

/// 2-D convolution. `x: [N, C, H, W]`, `w: [OC, C, KH, KW]`, `b: [OC]`.
pub fn conv2d(
    x: &Variable,
    w: &Variable,
    b: Option<&Variable>,
    stride: Pair,
    pad: Pair,
) -> Result<Variable> {
    let func = Conv2d { stride, pad };
    match b {
        Some(b) => apply(func, &[x, w, b]),
        None => apply(func, &[x, w]),
    }
}

struct Deconv2d {
    stride: Pair,
    pad: Pair,
    out_hw: Option<Pair>,
}

impl Function for Deconv2d {
    fn name(&self) -> &'static str {
        "deconv2d"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        kernels::deconv2d(
            &xs[0],
            &xs[1],
            xs.get(2),
            self.stride,
            self.pad,
            self.out_hw,
        )
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x, w) = (ctx.input(0), ctx.input(1));
        let gx = conv2d(gy, w, None, self.stride, self.pad)?;
        let gw = conv2d_grad_w(gy, x, kernel_of(w)?, self.stride, self.pad)?;
        let mut gxs = vec![Some(gx), Some(gw)];
        if ctx.inputs().len() == 3 {
            gxs.push(Some(bias_grad(gy)?));
        }
        Ok(gxs)
    }
}

/// Transposed convolution. `x: [N, OC, H, W]`, `w: [OC, C, KH, KW]`,
/// `b: [C]`. `out_hw` pins the output size when several are possible.
pub fn deconv2d(
    x: &Variable,
    w: &Variable,
    b: Option<&Variable>,
    stride: Pair,
    pad: Pair,
    out_hw: Option<Pair>,
) -> Result<Variable> {
    let func = Deconv2d {
        stride,
        pad,
        out_hw,
    };
    match b {
        Some(b) => apply(func, &[x, w, b]),
        None => apply(func, &[x, w]),
    }
}

struct Conv2dGradW {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
}

impl Function for Conv2dGradW {
    fn name(&self) -> &'static str {
        "conv2d_grad_w"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        kernels::conv2d_grad_w(&xs[0], &xs[1], self.kernel, self.stride, self.pad)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, ggw: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x, gy) = (ctx.input(0), ctx.input(1));
        let [_, _, h, w] = image_dims(x)?;
        let gx = deconv2d(gy, ggw, None, self.stride, self.pad, Some((h, w)))?;
        let ggy = conv2d(x, ggw, None, self.stride, self.pad)?;
        Ok(vec![Some(gx), Some(ggy)])
    }
}

/// Weight gradient of [`conv2d`]: correlates `x` with `gy`.
pub fn conv2d_grad_w(
    x: &Variable,
    gy: &Variable,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Variable> {
    apply(
        Conv2dGradW {
            kernel,
            stride,
            pad,
        },
        &[x, gy],
    )
}

struct Im2col {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    to_matrix: bool,
    image: [usize; 4],
}

impl Function for Im2col {
    fn name(&self) -> &'static str {
        "im2col"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        xs[0].im2col(self.kernel, self.stride, self.pad, self.to_matrix)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let gx = col2im(
            gy,
            self.image,
            self.kernel,
            self.stride,
            self.pad,
            self.to_matrix,
        )?;
        Ok(vec![Some(gx)])
    }
}

/// Sliding windows of `x: [N, C, H, W]`; see [`Tensor::im2col`].
pub fn im2col(
    x: &Variable,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    to_matrix: bool,
) -> Result<Variable> {
    let image = image_dims(x)?;
    apply(
        Im2col {
            kernel,
            stride,
            pad,
            to_matrix,
            image,
        },
        &[x],
    )
}

struct Col2im {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    to_matrix: bool,
    image: [usize; 4],
}

impl Function for Col2im {
    fn name(&self) -> &'static str {
        "col2im"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        xs[0].col2im(self.image, self.kernel, self.stride, self.pad, self.to_matrix)
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let gx = im2col(gy, self.kernel, self.stride, self.pad, self.to_matrix)?;
        Ok(vec![Some(gx)])
    }
}

/// Scatter-add columns back into an image of shape `image`.
pub fn col2im(
    x: &Variable,
    image: [usize; 4],
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    to_matrix: bool,
) -> Result<Variable> {
    apply(
        Col2im {
            kernel,
            stride,
            pad,
            to_matrix,
            image,
        },
        &[x],
    )
}

struct Pooling {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    indexes: Tensor<i64>,
}

impl Function for Pooling {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let (y, indexes) = kernels::max_pool2d(&xs[0], self.kernel, self.stride, self.pad)?;
        self.indexes = indexes;
        Ok(y)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let image = image_dims(ctx.input(0))?;
        let gx = pooling2d_grad(gy, &self.indexes, image, self.kernel, self.stride, self.pad)?;
        Ok(vec![Some(gx)])
    }
}

/// Max pooling over `kernel` windows. Padding contributes zeros.
pub fn max_pool2d(x: &Variable, kernel: Pair, stride: Pair, pad: Pair) -> Result<Variable> {
    image_dims(x)?;
    apply(
        Pooling {
            kernel,
            stride,
            pad,
            indexes: Tensor::from_data(Vec::new(), 0)?,
        },
        &[x],
    )
}

struct Pooling2DGrad {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    image: [usize; 4],
    indexes: Tensor<i64>,
}

impl Function for Pooling2DGrad {
    fn name(&self) -> &'static str {
        "pooling2d_grad"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        kernels::pool_scatter(
            &xs[0],
            &self.indexes,
            self.image,
            self.kernel,
            self.stride,
            self.pad,
        )
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, ggx: &Variable) -> Result<Vec<Option<Variable>>> {
        let ggy = pooling2d_with_indexes(ggx, &self.indexes, self.kernel, self.stride, self.pad)?;
        Ok(vec![Some(ggy)])
    }
}

/// Route a pooled gradient `gy` back to the argmax positions of an input
/// of shape `image`.
pub fn pooling2d_grad(
    gy: &Variable,
    indexes: &Tensor<i64>,
    image: [usize; 4],
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Variable> {
    apply(
        Pooling2DGrad {
            kernel,
            stride,
            pad,
            image,
            indexes: indexes.clone(),
        },
        &[gy],
    )
}

struct Pooling2DWithIndexes {
    kernel: Pair,
    stride: Pair,
    pad: Pair,
    indexes: Tensor<i64>,
}

impl Function for Pooling2DWithIndexes {
    fn name(&self) -> &'static str {
        "pooling2d_with_indexes"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        kernels::pool_gather(&xs[0], &self.indexes, self.kernel, self.stride, self.pad)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let image = image_dims(ctx.input(0))?;
        let gx = pooling2d_grad(gy, &self.indexes, image, self.kernel, self.stride, self.pad)?;
        Ok(vec![Some(gx)])
    }
}

/// Pool `x` by picking the window elements named by `indexes` instead of
/// searching for the maximum.
pub fn pooling2d_with_indexes(
    x: &Variable,
    indexes: &Tensor<i64>,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Variable> {
    apply(
        Pooling2DWithIndexes {
            kernel,
            stride,
            pad,
            indexes: indexes.clone(),
        },
        &[x],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::mul;

    fn weighted_sum(y: &Variable, seed: u64) -> Result<Variable> {
        let w = Variable::constant(Tensor::randn_seeded(y.shape(), seed));
        sum(&mul(y, &w)?, &[], false)
    }

    #[test]
    fn test_conv2d_grad_shapes() -> Result<()> {
        let x = Variable::new(Tensor::randn_seeded((2, 3, 5, 5), 1));
        let w = Variable::new(Tensor::randn_seeded((4, 3, 3, 3), 2));
        let b = Variable::new(Tensor::zeros(4));
        let y = conv2d(&x, &w, Some(&b), (2, 2), (1, 1))?;
        assert_eq!(y.dims(), vec![2, 4, 3, 3]);
        weighted_sum(&y, 3)?.backward(false, false)?;
        assert_eq!(x.grad().unwrap().dims(), vec![2, 3, 5, 5]);
        assert_eq!(w.grad().unwrap().dims(), vec![4, 3, 3, 3]);
        assert_eq!(b.grad().unwrap().dims(), vec![4]);
        Ok(())
    }

    #[test]
    fn test_conv2d_bias_grad_is_sum() -> Result<()> {
        let x = Variable::new(Tensor::ones((2, 1, 3, 3)));
        let w = Variable::new(Tensor::ones((2, 1, 2, 2)));
        let b = Variable::new(Tensor::zeros(2));
        conv2d(&x, &w, Some(&b), (1, 1), (0, 0))?.backward(false, false)?;
        // N * OH * OW ones per output channel
        assert_eq!(b.grad().unwrap().to_vec(), vec![8.0, 8.0]);
        Ok(())
    }

    #[test]
    fn test_deconv2d_grad_shapes() -> Result<()> {
        let x = Variable::new(Tensor::randn_seeded((1, 2, 3, 3), 4));
        let w = Variable::new(Tensor::randn_seeded((2, 3, 3, 3), 5));
        let b = Variable::new(Tensor::zeros(3));
        let y = deconv2d(&x, &w, Some(&b), (2, 2), (1, 1), None)?;
        assert_eq!(y.dims(), vec![1, 3, 5, 5]);
        weighted_sum(&y, 6)?.backward(false, false)?;
        assert_eq!(x.grad().unwrap().dims(), vec![1, 2, 3, 3]);
        assert_eq!(w.grad().unwrap().dims(), vec![2, 3, 3, 3]);
        assert_eq!(b.grad().unwrap().dims(), vec![3]);
        Ok(())
    }

    #[test]
    fn test_im2col_col2im_grads() -> Result<()> {
        let x = Variable::new(Tensor::randn_seeded((1, 2, 4, 4), 9));
        let col = im2col(&x, (2, 2), (1, 1), (0, 0), true)?;
        assert_eq!(col.dims(), vec![9, 8]);
        col.backward(false, false)?;
        // each pixel's gradient counts the windows covering it
        let g = x.grad().unwrap().data();
        assert_eq!(g.get(&[0, 0, 0, 0])?, 1.0);
        assert_eq!(g.get(&[0, 1, 1, 1])?, 4.0);
        assert_eq!(g.get(&[0, 0, 0, 1])?, 2.0);
        Ok(())
    }

    #[test]
    fn test_max_pool_routes_to_argmax() -> Result<()> {
        let x = Variable::new(Tensor::from_vec(
            vec![
                1.0, 5.0, 2.0, 0.0, //
                3.0, 4.0, 8.0, 1.0, //
                0.0, 0.0, 1.0, 2.0, //
                9.0, 0.0, 3.0, 4.0,
            ],
            (1, 1, 4, 4),
        )?);
        let y = max_pool2d(&x, (2, 2), (2, 2), (0, 0))?;
        assert_eq!(y.to_vec(), vec![5.0, 8.0, 9.0, 4.0]);
        y.backward(false, false)?;
        let mut expected = vec![0.0; 16];
        for i in [1, 6, 12, 15] {
            expected[i] = 1.0;
        }
        assert_eq!(x.grad().unwrap().to_vec(), expected);
        Ok(())
    }

    #[test]
    fn test_pool_double_backward() -> Result<()> {
        let x = Variable::new(Tensor::randn_seeded((1, 2, 4, 4), 10));
        let y = max_pool2d(&x, (2, 2), (2, 2), (0, 0))?;
        let g = Variable::new(Tensor::randn_seeded((1, 2, 2, 2), 11));
        let loss = sum(&mul(&y, &g)?, &[], false)?;
        loss.backward(false, true)?;

        // d/dg of sum(gx * v) gathers v at the argmax positions
        let gx = x.grad().unwrap();
        g.cleargrad();
        let v = Tensor::randn_seeded((1, 2, 4, 4), 12);
        weighted_sum_with(&gx, &v)?.backward(false, false)?;
        let gg = g.grad().unwrap().to_vec();
        let gathered = {
            let (_, idx) = kernels::max_pool2d(&x.data(), (2, 2), (2, 2), (0, 0))?;
            kernels::pool_gather(&v, &idx, (2, 2), (2, 2), (0, 0))?.to_vec()
        };
        for (a, b) in gg.iter().zip(&gathered) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_pooling2d_grad_checks_gradient_shape() {
        let gy = Variable::new(Tensor::ones((2, 1, 1, 1)));
        let idx = Tensor::from_data(vec![0i64, 0], (2, 1, 1, 1)).unwrap();
        let res = pooling2d_grad(&gy, &idx, [1, 1, 2, 2], (2, 2), (2, 2), (0, 0));
        assert!(matches!(res, Err(Error::ShapeMismatch { .. })));
    }

    fn weighted_sum_with(y: &Variable, w: &Tensor) -> Result<Variable> {
        sum(&mul(y, &Variable::constant(w.clone()))?, &[], false)
    }
}

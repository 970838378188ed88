use super::{constant, exp, log, mul, mul_scalar, neg, sub, sum};
use crate::error::{Error, Result};
use crate::function::{apply, BackwardCtx, Function};
use crate::tensor::Tensor;
use crate::variable::Variable;

// Losses and classification helpers
//
//   softmax(x)                 exp(x - max) / sum(exp(x - max))
//   softmax_cross_entropy      -mean_i log softmax(x)[i, t_i]
//                              gx = (softmax(x) - onehot(t)) * gy / N
//   mean_squared_error         sum((x0 - x1)^2) / n
//                              gx0 = gy * (x0 - x1) * 2 / n, gx1 = -gx0
//
// Class labels are integer tensors and never receive a gradient.

fn shifted(x: &Variable, axes: &[usize]) -> Result<Variable> {
    // the max is a constant: softmax does not depend on the shift
    let m = x.data().max(axes, true)?;
    sub(x, &constant(m))
}

/// Softmax over `axes` (usually `&[1]` for `[N, C]` scores).
pub fn softmax(x: &Variable, axes: &[usize]) -> Result<Variable> {
    let e = exp(&shifted(x, axes)?)?;
    let s = sum(&e, axes, true)?;
    super::div(&e, &s)
}

/// Log-softmax over `axes`.
pub fn log_softmax(x: &Variable, axes: &[usize]) -> Result<Variable> {
    let z = shifted(x, axes)?;
    let lse = log(&sum(&exp(&z)?, axes, true)?)?;
    sub(&z, &lse)
}

fn check_labels(x: &Tensor, t: &Tensor<i64>) -> Result<(usize, usize, Vec<usize>)> {
    if x.rank() != 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: x.rank(),
        });
    }
    let (n, c) = (x.dims()[0], x.dims()[1]);
    if t.elem_count() != n {
        return Err(Error::ElementCountMismatch {
            shape: t.shape().clone(),
            expected: n,
            got: t.elem_count(),
        });
    }
    let labels = t
        .to_vec()
        .into_iter()
        .map(|l| {
            if l >= 0 && (l as usize) < c {
                Ok(l as usize)
            } else {
                Err(Error::IndexOutOfRange {
                    index: l.max(0) as usize,
                    dim: 1,
                    size: c,
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((n, c, labels))
}

struct SoftmaxCrossEntropy {
    labels: Tensor<i64>,
}

impl Function for SoftmaxCrossEntropy {
    fn name(&self) -> &'static str {
        "softmax_cross_entropy"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let x = &xs[0];
        let (n, c, labels) = check_labels(x, &self.labels)?;
        let z = x.sub(&x.max(&[1], true)?)?;
        let lse = z.exp().sum(&[1], true)?.log();
        let log_p = z.sub(&lse)?.to_vec();
        let total: f64 = labels
            .iter()
            .enumerate()
            .map(|(i, &l)| log_p[i * c + l] as f64)
            .sum();
        Ok(Tensor::scalar((-total / n as f64) as f32))
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let x = ctx.input(0);
        let (n, c, labels) = check_labels(&x.data(), &self.labels)?;
        let mut onehot = vec![0.0f32; n * c];
        for (i, &l) in labels.iter().enumerate() {
            onehot[i * c + l] = 1.0;
        }
        let onehot = constant(Tensor::from_vec(onehot, (n, c))?);
        let diff = sub(&softmax(x, &[1])?, &onehot)?;
        let gx = mul_scalar(&mul(&diff, gy)?, 1.0 / n as f32)?;
        Ok(vec![Some(gx)])
    }
}

/// Mean cross entropy of softmax(`x`) against class labels `t`, for scores
/// `x: [N, C]` and `t: [N]`.
pub fn softmax_cross_entropy(x: &Variable, t: &Tensor<i64>) -> Result<Variable> {
    apply(
        SoftmaxCrossEntropy {
            labels: t.clone(),
        },
        &[x],
    )
}

struct MeanSquaredError;

impl Function for MeanSquaredError {
    fn name(&self) -> &'static str {
        "mean_squared_error"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let diff = xs[0].sub(&xs[1])?;
        let n = diff.elem_count().max(1) as f32;
        diff.square().sum_all()?.mul_scalar(1.0 / n)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x0, x1) = (ctx.input(0), ctx.input(1));
        let diff = sub(x0, x1)?;
        let scale = 2.0 / diff.elem_count().max(1) as f32;
        let gx0 = mul_scalar(&mul(gy, &diff)?, scale)?;
        let gx1 = neg(&gx0)?;
        Ok(vec![
            Some(super::reduce_to(gx0, &x0.shape())?),
            Some(super::reduce_to(gx1, &x1.shape())?),
        ])
    }
}

pub fn mean_squared_error(x0: &Variable, x1: &Variable) -> Result<Variable> {
    apply(MeanSquaredError, &[x0, x1])
}

/// Fraction of rows of `y: [N, C]` whose argmax equals the label in `t`.
/// Not differentiable.
pub fn accuracy(y: &Variable, t: &Tensor<i64>) -> Result<f32> {
    let data = y.data();
    let (n, _, labels) = check_labels(&data, t)?;
    if n == 0 {
        return Ok(0.0);
    }
    let pred = data.argmax(1)?.to_vec();
    let hits = pred
        .iter()
        .zip(&labels)
        .filter(|(p, l)| **p as usize == **l)
        .count();
    Ok(hits as f32 / n as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn labels(v: &[i64]) -> Tensor<i64> {
        Tensor::from_data(v.to_vec(), v.len()).unwrap()
    }

    #[test]
    fn test_softmax_rows_sum_to_one() -> Result<()> {
        let x = Variable::new(Tensor::from_vec(vec![1.0, 2.0, 3.0, 1000.0, 0.0, -1000.0], (2, 3))?);
        let y = softmax(&x, &[1])?.to_vec();
        assert_relative_eq!(y[0] + y[1] + y[2], 1.0, epsilon = 1e-6);
        assert_relative_eq!(y[3], 1.0, epsilon = 1e-6);
        assert!(y.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_cross_entropy_value_and_grad() -> Result<()> {
        let x = Variable::new(Tensor::from_vec(vec![0.0, 0.0, 0.0, 0.0], (2, 2))?);
        let t = labels(&[0, 1]);
        let loss = softmax_cross_entropy(&x, &t)?;
        assert_relative_eq!(loss.item()?, std::f32::consts::LN_2, epsilon = 1e-6);
        loss.backward(false, false)?;
        let g = x.grad().unwrap().to_vec();
        assert_relative_eq!(g[0], -0.25, epsilon = 1e-6);
        assert_relative_eq!(g[1], 0.25, epsilon = 1e-6);
        assert_relative_eq!(g[2], 0.25, epsilon = 1e-6);
        assert_relative_eq!(g[3], -0.25, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_matches_log_softmax() -> Result<()> {
        let x = Variable::new(Tensor::from_vec(vec![0.5, -1.0, 2.0, 0.1, 0.2, 0.3], (2, 3))?);
        let t = labels(&[2, 0]);
        let fused = softmax_cross_entropy(&x, &t)?.item()?;
        let lp = log_softmax(&x, &[1])?.to_vec();
        assert_relative_eq!(fused, -(lp[2] + lp[3]) / 2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_bad_label() -> Result<()> {
        let x = Variable::new(Tensor::zeros((1, 3)));
        assert!(matches!(
            softmax_cross_entropy(&x, &labels(&[3])),
            Err(Error::IndexOutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_mean_squared_error() -> Result<()> {
        let x0 = Variable::new(Tensor::from_vec(vec![1.0, 2.0, 3.0], 3)?);
        let x1 = Variable::new(Tensor::from_vec(vec![2.0, 2.0, 2.0], 3)?);
        let loss = mean_squared_error(&x0, &x1)?;
        assert_relative_eq!(loss.item()?, 2.0 / 3.0, epsilon = 1e-6);
        loss.backward(false, false)?;
        let g0 = x0.grad().unwrap().to_vec();
        assert_relative_eq!(g0[0], -2.0 / 3.0, epsilon = 1e-5);
        assert_relative_eq!(g0[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(g0[2], 2.0 / 3.0, epsilon = 1e-5);
        assert_relative_eq!(x1.grad().unwrap().to_vec()[0], 2.0 / 3.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_accuracy() -> Result<()> {
        let y = Variable::new(Tensor::from_vec(
            vec![0.2, 0.8, 0.0, 0.1, 0.9, 0.0, 0.8, 0.1, 0.2, 0.8, 0.1, 0.0],
            (4, 3),
        )?);
        let acc = accuracy(&y, &labels(&[1, 2, 0, 1]))?;
        assert_relative_eq!(acc, 0.5);
        Ok(())
    }
}

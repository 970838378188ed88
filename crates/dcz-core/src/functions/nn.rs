use super::{add_scalar, constant, mean, mul, mul_scalar, pow, reshape, square, sub, sum};
use crate::bail;
use crate::config;
use crate::error::{Error, Result};
use crate::function::{apply, BackwardCtx, Function};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::variable::Variable;

// Regularisation and normalisation
//
// DROPOUT (inverted): in training mode each element is kept with
// probability 1 - rate and scaled by 1 / (1 - rate); in evaluation mode it
// is the identity.
//
// BATCH NORM over every axis except the channel axis 1:
//
//   x_hat = (x - mean) * inv_std,   inv_std = 1 / sqrt(var + eps)
//   y     = gamma * x_hat + beta
//
// Training mode uses the batch statistics and folds them into the running
// averages:
//
//   running = (1 - momentum) * running + momentum * batch
//
// and its input gradient is the closed form over the M reduced elements:
//
//   dx_hat = gy * gamma
//   dx     = inv_std / M * (M * dx_hat - sum(dx_hat) - x_hat * sum(dx_hat * x_hat))
//
// Evaluation mode feeds the running statistics in as two extra constant
// inputs; they are fixed, so dx = dx_hat * inv_std. Under create_graph the
// training-mode mean and inv_std are recomputed as functions of x, which
// makes second and higher derivatives exact.
//
//   dgamma = sum(gy * x_hat)    dbeta = sum(gy)

/// Inverted dropout, active only in training mode.
pub fn dropout(x: &Variable, rate: f32) -> Result<Variable> {
    if !(0.0..1.0).contains(&rate) {
        bail!("dropout rate {rate} outside [0, 1)");
    }
    if !config::is_training() || rate == 0.0 {
        return Ok(x.clone());
    }
    let scale = 1.0 / (1.0 - rate);
    let mask = Tensor::rand(x.shape()).map(|u| if u >= rate { scale } else { 0.0 });
    mul(x, &constant(mask))
}

/// Running statistics of a batch norm layer. The tensors are updated in
/// place, so handles taken from a layer's parameters see the new values.
#[derive(Debug, Clone)]
pub struct BatchNormState {
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub momentum: f32,
    pub eps: f32,
}

impl BatchNormState {
    /// Zero mean, unit variance.
    pub fn new(channels: usize, momentum: f32, eps: f32) -> Self {
        BatchNormState {
            running_mean: Tensor::zeros(channels),
            running_var: Tensor::ones(channels),
            momentum,
            eps,
        }
    }

    pub fn channels(&self) -> usize {
        self.running_mean.elem_count()
    }
}

struct BatchNorm {
    train: bool,
    state: BatchNormState,
    // saved by forward, broadcastable to x as [1, C, 1, ..]
    mean: Tensor,
    inv_std: Tensor,
    axes: Vec<usize>,
    count: usize,
}

impl BatchNorm {
    fn channel_shape(&self, x: &Shape) -> Shape {
        let mut dims = vec![1; x.rank()];
        dims[1] = x.dims()[1];
        Shape::new(dims)
    }
}

impl Function for BatchNorm {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        let x = &xs[0];
        if x.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: x.rank(),
            });
        }
        let c = x.dims()[1];
        for p in &xs[1..] {
            if p.elem_count() != c {
                return Err(Error::shape_mismatch(&Shape::from(c), p.shape()));
            }
        }
        let cshape = self.channel_shape(x.shape());
        self.axes = (0..x.rank()).filter(|&a| a != 1).collect();
        self.count = x.elem_count() / c.max(1);

        let (mean, var) = if self.train {
            let mean = x.mean(&self.axes, true)?;
            let var = x.sub(&mean)?.square().mean(&self.axes, true)?;

            let m = self.state.momentum;
            let unbias = if self.count > 1 {
                self.count as f32 / (self.count - 1) as f32
            } else {
                1.0
            };
            self.state
                .running_mean
                .zip_assign(&mean.reshape(c)?, |r, b| (1.0 - m) * r + m * b)?;
            self.state
                .running_var
                .zip_assign(&var.reshape(c)?, |r, b| (1.0 - m) * r + m * b * unbias)?;
            (mean, var)
        } else {
            (xs[3].reshape(&cshape)?, xs[4].reshape(&cshape)?)
        };

        self.inv_std = var.add_scalar(self.state.eps)?.powf(-0.5)?;
        self.mean = mean;
        let x_hat = x.sub(&self.mean)?.mul(&self.inv_std)?;
        x_hat
            .mul(&xs[1].reshape(&cshape)?)?
            .add(&xs[2].reshape(&cshape)?)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let x = ctx.input(0);
        let gamma = ctx.input(1);
        let cshape = self.channel_shape(&x.shape());
        let c = cshape.dims()[1];

        // When the backward pass is itself recorded, the batch statistics
        // are rebuilt from x so that higher derivatives flow through them.
        let (x_hat, inv_std) = if self.train && config::is_recording() {
            let centered = sub(x, &mean(x, &self.axes, true)?)?;
            let var = mean(&square(&centered)?, &self.axes, true)?;
            let inv_std = pow(&add_scalar(&var, self.state.eps)?, -0.5)?;
            (mul(&centered, &inv_std)?, inv_std)
        } else {
            let inv_std = constant(self.inv_std.clone());
            (mul(&sub(x, &constant(self.mean.clone()))?, &inv_std)?, inv_std)
        };

        let dgamma = reshape(&sum(&mul(gy, &x_hat)?, &self.axes, true)?, c)?;
        let dbeta = reshape(&sum(gy, &self.axes, true)?, c)?;

        let dx_hat = mul(gy, &reshape(gamma, &cshape)?)?;
        let dx = if self.train {
            let m = self.count as f32;
            let s1 = sum(&dx_hat, &self.axes, true)?;
            let s2 = sum(&mul(&dx_hat, &x_hat)?, &self.axes, true)?;
            let inner = sub(&sub(&mul_scalar(&dx_hat, m)?, &s1)?, &mul(&x_hat, &s2)?)?;
            mul(&mul_scalar(&inv_std, 1.0 / m)?, &inner)?
        } else {
            mul(&dx_hat, &inv_std)?
        };

        let mut gxs = vec![Some(dx), Some(dgamma), Some(dbeta)];
        gxs.resize(ctx.inputs().len(), None);
        Ok(gxs)
    }
}

/// Batch normalisation over channel axis 1 of `x` (rank >= 2). Uses batch
/// statistics and updates `state` in training mode, the running statistics
/// in evaluation mode.
pub fn batch_norm(
    x: &Variable,
    gamma: &Variable,
    beta: &Variable,
    state: &BatchNormState,
) -> Result<Variable> {
    let train = config::is_training();
    let func = BatchNorm {
        train,
        state: state.clone(),
        mean: Tensor::zeros(()),
        inv_std: Tensor::zeros(()),
        axes: Vec::new(),
        count: 0,
    };
    if train {
        apply(func, &[x, gamma, beta])
    } else {
        let mean = Variable::constant(state.running_mean.clone());
        let var = Variable::constant(state.running_var.clone());
        apply(func, &[x, gamma, beta, &mean, &var])
    }
}

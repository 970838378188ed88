// Optimizers: update trainable parameters from their gradients
//
//   SGD:          param -= lr * grad
//
//   MomentumSGD:  v      = momentum * v - lr * grad
//                 param += v
//
// Updates operate on the parameters' tensors directly and are never
// recorded. Parameters without a gradient (unused in the last pass) and
// buffers are skipped. Velocities are keyed by the parameter node's id and
// created lazily as zeros.

use std::collections::HashMap;

use dcz_core::{Result, Tensor};

use crate::layer::{Layer, Parameter};

/// An optimizer steps every trainable parameter of a layer.
pub trait Optimizer {
    /// Update a single parameter that holds a gradient.
    fn update_one(&mut self, param: &Parameter, grad: &Tensor) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    /// Update every parameter of `layer` that is trainable and has a
    /// gradient.
    fn step(&mut self, layer: &dyn Layer) -> Result<()> {
        for (name, p) in layer.params() {
            if !p.is_trainable() {
                continue;
            }
            let Some(g) = p.grad() else {
                log::trace!("optimizer: {name} has no gradient, skipped");
                continue;
            };
            self.update_one(&p, &g.data())?;
        }
        Ok(())
    }
}

/// Plain stochastic gradient descent.
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        SGD { lr }
    }
}

impl Default for SGD {
    fn default() -> Self {
        SGD::new(0.01)
    }
}

impl Optimizer for SGD {
    fn update_one(&mut self, param: &Parameter, grad: &Tensor) -> Result<()> {
        let updated = param.data().sub(&grad.mul_scalar(self.lr)?)?;
        param.set_data(updated);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// SGD with a velocity term.
#[derive(Debug, Clone)]
pub struct MomentumSGD {
    lr: f32,
    momentum: f32,
    velocities: HashMap<u64, Tensor>,
}

impl MomentumSGD {
    pub fn new(lr: f32, momentum: f32) -> Self {
        MomentumSGD {
            lr,
            momentum,
            velocities: HashMap::new(),
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Default for MomentumSGD {
    fn default() -> Self {
        MomentumSGD::new(0.01, 0.9)
    }
}

impl Optimizer for MomentumSGD {
    fn update_one(&mut self, param: &Parameter, grad: &Tensor) -> Result<()> {
        let v = match self.velocities.get(&param.id()) {
            Some(v) => v
                .mul_scalar(self.momentum)?
                .sub(&grad.mul_scalar(self.lr)?)?,
            None => grad.mul_scalar(-self.lr)?,
        };
        param.set_data(param.data().add(&v)?);
        self.velocities.insert(param.id(), v);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::Linear;
    use approx::assert_relative_eq;
    use dcz_core::functions::sum;
    use dcz_core::Variable;

    fn layer_with_grad() -> Result<Linear> {
        let l = Linear::from_tensors(Tensor::ones((2, 1)), Some(Tensor::zeros(1)))?;
        let x = Variable::constant(Tensor::from_vec(vec![1.0, 2.0], (1, 2))?);
        sum(&l.forward(&x)?, &[], false)?.backward(false, false)?;
        Ok(l)
    }

    #[test]
    fn test_sgd_step() -> Result<()> {
        let l = layer_with_grad()?;
        SGD::new(0.5).step(&l)?;
        // dW = x^T, db = 1
        assert_eq!(l.weight().unwrap().to_vec(), vec![0.5, 0.0]);
        assert_eq!(l.bias().unwrap().to_vec(), vec![-0.5]);
        Ok(())
    }

    #[test]
    fn test_momentum_accumulates_velocity() -> Result<()> {
        let l = layer_with_grad()?;
        let mut opt = MomentumSGD::new(0.1, 0.9);
        opt.step(&l)?;
        assert_relative_eq!(l.bias().unwrap().item()?, -0.1, epsilon = 1e-6);
        // same gradient again: v = 0.9 * -0.1 - 0.1
        opt.step(&l)?;
        assert_relative_eq!(l.bias().unwrap().item()?, -0.1 - 0.19, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_params_without_grad_are_skipped() -> Result<()> {
        let l = Linear::from_tensors(Tensor::ones((2, 1)), None)?;
        SGD::default().step(&l)?;
        assert_eq!(l.weight().unwrap().to_vec(), vec![1.0, 1.0]);
        Ok(())
    }
}

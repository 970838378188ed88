// BatchNorm2d: per-channel batch normalisation
//
//   x_hat = (x - mean) / sqrt(var + eps)
//   y     = gamma * x_hat + beta
//
// Statistics are taken over (N, H, W) for each of the C channels (any input
// of rank >= 2 with channels on axis 1 is accepted).
//
// RUNNING STATISTICS:
//
//   running_mean = (1 - momentum) * running_mean + momentum * mean_batch
//   running_var  = (1 - momentum) * running_var  + momentum * var_batch
//
// They are buffers: saved and loaded with the weights, never trained. The
// batch_norm function updates their tensors in place during training and
// reads them in evaluation mode.

use std::cell::Cell;

use dcz_core::config;
use dcz_core::functions::{batch_norm, BatchNormState};
use dcz_core::{Error, Result, Tensor, Variable};

use crate::layer::{Layer, Parameter};

pub struct BatchNorm2d {
    gamma: Parameter,
    beta: Parameter,
    running_mean: Parameter,
    running_var: Parameter,
    momentum: f32,
    eps: f32,
    training: Cell<bool>,
}

impl BatchNorm2d {
    /// Momentum 0.1, eps 1e-5.
    pub fn new(channels: usize) -> Self {
        Self::with_options(channels, 0.1, 1e-5)
    }

    pub fn with_options(channels: usize, momentum: f32, eps: f32) -> Self {
        BatchNorm2d {
            gamma: Parameter::new(Tensor::ones(channels)),
            beta: Parameter::new(Tensor::zeros(channels)),
            running_mean: Parameter::buffer(Tensor::zeros(channels)),
            running_var: Parameter::buffer(Tensor::ones(channels)),
            momentum,
            eps,
            training: Cell::new(true),
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.elem_count()
    }

    pub fn running_mean(&self) -> Tensor {
        self.running_mean.data()
    }

    pub fn running_var(&self) -> Tensor {
        self.running_var.data()
    }

    fn state(&self) -> BatchNormState {
        BatchNormState {
            running_mean: self.running_mean.data(),
            running_var: self.running_var.data(),
            momentum: self.momentum,
            eps: self.eps,
        }
    }
}

impl Layer for BatchNorm2d {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        if x.rank() >= 2 && x.dims()[1] != self.channels() {
            return Err(Error::msg(format!(
                "batch norm: expected {} channels, got {}",
                self.channels(),
                x.dims()[1]
            )));
        }
        let state = self.state();
        config::with_training(self.training.get(), || {
            batch_norm(x, &self.gamma, &self.beta, &state)
        })
    }

    fn params(&self) -> Vec<(String, Parameter)> {
        vec![
            ("gamma".to_string(), self.gamma.clone()),
            ("beta".to_string(), self.beta.clone()),
            ("running_mean".to_string(), self.running_mean.clone()),
            ("running_var".to_string(), self.running_var.clone()),
        ]
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_train_updates_running_stats() -> Result<()> {
        let bn = BatchNorm2d::new(2);
        // channel 0 is all 2.0, channel 1 all 4.0
        let data: Vec<f32> = (0..16).map(|i| if (i / 4) % 2 == 0 { 2.0 } else { 4.0 }).collect();
        let x = Variable::constant(Tensor::from_vec(data, (2, 2, 2, 2))?);
        let y = bn.forward(&x)?;
        assert!(y.to_vec().iter().all(|v| v.abs() < 1e-3));
        let rm = bn.running_mean().to_vec();
        assert_relative_eq!(rm[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(rm[1], 0.4, epsilon = 1e-6);
        // zero batch variance decays the running variance
        assert_relative_eq!(bn.running_var().to_vec()[0], 0.9, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_eval_uses_running_stats_and_leaves_them() -> Result<()> {
        let bn = BatchNorm2d::new(1);
        bn.eval();
        assert!(!bn.is_training());
        let x = Variable::constant(Tensor::from_vec(vec![1.0, 3.0], (2, 1))?);
        let y = bn.forward(&x)?;
        // running mean 0, var 1
        assert_relative_eq!(y.to_vec()[1], 3.0, epsilon = 1e-4);
        assert_eq!(bn.running_mean().to_vec(), vec![0.0]);
        // the layer's mode does not leak into the context
        assert!(config::is_training());
        Ok(())
    }

    #[test]
    fn test_buffers_are_listed_but_not_trainable() {
        let bn = BatchNorm2d::new(3);
        let names: Vec<String> = bn.params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["gamma", "beta", "running_mean", "running_var"]);
        assert_eq!(bn.num_parameters(), 6);
    }

    #[test]
    fn test_channel_mismatch() {
        let bn = BatchNorm2d::new(3);
        let x = Variable::constant(Tensor::zeros((2, 4, 1, 1)));
        assert!(bn.forward(&x).is_err());
    }
}

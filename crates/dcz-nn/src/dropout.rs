// Dropout: regularization via random zeroing
//
// During training each element is zeroed with probability `rate` and the
// survivors are scaled by 1 / (1 - rate), preserving the expected value.
// In evaluation mode the layer is the identity.

use std::cell::Cell;

use dcz_core::functions::dropout;
use dcz_core::{bail, config, Result, Variable};

use crate::layer::{Layer, Parameter};

pub struct Dropout {
    rate: f32,
    training: Cell<bool>,
}

impl Dropout {
    /// Fails unless `rate` is in `[0, 1)`.
    pub fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            bail!("dropout rate {rate} outside [0, 1)");
        }
        Ok(Dropout {
            rate,
            training: Cell::new(true),
        })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Layer for Dropout {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        config::with_training(self.training.get(), || dropout(x, self.rate))
    }

    fn params(&self) -> Vec<(String, Parameter)> {
        Vec::new()
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }
}

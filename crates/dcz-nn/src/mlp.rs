// MLP: a stack of Linear layers with an activation between them
//
//   x -> l0 -> act -> l1 -> act -> ... -> l{n-1} -> y
//
// No activation follows the last layer. Every Linear infers its input size
// lazily, so only the output sizes are given.

use dcz_core::functions::sigmoid;
use dcz_core::{Result, Variable};

use crate::layer::{prefixed, Layer, Parameter};
use crate::linear::Linear;

/// Activation applied between layers.
pub type Activation = fn(&Variable) -> Result<Variable>;

pub struct MLP {
    layers: Vec<Linear>,
    activation: Activation,
}

impl MLP {
    /// Sigmoid between layers.
    pub fn new(out_sizes: &[usize]) -> Self {
        Self::with_activation(out_sizes, sigmoid)
    }

    pub fn with_activation(out_sizes: &[usize], activation: Activation) -> Self {
        MLP {
            layers: out_sizes
                .iter()
                .map(|&n| Linear::new(None, n, true))
                .collect(),
            activation,
        }
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }
}

impl Layer for MLP {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        let mut h = x.clone();
        let last = self.layers.len().saturating_sub(1);
        for (i, l) in self.layers.iter().enumerate() {
            h = l.forward(&h)?;
            if i < last {
                h = (self.activation)(&h)?;
            }
        }
        Ok(h)
    }

    fn params(&self) -> Vec<(String, Parameter)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| prefixed(&format!("l{i}"), l.params()))
            .collect()
    }
}

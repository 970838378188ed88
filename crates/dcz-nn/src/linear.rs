// Linear: fully connected layer
//
//   y = x @ W + b
//
//   x: [batch, in_size]   W: [in_size, out_size]   b: [out_size]
//
// WEIGHT INITIALIZATION:
//
//   W ~ N(0, 1) * sqrt(1 / in_size)      b = 0
//
// When in_size is not given, W is created on the first forward() from the
// input's trailing dimension. Until then params() reports only the bias.

use std::cell::RefCell;

use dcz_core::functions::linear;
use dcz_core::{Error, Result, Tensor, Variable};

use crate::layer::{Layer, Parameter};

/// A fully connected layer `y = x @ W + b`.
pub struct Linear {
    weight: RefCell<Option<Parameter>>,
    bias: Option<Parameter>,
    out_size: usize,
}

impl Linear {
    /// `in_size = None` defers creating W until the first forward pass.
    pub fn new(in_size: Option<usize>, out_size: usize, use_bias: bool) -> Self {
        Linear {
            weight: RefCell::new(in_size.map(|i| Parameter::new(init_weight(i, out_size)))),
            bias: use_bias.then(|| Parameter::new(Tensor::zeros(out_size))),
            out_size,
        }
    }

    /// Build from existing tensors; `weight` must be `[in, out]`.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: weight.rank(),
            });
        }
        let out_size = weight.dims()[1];
        if let Some(b) = &bias {
            if b.dims() != [out_size] {
                return Err(Error::ShapeMismatch {
                    expected: out_size.into(),
                    got: b.shape().clone(),
                });
            }
        }
        Ok(Linear {
            weight: RefCell::new(Some(Parameter::new(weight))),
            bias: bias.map(Parameter::new),
            out_size,
        })
    }

    pub fn in_size(&self) -> Option<usize> {
        self.weight.borrow().as_ref().map(|w| w.dims()[0])
    }

    pub fn out_size(&self) -> usize {
        self.out_size
    }

    pub fn weight(&self) -> Option<Parameter> {
        self.weight.borrow().clone()
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn weight_for(&self, x: &Variable) -> Result<Parameter> {
        let mut slot = self.weight.borrow_mut();
        if let Some(w) = slot.as_ref() {
            return Ok(w.clone());
        }
        let in_size = *x.dims().last().ok_or(Error::RankMismatch {
            expected: 2,
            got: 0,
        })?;
        log::debug!("linear: initialising W [{in_size}, {}]", self.out_size);
        let w = Parameter::new(init_weight(in_size, self.out_size));
        *slot = Some(w.clone());
        Ok(w)
    }
}

fn init_weight(in_size: usize, out_size: usize) -> Tensor {
    let scale = (1.0 / in_size.max(1) as f32).sqrt();
    Tensor::randn((in_size, out_size)).map(|v| v * scale)
}

impl Layer for Linear {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        let w = self.weight_for(x)?;
        linear(x, &w, self.bias.as_deref())
    }

    fn params(&self) -> Vec<(String, Parameter)> {
        let mut out = Vec::with_capacity(2);
        if let Some(w) = self.weight.borrow().as_ref() {
            out.push(("W".to_string(), w.clone()));
        }
        if let Some(b) = &self.bias {
            out.push(("b".to_string(), b.clone()));
        }
        out
    }
}

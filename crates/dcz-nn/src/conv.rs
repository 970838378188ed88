// Conv2d: 2D convolution layer
//
//   x: [N, C, H, W]  W: [OC, C, KH, KW]  b: [OC]  ->  y: [N, OC, OH, OW]
//
//   OH = (H + 2*PH - KH) / SH + 1     (same for OW)
//
// WEIGHT INITIALIZATION:
//
//   W ~ N(0, 1) * sqrt(1 / (C * KH * KW))      b = 0
//
// As with Linear, the input channel count may be left open and is then
// taken from the first input.

use std::cell::RefCell;

use dcz_core::functions::conv2d;
use dcz_core::{Error, Pair, Result, Tensor, Variable};

use crate::layer::{Layer, Parameter};

pub struct Conv2d {
    weight: RefCell<Option<Parameter>>,
    bias: Option<Parameter>,
    out_channels: usize,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
}

impl Conv2d {
    pub fn new(
        in_channels: Option<usize>,
        out_channels: usize,
        kernel: Pair,
        stride: Pair,
        pad: Pair,
        use_bias: bool,
    ) -> Self {
        Conv2d {
            weight: RefCell::new(
                in_channels.map(|c| Parameter::new(init_weight(c, out_channels, kernel))),
            ),
            bias: use_bias.then(|| Parameter::new(Tensor::zeros(out_channels))),
            out_channels,
            kernel,
            stride,
            pad,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> Pair {
        self.kernel
    }

    pub fn weight(&self) -> Option<Parameter> {
        self.weight.borrow().clone()
    }

    fn weight_for(&self, x: &Variable) -> Result<Parameter> {
        let mut slot = self.weight.borrow_mut();
        if let Some(w) = slot.as_ref() {
            return Ok(w.clone());
        }
        if x.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: x.rank(),
            });
        }
        let c = x.dims()[1];
        log::debug!(
            "conv2d: initialising W [{}, {c}, {}, {}]",
            self.out_channels,
            self.kernel.0,
            self.kernel.1
        );
        let w = Parameter::new(init_weight(c, self.out_channels, self.kernel));
        *slot = Some(w.clone());
        Ok(w)
    }
}

fn init_weight(c: usize, oc: usize, (kh, kw): Pair) -> Tensor {
    let scale = (1.0 / (c * kh * kw).max(1) as f32).sqrt();
    Tensor::randn((oc, c, kh, kw)).map(|v| v * scale)
}

impl Layer for Conv2d {
    fn forward(&self, x: &Variable) -> Result<Variable> {
        let w = self.weight_for(x)?;
        conv2d(x, &w, self.bias.as_deref(), self.stride, self.pad)
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

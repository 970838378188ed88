// Differentiable functions
//
// Every primitive is a Function impl plus a free function that builds a
// fresh instance and applies it:
//
//   arith   add sub mul div neg pow square, scalar forms, operators
//   math    exp log sin cos tanh sigmoid relu silu
//   shape   reshape transpose broadcast_to sum_to sum mean get_item concat
//           upsample
//   linalg  matmul linear
//   loss    softmax softmax_cross_entropy mean_squared_error accuracy
//   nn      dropout batch_norm
//   conv    conv2d deconv2d conv2d_grad_w im2col col2im and max pooling
//
// Composite functions (silu, softmax, dropout, upsample) are written in
// terms of the primitives and get their gradients for free.

mod arith;
mod conv;
mod linalg;
mod loss;
mod math;
mod nn;
mod shape;

pub use arith::{
    add, add_scalar, div, div_scalar, mul, mul_scalar, neg, pow, rdiv_scalar, rsub_scalar,
    square, sub, sub_scalar,
};
pub use conv::{
    col2im, conv2d, conv2d_grad_w, deconv2d, im2col, max_pool2d, pooling2d_grad,
    pooling2d_with_indexes,
};
pub use linalg::{linear, matmul};
pub use loss::{accuracy, log_softmax, mean_squared_error, softmax, softmax_cross_entropy};
pub use math::{clip, cos, exp, log, relu, sigmoid, silu, sin, sqrt, tanh};
pub use nn::{batch_norm, dropout, BatchNormState};
pub use shape::{
    broadcast_to, concat, get_item, get_item_grad, mean, reshape, slice, sum, sum_to,
    transpose, upsample,
};

use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::variable::Variable;

/// Sum a gradient back down to the shape of the input it belongs to.
pub(crate) fn reduce_to(g: Variable, shape: &Shape) -> Result<Variable> {
    if &g.shape() == shape {
        Ok(g)
    } else {
        sum_to(&g, shape.clone())
    }
}

pub(crate) fn constant(t: Tensor) -> Variable {
    Variable::constant(t)
}

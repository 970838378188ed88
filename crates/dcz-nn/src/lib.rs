//! # dcz-nn
//!
//! Layers, parameters and optimizers on top of dcz-core.
//!
//! Every layer implements the [`Layer`] trait: `forward()` on a
//! [`Variable`](dcz_core::Variable), named `params()` flattened with `.`
//! separators, `cleargrads()`, `get_param()` and train/eval switching.
//!
//! 1. **Linear** fully connected, lazily sized
//! 2. **MLP** stacked Linear layers with an activation
//! 3. **Conv2d** image convolution
//! 4. **BatchNorm2d** per-channel normalisation with running statistics
//! 5. **Dropout** inverted dropout
//! 6. **SGD / MomentumSGD** parameter updates

pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod layer;
pub mod linear;
pub mod mlp;
pub mod optim;

pub use batchnorm::BatchNorm2d;
pub use conv::Conv2d;
pub use dropout::Dropout;
pub use layer::{prefixed, Layer, Parameter};
pub use linear::Linear;
pub use mlp::{Activation, MLP};
pub use optim::{MomentumSGD, Optimizer, SGD};

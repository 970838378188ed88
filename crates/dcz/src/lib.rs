//! # DeepCZero
//!
//! Strided tensors, define-by-run autodiff and small neural networks.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use dcz::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `dcz-core` | Tensor, Shape, Layout, Backend, Variable, Function, graph scheduler, Config |
//! | `dcz-nn` | Layer trait, Linear, MLP, Conv2d, BatchNorm2d, Dropout, SGD |
//!
//! ## Modules
//!
//! - [`functions`]: every differentiable primitive
//! - [`serialize`]: DCZ1 weight files

/// Re-export core types.
pub use dcz_core::{
    backend::{self, Backend, BackendKind, BinaryOp, ReduceOp, UnaryOp},
    bail, clear_graph, config, no_grad, tape, test_mode, using_config, with_recording, Config,
    ConfigGuard, ConfigKey, DType, Error, GraphEpoch, Layout, OpId, Origin, Pair, Result, Shape,
    Tensor, Variable, WithDType,
};

/// Differentiable functions.
pub mod functions {
    pub use dcz_core::functions::*;
    pub use dcz_core::{apply, BackwardCtx, Function};
}

/// Re-export layers and optimizers.
pub mod nn {
    pub use dcz_nn::*;
}

/// DCZ1: save and load layer parameters.
pub mod serialize;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::functions::{
        add, conv2d, exp, linear, matmul, max_pool2d, mean_squared_error, mul, relu, reshape,
        sigmoid, softmax, softmax_cross_entropy, square, sum, tanh,
    };
    pub use crate::nn::{
        BatchNorm2d, Conv2d, Dropout, Layer, Linear, MomentumSGD, Optimizer, Parameter, MLP, SGD,
    };
    pub use crate::serialize::{load_layer, save_layer, ShapePolicy};
    pub use crate::{no_grad, test_mode, GraphEpoch, Result, Shape, Tensor, Variable};
}

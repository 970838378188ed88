//! # dcz-core
//!
//! Strided tensors and define-by-run reverse-mode autodiff for dcz.
//!
//! This crate provides:
//! - [`Tensor`]: n-dimensional array over shared storage with views
//! - [`Shape`] / [`Layout`]: shape, strides and offset
//! - [`DType`] / [`WithDType`]: element types (f32 math, integer indices)
//! - [`Backend`]: swappable dense kernels (CPU reference, rayon)
//! - [`Variable`] / [`Function`]: graph nodes and differentiable primitives
//! - [`graph`] / [`backprop`]: backward scheduling and gradient accumulation
//! - [`config`]: recording and training flags with scoped overrides
// - dtype, shape, layout: element types and memory layout
// - backend: kernel strategy selected at run time
// - tensor, conv: the tensor engine and im2col/col2im kernels
// - config: thread-local execution context
// - variable, function, tape: nodes, operations and the graph arena
// - graph, backprop: topological order and the backward pass
// - functions: every differentiable primitive

pub mod backend;
pub mod backprop;
pub mod config;
pub mod conv;
pub mod dtype;
pub mod error;
pub mod function;
pub mod functions;
pub mod graph;
pub mod layout;
pub mod shape;
pub mod tape;
pub mod tensor;
pub mod variable;

pub use backend::{Backend, BackendKind, BinaryOp, ReduceOp, UnaryOp};
pub use config::{no_grad, test_mode, using_config, with_recording, Config, ConfigGuard, ConfigKey};
pub use conv::Pair;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use function::{apply, BackwardCtx, Function};
pub use layout::Layout;
pub use shape::Shape;
pub use tape::{clear_graph, GraphEpoch, OpId};
pub use tensor::Tensor;
pub use variable::{Origin, Variable};

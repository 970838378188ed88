// Layer: the interface every network building block implements
//
// A layer owns its parameters and exposes them by name. Composite layers
// (MLP, user models) report their sublayers' parameters with a dotted
// prefix, so a two-layer MLP yields
//
//   l0.W  l0.b  l1.W  l1.b
//
// Those names are what the weight file stores and what get_param resolves.
//
// PARAMETERS vs BUFFERS:
//
//   Parameter::new     trainable, receives gradients, updated by optimizers
//   Parameter::buffer  state that is saved with the weights but never
//                      trained (batch norm running statistics)
//
// Training mode lives on the layer (Cell<bool>, so &self suffices) and is
// pushed into the execution context around forward(), which is what the
// dropout and batch_norm functions consult.

use std::fmt;
use std::ops::Deref;

use dcz_core::{Error, Result, Tensor, Variable};

/// A named weight of a layer. Derefs to the underlying graph node.
#[derive(Clone)]
pub struct Parameter(Variable);

impl Parameter {
    /// A trainable parameter.
    pub fn new(data: Tensor) -> Self {
        Parameter(Variable::new(data))
    }

    /// Non-trainable state that is still saved and loaded with the layer.
    pub fn buffer(data: Tensor) -> Self {
        Parameter(Variable::constant(data))
    }

    pub fn var(&self) -> &Variable {
        &self.0
    }

    pub fn is_trainable(&self) -> bool {
        self.0.requires_grad()
    }
}

impl Deref for Parameter {
    type Target = Variable;

    fn deref(&self) -> &Variable {
        &self.0
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Parameter({:?})", self.0)
    }
}

/// The trait every layer implements.
pub trait Layer {
    /// Compute the layer output. Parameters may be created lazily here from
    /// the input shape.
    fn forward(&self, x: &Variable) -> Result<Variable>;

    /// Every parameter of this layer and its sublayers, named with `.`
    /// separators.
    fn params(&self) -> Vec<(String, Parameter)>;

    /// Set training or evaluation mode, recursively. Default: no-op.
    fn set_training(&self, _training: bool) {}

    fn is_training(&self) -> bool {
        true
    }

    fn train(&self) {
        self.set_training(true);
    }

    fn eval(&self) {
        self.set_training(false);
    }

    /// Reset the gradient of every parameter.
    fn cleargrads(&self) {
        for (_, p) in self.params() {
            p.cleargrad();
        }
    }

    /// Look up a parameter by its dotted name.
    fn get_param(&self, name: &str) -> Result<Parameter> {
        self.params()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
            .ok_or_else(|| Error::MissingEntity(format!("parameter '{name}'")))
    }

    /// Total number of trainable scalars.
    fn num_parameters(&self) -> usize {
        self.params()
            .iter()
            .filter(|(_, p)| p.is_trainable())
            .map(|(_, p)| p.elem_count())
            .sum()
    }
}

/// Prefix a sublayer's parameter names with `prefix.`.
pub fn prefixed(prefix: &str, params: Vec<(String, Parameter)>) -> Vec<(String, Parameter)> {
    params
        .into_iter()
        .map(|(n, p)| (format!("{prefix}.{n}"), p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Affine {
        scale: Parameter,
        shift: Parameter,
    }

    impl Layer for Affine {
        fn forward(&self, x: &Variable) -> Result<Variable> {
            &(x * &*self.scale)? + &*self.shift
        }

        fn params(&self) -> Vec<(String, Parameter)> {
            vec![
                ("scale".into(), self.scale.clone()),
                ("shift".into(), self.shift.clone()),
            ]
        }
    }

    fn affine() -> Affine {
        Affine {
            scale: Parameter::new(Tensor::full(2, 3.0)),
            shift: Parameter::buffer(Tensor::ones(2)),
        }
    }

    #[test]
    fn test_get_param_and_missing() {
        let layer = affine();
        let p = layer.get_param("scale").unwrap();
        assert!(p.ptr_eq(&layer.scale));
        assert!(matches!(
            layer.get_param("bias"),
            Err(Error::MissingEntity(_))
        ));
    }

    #[test]
    fn test_buffers_are_not_trained() -> Result<()> {
        let layer = affine();
        assert_eq!(layer.num_parameters(), 2);
        let x = Variable::new(Tensor::from_vec(vec![1.0, 2.0], 2)?);
        let y = dcz_core::functions::sum(&layer.forward(&x)?, &[], false)?;
        y.backward(false, false)?;
        assert_eq!(layer.scale.grad().unwrap().to_vec(), vec![1.0, 2.0]);
        assert!(layer.shift.grad().is_none());

        layer.cleargrads();
        assert!(layer.scale.grad().is_none());
        Ok(())
    }

    #[test]
    fn test_prefixed_names() {
        let names: Vec<String> = prefixed("head", affine().params())
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["head.scale", "head.shift"]);
    }
}

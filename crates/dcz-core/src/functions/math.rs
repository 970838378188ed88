use super::{constant, mul, mul_scalar, neg, pow, rsub_scalar, square};
use crate::error::Result;
use crate::function::{apply, BackwardCtx, Function};
use crate::tensor::Tensor;
use crate::variable::Variable;

// Elementwise math
//
//   exp      gx = gy * y
//   log      gx = gy / x
//   sqrt     gx = gy * 0.5 / y
//   sin      gx = gy * cos(x)
//   cos      gx = -gy * sin(x)
//   tanh     gx = gy * (1 - y^2)
//   sigmoid  gx = gy * y * (1 - y)
//   relu     gx = gy * [x > 0]
//   clip     gx = gy * [lo <= x <= hi]
//
// Rules that reuse y read it from the recorded output node, so with
// create_graph the derivative of y itself is part of the new graph.

macro_rules! unary_fn {
    ($ty:ident, $name:literal, |$x:ident| $fwd:expr, |$ctx:ident, $gy:ident| $bwd:expr) => {
        struct $ty;

        impl Function for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
                let $x = &xs[0];
                Ok($fwd)
            }

            fn backward(
                &self,
                $ctx: &BackwardCtx<'_>,
                $gy: &Variable,
            ) -> Result<Vec<Option<Variable>>> {
                Ok(vec![Some($bwd)])
            }
        }
    };
}

unary_fn!(Exp, "exp", |x| x.exp(), |ctx, gy| mul(gy, ctx.output())?);
unary_fn!(Log, "log", |x| x.log(), |ctx, gy| super::div(gy, ctx.input(0))?);
unary_fn!(Sin, "sin", |x| x.sin(), |ctx, gy| mul(gy, &cos(ctx.input(0))?)?);
unary_fn!(Cos, "cos", |x| x.cos(), |ctx, gy| mul(gy, &neg(&sin(ctx.input(0))?)?)?);
unary_fn!(Sqrt, "sqrt", |x| x.sqrt(), |ctx, gy| {
    mul_scalar(&mul(gy, &pow(ctx.output(), -1.0)?)?, 0.5)?
});
unary_fn!(Tanh, "tanh", |x| x.tanh(), |ctx, gy| {
    mul(gy, &rsub_scalar(&square(ctx.output())?, 1.0)?)?
});
unary_fn!(Sigmoid, "sigmoid", |x| x.sigmoid(), |ctx, gy| {
    let y = ctx.output();
    mul(&mul(gy, y)?, &rsub_scalar(y, 1.0)?)?
});
unary_fn!(Relu, "relu", |x| x.relu(), |ctx, gy| {
    mul(gy, &constant(ctx.input(0).data().gt_scalar(0.0)))?
});

struct Clip {
    lo: f32,
    hi: f32,
}

impl Function for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        Ok(xs[0].clamp(self.lo, self.hi))
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (lo, hi) = (self.lo, self.hi);
        let mask = ctx
            .input(0)
            .data()
            .map(|v| if v >= lo && v <= hi { 1.0f32 } else { 0.0 });
        Ok(vec![Some(mul(gy, &constant(mask))?)])
    }
}

pub fn exp(x: &Variable) -> Result<Variable> {
    apply(Exp, &[x])
}

pub fn log(x: &Variable) -> Result<Variable> {
    apply(Log, &[x])
}

pub fn sin(x: &Variable) -> Result<Variable> {
    apply(Sin, &[x])
}

pub fn cos(x: &Variable) -> Result<Variable> {
    apply(Cos, &[x])
}

pub fn sqrt(x: &Variable) -> Result<Variable> {
    apply(Sqrt, &[x])
}

pub fn tanh(x: &Variable) -> Result<Variable> {
    apply(Tanh, &[x])
}

pub fn sigmoid(x: &Variable) -> Result<Variable> {
    apply(Sigmoid, &[x])
}

pub fn relu(x: &Variable) -> Result<Variable> {
    apply(Relu, &[x])
}

/// `x * sigmoid(x)`
pub fn silu(x: &Variable) -> Result<Variable> {
    mul(x, &sigmoid(x)?)
}

pub fn clip(x: &Variable, lo: f32, hi: f32) -> Result<Variable> {
    apply(Clip { lo, hi }, &[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scalar(v: f32) -> Variable {
        Variable::new(Tensor::scalar(v))
    }

    fn grad_of(f: impl Fn(&Variable) -> Result<Variable>, at: f32) -> Result<f32> {
        let x = scalar(at);
        f(&x)?.backward(false, false)?;
        x.grad().unwrap().item()
    }

    #[test]
    fn test_first_derivatives() -> Result<()> {
        let x = 0.7f32;
        assert_relative_eq!(grad_of(exp, x)?, x.exp(), epsilon = 1e-5);
        assert_relative_eq!(grad_of(log, x)?, 1.0 / x, epsilon = 1e-5);
        assert_relative_eq!(grad_of(sin, x)?, x.cos(), epsilon = 1e-5);
        assert_relative_eq!(grad_of(cos, x)?, -x.sin(), epsilon = 1e-5);
        assert_relative_eq!(grad_of(sqrt, x)?, 0.5 / x.sqrt(), epsilon = 1e-5);
        assert_relative_eq!(grad_of(tanh, x)?, 1.0 - x.tanh().powi(2), epsilon = 1e-5);
        let s = 1.0 / (1.0 + (-x).exp());
        assert_relative_eq!(grad_of(sigmoid, x)?, s * (1.0 - s), epsilon = 1e-5);
        assert_relative_eq!(grad_of(silu, x)?, s + x * s * (1.0 - s), epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_relu_and_clip_masks() -> Result<()> {
        let x = Variable::new(Tensor::from_vec(vec![-1.0, 0.5, 2.0], 3)?);
        relu(&x)?.backward(false, false)?;
        assert_eq!(x.grad().unwrap().to_vec(), vec![0.0, 1.0, 1.0]);

        x.cleargrad();
        let y = clip(&x, 0.0, 1.0)?;
        assert_eq!(y.to_vec(), vec![0.0, 0.5, 1.0]);
        y.backward(false, false)?;
        assert_eq!(x.grad().unwrap().to_vec(), vec![0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_sin_second_derivative() -> Result<()> {
        let x = scalar(1.0);
        sin(&x)?.backward(false, true)?;
        let gx = x.grad().unwrap();
        assert_relative_eq!(gx.item()?, 1.0f32.cos(), epsilon = 1e-6);

        x.cleargrad();
        gx.backward(false, true)?;
        assert_relative_eq!(x.grad().unwrap().item()?, -(1.0f32.sin()), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_tanh_second_derivative() -> Result<()> {
        let v = 0.3f32;
        let x = scalar(v);
        tanh(&x)?.backward(false, true)?;
        let gx = x.grad().unwrap();
        x.cleargrad();
        gx.backward(false, false)?;
        // d2/dx2 tanh = -2 tanh(x) (1 - tanh^2(x))
        let t = v.tanh();
        assert_relative_eq!(
            x.grad().unwrap().item()?,
            -2.0 * t * (1.0 - t * t),
            epsilon = 1e-5
        );
        Ok(())
    }
}

use std::ops;

use super::{constant, reduce_to};
use crate::error::Result;
use crate::function::{apply, BackwardCtx, Function};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::variable::Variable;

// Elementwise arithmetic
//
// Binary ops broadcast in forward, so their gradients are summed back down
// to each input's shape (sum_to is the adjoint of broadcast_to).
//
//   add:  gx0 = gy            gx1 = gy
//   sub:  gx0 = gy            gx1 = -gy
//   mul:  gx0 = gy * x1       gx1 = gy * x0
//   div:  gx0 = gy / x1       gx1 = -gy * x0 / x1^2

#[derive(Default)]
struct BinaryShapes {
    lhs: Shape,
    rhs: Shape,
}

impl BinaryShapes {
    fn save(&mut self, xs: &[Tensor]) {
        self.lhs = xs[0].shape().clone();
        self.rhs = xs[1].shape().clone();
    }

    fn reduce(&self, g0: Variable, g1: Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![
            Some(reduce_to(g0, &self.lhs)?),
            Some(reduce_to(g1, &self.rhs)?),
        ])
    }
}

#[derive(Default)]
struct Add(BinaryShapes);

impl Function for Add {
    fn name(&self) -> &'static str {
        "add"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.0.save(xs);
        xs[0].add(&xs[1])
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        self.0.reduce(gy.clone(), gy.clone())
    }
}

#[derive(Default)]
struct Sub(BinaryShapes);

impl Function for Sub {
    fn name(&self) -> &'static str {
        "sub"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.0.save(xs);
        xs[0].sub(&xs[1])
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        self.0.reduce(gy.clone(), neg(gy)?)
    }
}

#[derive(Default)]
struct Mul(BinaryShapes);

impl Function for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.0.save(xs);
        xs[0].mul(&xs[1])
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x0, x1) = (ctx.input(0), ctx.input(1));
        self.0.reduce(mul(gy, x1)?, mul(gy, x0)?)
    }
}

#[derive(Default)]
struct Div(BinaryShapes);

impl Function for Div {
    fn name(&self) -> &'static str {
        "div"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        self.0.save(xs);
        xs[0].div(&xs[1])
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let (x0, x1) = (ctx.input(0), ctx.input(1));
        let gx0 = div(gy, x1)?;
        let gx1 = neg(&div(&mul(gy, x0)?, &square(x1)?)?)?;
        self.0.reduce(gx0, gx1)
    }
}

struct Neg;

impl Function for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        Ok(xs[0].neg())
    }

    fn backward(&self, _ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        Ok(vec![Some(neg(gy)?)])
    }
}

struct Square;

impl Function for Square {
    fn name(&self) -> &'static str {
        "square"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        Ok(xs[0].square())
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let gx = mul_scalar(&mul(gy, ctx.input(0))?, 2.0)?;
        Ok(vec![Some(gx)])
    }
}

/// `x ** c` for a constant exponent.
struct Pow {
    c: f32,
}

impl Function for Pow {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn forward(&mut self, xs: &[Tensor]) -> Result<Tensor> {
        xs[0].powf(self.c)
    }

    fn backward(&self, ctx: &BackwardCtx<'_>, gy: &Variable) -> Result<Vec<Option<Variable>>> {
        let gx = mul(gy, &mul_scalar(&pow(ctx.input(0), self.c - 1.0)?, self.c)?)?;
        Ok(vec![Some(gx)])
    }
}

pub fn add(a: &Variable, b: &Variable) -> Result<Variable> {
    apply(Add::default(), &[a, b])
}

pub fn sub(a: &Variable, b: &Variable) -> Result<Variable> {
    apply(Sub::default(), &[a, b])
}

pub fn mul(a: &Variable, b: &Variable) -> Result<Variable> {
    apply(Mul::default(), &[a, b])
}

/// Fails with `DivisionByZero` if any (broadcast) divisor element is zero.
pub fn div(a: &Variable, b: &Variable) -> Result<Variable> {
    apply(Div::default(), &[a, b])
}

pub fn neg(x: &Variable) -> Result<Variable> {
    apply(Neg, &[x])
}

pub fn square(x: &Variable) -> Result<Variable> {
    apply(Square, &[x])
}

pub fn pow(x: &Variable, c: f32) -> Result<Variable> {
    apply(Pow { c }, &[x])
}

// Scalar forms broadcast a constant, which receives no gradient.

pub fn add_scalar(x: &Variable, c: f32) -> Result<Variable> {
    add(x, &constant(Tensor::scalar(c)))
}

pub fn sub_scalar(x: &Variable, c: f32) -> Result<Variable> {
    sub(x, &constant(Tensor::scalar(c)))
}

/// `c - x`
pub fn rsub_scalar(x: &Variable, c: f32) -> Result<Variable> {
    sub(&constant(Tensor::scalar(c)), x)
}

pub fn mul_scalar(x: &Variable, c: f32) -> Result<Variable> {
    mul(x, &constant(Tensor::scalar(c)))
}

pub fn div_scalar(x: &Variable, c: f32) -> Result<Variable> {
    div(x, &constant(Tensor::scalar(c)))
}

/// `c / x`
pub fn rdiv_scalar(x: &Variable, c: f32) -> Result<Variable> {
    div(&constant(Tensor::scalar(c)), x)
}

// Operators. They return Result because every op can fail on shapes:
//
//   let y = (&(&x * &w)? + 1.0)?;

macro_rules! bin_trait {
    ($trait:ident, $method:ident, $func:ident, $scalar:ident) => {
        impl ops::$trait<&Variable> for &Variable {
            type Output = Result<Variable>;

            fn $method(self, rhs: &Variable) -> Result<Variable> {
                $func(self, rhs)
            }
        }

        impl ops::$trait<f32> for &Variable {
            type Output = Result<Variable>;

            fn $method(self, rhs: f32) -> Result<Variable> {
                $scalar(self, rhs)
            }
        }
    };
}

bin_trait!(Add, add, add, add_scalar);
bin_trait!(Sub, sub, sub, sub_scalar);
bin_trait!(Mul, mul, mul, mul_scalar);
bin_trait!(Div, div, div, div_scalar);

impl ops::Neg for &Variable {
    type Output = Result<Variable>;

    fn neg(self) -> Result<Variable> {
        neg(self)
    }
}

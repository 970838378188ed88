use std::fmt;

use crate::error::{Error, Result};

// Shape: N-dimensional extent of a tensor
//
//   Scalar: Shape([])          0 dimensions, 1 element
//   Vector: Shape([5])         1 dimension, 5 elements
//   Matrix: Shape([3, 4])      2 dimensions, 12 elements
//
// The shape determines the element count, the default row-major strides and
// broadcast compatibility. Broadcasting right-aligns two shapes, pads the
// shorter one with leading 1s, and requires every axis pair to be equal or
// to contain a 1.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape `[]` has 1 element; any
    /// zero-sized axis makes the count 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major (C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// Examples:
    ///   [3, 4] and [4]       -> [3, 4]
    ///   [2, 1] and [1, 3]    -> [2, 3]
    ///   [5, 3, 1] and [3, 4] -> [5, 3, 4]
    ///   [3] and [4]          -> ShapeMismatch
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::shape_mismatch(lhs, rhs));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Whether `self` can be broadcast to `target` (one-directional: only
    /// `self`'s axes may be expanded).
    pub fn broadcastable_to(&self, target: &Shape) -> bool {
        let s = self.dims();
        let t = target.dims();
        if s.len() > t.len() {
            return false;
        }
        let offset = t.len() - s.len();
        s.iter()
            .enumerate()
            .all(|(i, &d)| d == t[i + offset] || d == 1)
    }

    /// Axes of `self` (rank >= target rank) that must be summed to reduce a
    /// broadcast result back to `target`, plus the number of leading axes
    /// that do not exist in `target`.
    ///
    /// Returns `ShapeMismatch` when `target` does not broadcast to `self`.
    pub fn sum_to_axes(&self, target: &Shape) -> Result<(Vec<usize>, usize)> {
        if !target.broadcastable_to(self) {
            return Err(Error::shape_mismatch(target, self));
        }
        let lead = self.rank() - target.rank();
        let mut axes: Vec<usize> = (0..lead).collect();
        for (i, &d) in target.dims().iter().enumerate() {
            if d == 1 && self.0[i + lead] != 1 {
                axes.push(i + lead);
            }
        }
        Ok((axes, lead))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let callers write `Tensor::zeros((3, 4))` instead of building a Vec.

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn test_zero_sized_axis() {
        assert_eq!(Shape::from((3, 0)).elem_count(), 0);
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::from((5, 3, 1));
        let b = Shape::from((3, 4));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap().dims(), &[5, 3, 4]);

        let err = Shape::broadcast_shape(&Shape::from(3), &Shape::from(4));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sum_to_axes() {
        let big = Shape::from((2, 3, 4));
        let (axes, lead) = big.sum_to_axes(&Shape::from((3, 1))).unwrap();
        assert_eq!(axes, vec![0, 2]);
        assert_eq!(lead, 1);
        assert!(big.sum_to_axes(&Shape::from(5)).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}

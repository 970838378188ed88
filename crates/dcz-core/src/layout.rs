use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: how a logical shape maps onto flat storage
//
// A layout is shape + strides + offset. Views (transpose, permute, slice,
// broadcast, reshape of a dense layout) only build a new Layout over the same
// buffer; no element moves.
//
//   transpose: swap shape and strides entries
//     [2,3] strides [3,1] -> [3,2] strides [1,3]
//   slice: shrink one axis and advance the offset
//     [4,6] slice(dim=1, 2..5) -> [4,3], offset += 2 * stride[1]
//   broadcast: stride 0 on every expanded axis, so one element is read many
//     times

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Where this view's first element lives in the storage buffer.
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        debug_assert_eq!(shape.rank(), strides.len());
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major strides with no gaps, ignoring extent-1 axes whose stride is
    /// never used. The offset may be non-zero (e.g. a slice along axis 0).
    pub fn is_dense(&self) -> bool {
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&d, (&s, &e))| d <= 1 || s == e)
    }

    /// Dense and starting at the beginning of the buffer.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.is_dense()
    }

    /// Reorder axes: output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if axes.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: axes.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &a in axes {
            if a >= rank {
                return Err(Error::DimOutOfRange { dim: a, rank });
            }
            if seen[a] {
                return Err(Error::msg(format!("permute: axis {a} repeated in {axes:?}")));
            }
            seen[a] = true;
        }
        let dims: Vec<usize> = axes.iter().map(|&a| self.dims()[a]).collect();
        let strides: Vec<usize> = axes.iter().map(|&a| self.strides[a]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Half-open sub-range `start..end` of one axis.
    pub fn slice(&self, dim: usize, start: usize, end: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let size = self.dims()[dim];
        if end > size {
            return Err(Error::IndexOutOfRange {
                index: end,
                dim,
                size,
            });
        }
        if start > end {
            return Err(Error::IndexOutOfRange {
                index: start,
                dim,
                size: end,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[dim] = end - start;
        let new_offset = self.offset + start * self.strides[dim];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// Select position `index` of axis 0 and drop that axis.
    pub fn select_first(&self, index: usize) -> Result<Layout> {
        if self.rank() == 0 {
            return Err(Error::DimOutOfRange { dim: 0, rank: 0 });
        }
        let size = self.dims()[0];
        if index >= size {
            return Err(Error::IndexOutOfRange {
                index,
                dim: 0,
                size,
            });
        }
        Ok(Layout::new(
            Shape::new(self.dims()[1..].to_vec()),
            self.strides[1..].to_vec(),
            self.offset + index * self.strides[0],
        ))
    }

    /// View this layout with a broadcast target shape. Expanded axes get
    /// stride 0. Fails with `ShapeMismatch` if the shapes are incompatible.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        if !self.shape.broadcastable_to(target) {
            return Err(Error::shape_mismatch(target, &self.shape));
        }
        let lead = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for (i, &d) in self.dims().iter().enumerate() {
            if d == target.dims()[i + lead] {
                strides[i + lead] = self.strides[i];
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Zero-copy reshape; `None` when the layout is not dense.
    pub fn reshape_view(&self, shape: &Shape) -> Option<Layout> {
        if !self.is_dense() {
            return None;
        }
        Some(Layout::new(
            shape.clone(),
            shape.stride_contiguous(),
            self.offset,
        ))
    }

    /// flat_index = offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Storage index of every element, in logical (row-major) order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter: flat storage indices of a layout in logical order
//
// For a contiguous layout this counts offset, offset+1, ...; for a transposed
// or broadcast layout it follows the strides.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        self.current
            .iter()
            .zip(self.strides.iter())
            .fold(self.offset, |acc, (&i, &s)| acc + i * s)
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        // [[0, 1, 2],
        //  [3, 4, 5]] read column-major
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let transposed = layout.permute(&[1, 0]).unwrap();
        assert_eq!(transposed.strides(), &[1, 3]);
        assert!(!transposed.is_contiguous());
        let indices: Vec<usize> = transposed.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_permute() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        let p = layout.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        assert_eq!(p.strides(), &[1, 12, 4]);
        assert!(layout.permute(&[0, 0, 1]).is_err());
        assert!(layout.permute(&[0, 1]).is_err());
    }

    #[test]
    fn test_slice() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let s = layout.slice(1, 2, 5).unwrap();
        assert_eq!(s.dims(), &[4, 3]);
        assert_eq!(s.offset(), 2);
        assert_eq!(s.strides(), &[6, 1]);
        assert!(!s.is_dense());

        let rows = layout.slice(0, 1, 3).unwrap();
        assert!(rows.is_dense());
        assert!(!rows.is_contiguous());
    }

    #[test]
    fn test_slice_out_of_range() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        assert!(matches!(
            layout.slice(1, 5, 8),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(layout.slice(1, 4, 3).is_err());
    }

    #[test]
    fn test_broadcast_as() {
        let layout = Layout::contiguous(Shape::from((3, 1)));
        let b = layout.broadcast_as(&Shape::from((2, 3, 4))).unwrap();
        assert_eq!(b.strides(), &[0, 1, 0]);
        let indices: Vec<usize> = b.strided_indices().take(5).collect();
        assert_eq!(indices, vec![0, 0, 0, 0, 1]);
        assert!(layout.broadcast_as(&Shape::from((2, 4))).is_err());
    }

    #[test]
    fn test_select_first() {
        let layout = Layout::contiguous(Shape::from((3, 4)));
        let row = layout.select_first(2).unwrap();
        assert_eq!(row.dims(), &[4]);
        assert_eq!(row.offset(), 8);
        assert!(layout.select_first(3).is_err());
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3]), 23);
    }
}

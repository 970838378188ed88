use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::backend::{self, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor: strided N-dimensional buffer
//
// A Tensor is a handle: a shared buffer plus a Layout that says which
// elements of that buffer it sees and in what order.
//
// MEMORY MODEL:
//
//   The buffer lives in Arc<RwLock<Vec<T>>>. Cloning a Tensor, reshaping a
//   dense one, transposing, slicing and broadcasting all return new handles
//   over the same buffer. Writes (`set`, `fill`, `map_inplace`,
//   `zip_assign`) take the write lock and go through the handle's own
//   layout, so they are visible through every view that aliases the written
//   positions. `contiguous()` is the way out: it always copies into a fresh
//   buffer.
//
// COMPUTE:
//
//   Every operation that produces new values returns a fresh contiguous
//   tensor. Operands are densified first (broadcast views are materialised)
//   and the dense slices go to the active kernel backend, so kernels never
//   see strides.
//
// ELEMENT TYPES:
//
//   Structural operations are generic over T: WithDType. Arithmetic,
//   reductions and matmul exist for the f32 reference type; the integer
//   path (argmax, pooling indices, labels) uses Tensor<i64>.

/// An n-dimensional strided array.
pub struct Tensor<T: WithDType = f32> {
    storage: Arc<RwLock<Vec<T>>>,
    layout: Layout,
}

impl<T: WithDType> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout: self.layout.clone(),
        }
    }
}

impl<T: WithDType> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let values = self.to_vec();
        write!(f, "Tensor(shape={}, dtype={}, data=", self.shape(), T::DTYPE)?;
        if values.len() > PREVIEW {
            write!(f, "{:?} ...)", &values[..PREVIEW])
        } else {
            write!(f, "{:?})", values)
        }
    }
}

impl<T: WithDType> Tensor<T> {
    // Internal constructors

    fn from_owned(data: Vec<T>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.elem_count());
        Tensor {
            storage: Arc::new(RwLock::new(data)),
            layout: Layout::contiguous(shape),
        }
    }

    /// A new handle on the same buffer.
    fn view(&self, layout: Layout) -> Self {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout,
        }
    }

    // A panic while holding the lock cannot leave the buffer with anything
    // but valid elements, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Creation

    /// Build a tensor of any element type from row-major data.
    pub fn from_data(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_owned(data, shape))
    }

    /// A tensor with every element set to `value`.
    pub fn filled(shape: impl Into<Shape>, value: T) -> Self {
        let shape = shape.into();
        Self::from_owned(vec![value; shape.elem_count()], shape)
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether both handles read and write the same buffer.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Elements in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<T> {
        let data = self.read();
        if self.layout.is_dense() {
            let start = self.layout.offset();
            data[start..start + self.elem_count()].to_vec()
        } else {
            self.layout.strided_indices().map(|i| data[i]).collect()
        }
    }

    /// The single element of a one-element tensor.
    pub fn to_scalar(&self) -> Result<T> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let data = self.read();
        Ok(data[self.layout.offset()])
    }

    fn checked_flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (dim, (&i, &size)) in index.iter().zip(self.dims()).enumerate() {
            if i >= size {
                return Err(Error::IndexOutOfRange {
                    index: i,
                    dim,
                    size,
                });
            }
        }
        Ok(self.layout.flat_index(index))
    }

    pub fn get(&self, index: &[usize]) -> Result<T> {
        let flat = self.checked_flat_index(index)?;
        Ok(self.read()[flat])
    }

    /// Write one element. Visible through every view sharing the buffer.
    pub fn set(&self, index: &[usize], value: T) -> Result<()> {
        let flat = self.checked_flat_index(index)?;
        self.write()[flat] = value;
        Ok(())
    }

    /// Overwrite every element this view covers.
    pub fn fill(&self, value: T) {
        let mut data = self.write();
        for i in self.layout.strided_indices() {
            data[i] = value;
        }
    }

    /// Apply `f` to every element this view covers, in place.
    pub fn map_inplace(&self, f: impl Fn(T) -> T) {
        let mut data = self.write();
        for i in self.layout.strided_indices() {
            data[i] = f(data[i]);
        }
    }

    /// `self[i] = f(self[i], src[i])` in place, with `src` broadcast to this
    /// view's shape. `src` is read in full before the write lock is taken,
    /// so it may alias `self`.
    pub fn zip_assign(&self, src: &Tensor<T>, f: impl Fn(T, T) -> T) -> Result<()> {
        let values = if src.shape() == self.shape() {
            src.to_vec()
        } else {
            src.broadcast_to(self.shape().clone())?.to_vec()
        };
        let mut data = self.write();
        for (i, v) in self.layout.strided_indices().zip(values) {
            data[i] = f(data[i], v);
        }
        Ok(())
    }

    /// Elementwise conversion into a new tensor.
    pub fn map<U: WithDType>(&self, f: impl Fn(T) -> U) -> Tensor<U> {
        let data = self.to_vec().into_iter().map(f).collect();
        Tensor::from_owned(data, self.shape().clone())
    }

    /// Numeric conversion between element types.
    pub fn cast<U: WithDType>(&self) -> Tensor<U> {
        self.map(|v| U::from_f64(v.to_f64()))
    }

    // Views and copies

    /// Always copies into a fresh, densely strided buffer.
    pub fn contiguous(&self) -> Self {
        Self::from_owned(self.to_vec(), self.shape().clone())
    }

    /// Same elements, new shape. Zero-copy when the layout is dense,
    /// otherwise the data is copied first.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        match self.layout.reshape_view(&shape) {
            Some(layout) => Ok(self.view(layout)),
            None => Ok(Self::from_owned(self.to_vec(), shape)),
        }
    }

    /// Reorder axes. An empty `axes` reverses all of them.
    pub fn transpose(&self, axes: &[usize]) -> Result<Self> {
        if axes.is_empty() {
            let reversed: Vec<usize> = (0..self.rank()).rev().collect();
            return self.permute(&reversed);
        }
        self.permute(axes)
    }

    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        Ok(self.view(self.layout.permute(axes)?))
    }

    /// View of `start..end` along `dim`.
    pub fn slice(&self, dim: usize, start: usize, end: usize) -> Result<Self> {
        Ok(self.view(self.layout.slice(dim, start, end)?))
    }

    /// View of position `i` of axis 0, with that axis removed.
    pub fn index(&self, i: usize) -> Result<Self> {
        Ok(self.view(self.layout.select_first(i)?))
    }

    /// Stride-0 view with the target shape.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        Ok(self.view(self.layout.broadcast_as(&shape)?))
    }

    /// Join tensors along `axis`. All other extents must agree.
    pub fn concat(tensors: &[Self], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("concat: empty tensor list"))?;
        let rank = first.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { dim: axis, rank });
        }
        for t in &tensors[1..] {
            if t.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: t.rank(),
                });
            }
            let agrees = (0..rank).all(|d| d == axis || t.dims()[d] == first.dims()[d]);
            if !agrees {
                return Err(Error::shape_mismatch(first.shape(), t.shape()));
            }
        }

        let mut out_dims = first.dims().to_vec();
        out_dims[axis] = tensors.iter().map(|t| t.dims()[axis]).sum();
        let out_shape = Shape::new(out_dims);
        let outer: usize = first.dims()[..axis].iter().product();

        let parts: Vec<(Vec<T>, usize)> = tensors
            .iter()
            .map(|t| {
                let block: usize = t.dims()[axis..].iter().product();
                (t.to_vec(), block)
            })
            .collect();
        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for (data, block) in &parts {
                out.extend_from_slice(&data[o * block..(o + 1) * block]);
            }
        }
        Ok(Self::from_owned(out, out_shape))
    }
}

// Float math on the f32 reference type

impl Tensor<f32> {
    // Creation

    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_data(data, shape)
    }

    pub fn from_slice(data: &[f32], shape: impl Into<Shape>) -> Result<Self> {
        Self::from_data(data.to_vec(), shape)
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn ones(shape: impl Into<Shape>) -> Self {
        Self::filled(shape, 1.0)
    }

    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        Self::filled(shape, value)
    }

    /// 0-d tensor.
    pub fn scalar(value: f32) -> Self {
        Self::filled((), value)
    }

    pub fn zeros_like(other: &Self) -> Self {
        Self::zeros(other.shape().clone())
    }

    pub fn ones_like(other: &Self) -> Self {
        Self::ones(other.shape().clone())
    }

    /// `[0, 1, ..., n-1]`
    pub fn arange(n: usize) -> Self {
        Self::from_owned((0..n).map(|i| i as f32).collect(), Shape::from(n))
    }

    /// Uniform samples in `[0, 1)` drawn from `rng`.
    pub fn rand_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Self {
        let shape = shape.into();
        let data = (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect();
        Self::from_owned(data, shape)
    }

    /// Standard normal samples drawn from `rng`.
    pub fn randn_with<R: Rng + ?Sized>(shape: impl Into<Shape>, rng: &mut R) -> Self {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self::from_owned(data, shape)
    }

    pub fn rand(shape: impl Into<Shape>) -> Self {
        Self::rand_with(shape, &mut rand::thread_rng())
    }

    pub fn randn(shape: impl Into<Shape>) -> Self {
        Self::randn_with(shape, &mut rand::thread_rng())
    }

    pub fn rand_seeded(shape: impl Into<Shape>, seed: u64) -> Self {
        Self::rand_with(shape, &mut StdRng::seed_from_u64(seed))
    }

    pub fn randn_seeded(shape: impl Into<Shape>, seed: u64) -> Self {
        Self::randn_with(shape, &mut StdRng::seed_from_u64(seed))
    }

    // Elementwise binary

    /// Densify `self` as seen through the broadcast `shape`.
    fn dense_as(&self, shape: &Shape) -> Result<Vec<f32>> {
        if self.shape() == shape {
            Ok(self.to_vec())
        } else {
            Ok(self.broadcast_to(shape.clone())?.to_vec())
        }
    }

    /// NumPy-style broadcasting elementwise op.
    pub fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self> {
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_data = self.dense_as(&out_shape)?;
        let rhs_data = rhs.dense_as(&out_shape)?;
        if op == BinaryOp::Div {
            if let Some(position) = rhs_data.iter().position(|&v| v == 0.0) {
                return Err(Error::DivisionByZero { position });
            }
        }
        let mut out = vec![0.0f32; out_shape.elem_count()];
        backend::current().binary(op, &lhs_data, &rhs_data, &mut out);
        Ok(Self::from_owned(out, out_shape))
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// Fails with `DivisionByZero` if any (broadcast) divisor element is 0.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn pow(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Pow, rhs)
    }

    pub fn maximum(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Maximum, rhs)
    }

    pub fn powf(&self, exponent: f32) -> Result<Self> {
        self.binary(BinaryOp::Pow, &Self::scalar(exponent))
    }

    pub fn add_scalar(&self, c: f32) -> Result<Self> {
        self.binary(BinaryOp::Add, &Self::scalar(c))
    }

    pub fn mul_scalar(&self, c: f32) -> Result<Self> {
        self.binary(BinaryOp::Mul, &Self::scalar(c))
    }

    /// `self * mul + add`
    pub fn affine(&self, mul: f32, add: f32) -> Result<Self> {
        self.mul_scalar(mul)?.add_scalar(add)
    }

    // Elementwise unary

    pub fn unary(&self, op: UnaryOp) -> Self {
        let input = self.to_vec();
        let mut out = vec![0.0f32; input.len()];
        backend::current().unary(op, &input, &mut out);
        Self::from_owned(out, self.shape().clone())
    }

    pub fn neg(&self) -> Self {
        self.unary(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Self {
        self.unary(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Self {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Self {
        self.unary(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Self {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Self {
        self.unary(UnaryOp::Square)
    }

    pub fn sin(&self) -> Self {
        self.unary(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Self {
        self.unary(UnaryOp::Cos)
    }

    pub fn tanh(&self) -> Self {
        self.unary(UnaryOp::Tanh)
    }

    pub fn sigmoid(&self) -> Self {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn relu(&self) -> Self {
        self.unary(UnaryOp::Relu)
    }

    pub fn clamp(&self, min: f32, max: f32) -> Self {
        self.map(|v| v.clamp(min, max))
    }

    /// 1.0 where `self > c`, else 0.0.
    pub fn gt_scalar(&self, c: f32) -> Self {
        self.map(|v| if v > c { 1.0 } else { 0.0 })
    }

    // Reductions

    /// Reduce over `axes` (all axes when empty). Accumulates in f64, visiting
    /// each output slot's inputs left to right along the reduced axes.
    pub fn reduce(&self, op: ReduceOp, axes: &[usize], keepdims: bool) -> Result<Self> {
        let rank = self.rank();
        let mut reduced = vec![axes.is_empty(); rank];
        for &a in axes {
            if a >= rank {
                return Err(Error::DimOutOfRange { dim: a, rank });
            }
            reduced[a] = true;
        }

        let kept = Shape::new(
            self.dims()
                .iter()
                .zip(&reduced)
                .map(|(&d, &r)| if r { 1 } else { d })
                .collect(),
        );
        let count: usize = self
            .dims()
            .iter()
            .zip(&reduced)
            .filter(|(_, r)| **r)
            .map(|(&d, _)| d)
            .product();
        if count == 0 && matches!(op, ReduceOp::Max | ReduceOp::Min) {
            return Err(Error::msg(format!(
                "{op:?} over an empty axis of {}",
                self.shape()
            )));
        }

        // Output slot of each input element: kept strides, 0 on reduced axes.
        let kept_strides = kept.stride_contiguous();
        let slot_strides = (0..rank)
            .map(|i| if reduced[i] { 0 } else { kept_strides[i] })
            .collect();
        let slots = Layout::new(self.shape().clone(), slot_strides, 0);

        let init = match op {
            ReduceOp::Sum | ReduceOp::Mean => 0.0f64,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        };
        let mut acc = vec![init; kept.elem_count()];
        for (v, slot) in self.to_vec().into_iter().zip(slots.strided_indices()) {
            let v = v as f64;
            let a = &mut acc[slot];
            match op {
                ReduceOp::Sum | ReduceOp::Mean => *a += v,
                ReduceOp::Max => {
                    if v > *a || v.is_nan() {
                        *a = v
                    }
                }
                ReduceOp::Min => {
                    if v < *a || v.is_nan() {
                        *a = v
                    }
                }
            }
        }
        if op == ReduceOp::Mean {
            let n = count as f64;
            acc.iter_mut().for_each(|a| *a /= n);
        }

        let out_shape = if keepdims {
            kept
        } else {
            Shape::new(
                self.dims()
                    .iter()
                    .zip(&reduced)
                    .filter(|(_, r)| !**r)
                    .map(|(&d, _)| d)
                    .collect(),
            )
        };
        Ok(Self::from_owned(
            acc.into_iter().map(|a| a as f32).collect(),
            out_shape,
        ))
    }

    pub fn sum(&self, axes: &[usize], keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Sum, axes, keepdims)
    }

    pub fn mean(&self, axes: &[usize], keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Mean, axes, keepdims)
    }

    pub fn max(&self, axes: &[usize], keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Max, axes, keepdims)
    }

    pub fn min(&self, axes: &[usize], keepdims: bool) -> Result<Self> {
        self.reduce(ReduceOp::Min, axes, keepdims)
    }

    /// Sum of every element as a 0-d tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce(ReduceOp::Sum, &[], false)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce(ReduceOp::Mean, &[], false)
    }

    /// Index of the first maximum along `axis`; the axis is removed.
    pub fn argmax(&self, axis: usize) -> Result<Tensor<i64>> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { dim: axis, rank });
        }
        let len = self.dims()[axis];
        if len == 0 {
            return Err(Error::msg(format!(
                "argmax over empty axis {axis} of {}",
                self.shape()
            )));
        }
        let perm: Vec<usize> = (0..rank)
            .filter(|&d| d != axis)
            .chain(std::iter::once(axis))
            .collect();
        let rows = self.permute(&perm)?.to_vec();
        let out: Vec<i64> = rows
            .chunks(len)
            .map(|row| {
                let mut best = 0;
                for (i, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = i;
                    }
                }
                best as i64
            })
            .collect();
        let mut out_dims = self.dims().to_vec();
        out_dims.remove(axis);
        Tensor::from_data(out, out_dims)
    }

    /// Sum a broadcast result back down to `shape` (adjoint of
    /// `broadcast_to`).
    pub fn sum_to(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        let (axes, _) = self.shape().sum_to_axes(&shape)?;
        if axes.is_empty() {
            return self.reshape(shape);
        }
        self.sum(&axes, true)?.reshape(shape)
    }

    // Linear algebra

    /// Batched matrix product over the last two axes. Leading batch axes
    /// broadcast like elementwise ops.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let (ld, rd) = (self.dims(), rhs.dims());
        let (m, k1) = (ld[ld.len() - 2], ld[ld.len() - 1]);
        let (k2, n) = (rd[rd.len() - 2], rd[rd.len() - 1]);
        if k1 != k2 {
            return Err(Error::InnerDimMismatch { m, k1, k2, n });
        }
        let k = k1;

        let lhs_batch = Shape::new(ld[..ld.len() - 2].to_vec());
        let rhs_batch = Shape::new(rd[..rd.len() - 2].to_vec());
        let batch = Shape::broadcast_shape(&lhs_batch, &rhs_batch)?;

        let with_matrix = |rows: usize, cols: usize| {
            let mut dims = batch.dims().to_vec();
            dims.push(rows);
            dims.push(cols);
            Shape::new(dims)
        };
        let a = self.dense_as(&with_matrix(m, k))?;
        let b = rhs.dense_as(&with_matrix(k, n))?;

        let out_shape = with_matrix(m, n);
        let mut out = vec![0.0f32; out_shape.elem_count()];
        let kernels = backend::current();
        for i in 0..batch.elem_count() {
            kernels.gemm(
                &a[i * m * k..(i + 1) * m * k],
                &b[i * k * n..(i + 1) * k * n],
                &mut out[i * m * n..(i + 1) * m * n],
                m,
                k,
                n,
            );
        }
        Ok(Self::from_owned(out, out_shape))
    }

    // Indexing helpers

    /// Scatter-add `src` into the sub-tensor reached by indexing axis 0
    /// successively with `path`. Mutates `self` in place.
    pub fn add_at(&self, path: &[usize], src: &Self) -> Result<()> {
        let mut target = self.clone();
        for &i in path {
            target = target.index(i)?;
        }
        target.zip_assign(src, |a, b| a + b)
    }

    /// Nearest-neighbour upsampling of the two trailing axes of a 4-D tensor.
    pub fn upsample_nearest(&self, scale: usize) -> Result<Self> {
        if self.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            });
        }
        let (n, c, h, w) = (self.dims()[0], self.dims()[1], self.dims()[2], self.dims()[3]);
        self.reshape(vec![n, c, h, 1, w, 1])?
            .broadcast_to(vec![n, c, h, scale, w, scale])?
            .reshape((n, c, h * scale, w * scale))
    }

    /// Max absolute elementwise difference, for tests and diagnostics.
    pub fn max_abs_diff(&self, other: &Self) -> Result<f32> {
        let diff = self.sub(other)?.abs();
        Ok(diff.to_vec().into_iter().fold(0.0f32, f32::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_slice(data, shape).unwrap()
    }

    #[test]
    fn test_from_vec_checks_count() {
        assert!(matches!(
            Tensor::from_vec(vec![1.0, 2.0, 3.0], (2, 2)),
            Err(Error::ElementCountMismatch { .. })
        ));
    }

    #[test]
    fn test_broadcast_add() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        let col = t(&[1.0, 2.0], &[2, 1]);
        let row = t(&[10.0, 20.0, 30.0], &[1, 3]);
        assert_eq!(
            col.mul(&row).unwrap().to_vec(),
            vec![10.0, 20.0, 30.0, 20.0, 40.0, 60.0]
        );
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = Tensor::zeros((2, 3));
        let b = Tensor::zeros((4,));
        assert!(matches!(a.add(&b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_division_by_zero() {
        let a = t(&[1.0, 2.0], &[2]);
        let b = t(&[1.0, 0.0], &[2]);
        assert!(matches!(
            a.div(&b),
            Err(Error::DivisionByZero { position: 1 })
        ));
        let s = Tensor::scalar(0.0);
        assert!(matches!(a.div(&s), Err(Error::DivisionByZero { .. })));
    }

    #[test]
    fn test_reduce_axes() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s0 = a.sum(&[0], false).unwrap();
        assert_eq!(s0.dims(), &[3]);
        assert_eq!(s0.to_vec(), vec![5.0, 7.0, 9.0]);

        let s1 = a.sum(&[1], true).unwrap();
        assert_eq!(s1.dims(), &[2, 1]);
        assert_eq!(s1.to_vec(), vec![6.0, 15.0]);

        let all = a.sum(&[], false).unwrap();
        assert_eq!(all.rank(), 0);
        assert_eq!(all.to_scalar().unwrap(), 21.0);

        assert_eq!(a.max(&[1], false).unwrap().to_vec(), vec![3.0, 6.0]);
        assert_eq!(a.min(&[0], false).unwrap().to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(a.mean(&[0, 1], false).unwrap().to_scalar().unwrap(), 3.5);
    }

    #[test]
    fn test_reduce_transposed_view() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let at = a.transpose(&[]).unwrap();
        assert_eq!(at.sum(&[1], false).unwrap().to_vec(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_argmax() {
        let a = t(&[0.1, 0.9, 0.0, 0.7, 0.2, 0.7], &[2, 3]);
        let idx = a.argmax(1).unwrap();
        assert_eq!(idx.dtype(), DType::I64);
        assert_eq!(idx.to_vec(), vec![1, 0]);
        assert_eq!(a.argmax(0).unwrap().to_vec(), vec![1, 0, 1]);
    }

    #[test]
    fn test_matmul() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 2]);
        assert_eq!(c.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_matmul_batch_broadcast() {
        let a = Tensor::ones((3, 2, 4));
        let b = Tensor::ones((4, 5));
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[3, 2, 5]);
        assert!(c.to_vec().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = Tensor::zeros((2, 3));
        let b = Tensor::zeros((4, 2));
        assert!(matches!(
            a.matmul(&b),
            Err(Error::InnerDimMismatch {
                m: 2,
                k1: 3,
                k2: 4,
                n: 2
            })
        ));
    }

    #[test]
    fn test_matmul_of_transposed_view() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
        let at = a.transpose(&[]).unwrap();
        let c = at.matmul(&a).unwrap();
        // A^T A for A = [[1,2],[3,4],[5,6]]
        assert_eq!(c.to_vec(), vec![35.0, 44.0, 44.0, 56.0]);
    }

    #[test]
    fn test_views_share_storage() {
        let a = Tensor::arange(6).reshape((2, 3)).unwrap();
        let r = a.reshape((3, 2)).unwrap();
        let tr = a.transpose(&[]).unwrap();
        let s = a.slice(1, 1, 3).unwrap();
        assert!(r.shares_storage_with(&a));
        assert!(tr.shares_storage_with(&a));
        assert!(s.shares_storage_with(&a));

        s.set(&[1, 0], 100.0).unwrap();
        assert_eq!(a.get(&[1, 1]).unwrap(), 100.0);
        assert_eq!(tr.get(&[1, 1]).unwrap(), 100.0);

        let c = a.contiguous();
        assert!(!c.shares_storage_with(&a));
        c.fill(0.0);
        assert_eq!(a.get(&[1, 1]).unwrap(), 100.0);
    }

    #[test]
    fn test_reshape_of_non_dense_copies() {
        let a = Tensor::arange(6).reshape((2, 3)).unwrap();
        let tr = a.transpose(&[]).unwrap();
        let flat = tr.reshape(6).unwrap();
        assert!(!flat.shares_storage_with(&a));
        assert_eq!(flat.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(matches!(
            a.reshape(4),
            Err(Error::ReshapeElementMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_bounds() {
        let a = Tensor::zeros((2, 3));
        assert!(matches!(
            a.slice(1, 0, 4),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(a.get(&[2, 0]), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_sum_to() {
        let g = Tensor::ones((2, 3, 4));
        let s = g.sum_to((3, 1)).unwrap();
        assert_eq!(s.dims(), &[3, 1]);
        assert_eq!(s.to_vec(), vec![8.0, 8.0, 8.0]);
        assert!(g.sum_to((5,)).is_err());
    }

    #[test]
    fn test_concat() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&[5.0, 6.0], &[2, 1]);
        let c = Tensor::concat(&[a.clone(), b], 1).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);

        let bad = Tensor::zeros((3, 1));
        assert!(Tensor::concat(&[a, bad], 1).is_err());
    }

    #[test]
    fn test_add_at_and_upsample() {
        let z = Tensor::zeros((2, 3));
        z.add_at(&[1], &t(&[1.0, 2.0, 3.0], &[3])).unwrap();
        z.add_at(&[1], &Tensor::scalar(1.0)).unwrap();
        assert_eq!(z.to_vec(), vec![0.0, 0.0, 0.0, 2.0, 3.0, 4.0]);

        let x = t(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let up = x.upsample_nearest(2).unwrap();
        assert_eq!(up.dims(), &[1, 1, 4, 4]);
        assert_eq!(
            up.to_vec(),
            vec![
                1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0
            ]
        );
    }

    #[test]
    fn test_poisoned_storage_stays_readable() {
        let t = Tensor::ones(3);
        let held = t.clone();
        let res = std::thread::spawn(move || {
            let _guard = held.write();
            panic!("kernel failed");
        })
        .join();
        assert!(res.is_err());
        assert_eq!(t.to_vec(), vec![1.0; 3]);
        t.set(&[1], 4.0).unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 4.0, 1.0]);
    }

    #[test]
    fn test_seeded_random_is_reproducible() {
        let a = Tensor::randn_seeded((3, 3), 7);
        let b = Tensor::randn_seeded((3, 3), 7);
        assert_eq!(a.to_vec(), b.to_vec());
        let u = Tensor::rand_seeded(100, 1);
        assert!(u.to_vec().iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_integer_path() {
        let idx = Tensor::<i64>::from_data(vec![2, 0, 1], 3).unwrap();
        assert_eq!(idx.cast::<f32>().to_vec(), vec![2.0, 0.0, 1.0]);
        assert_eq!(idx.index(0).unwrap().to_scalar().unwrap(), 2);
    }
}

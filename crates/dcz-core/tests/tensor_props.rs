use dcz_core::backend::{Backend, BinaryOp, CpuBackend, UnaryOp};
use dcz_core::{Error, Shape, Tensor};
use proptest::prelude::*;

// Shapes of rank <= 3 plus a second shape that broadcasts against them:
// each dimension of the second is either the same, 1, or dropped from the
// front.
fn broadcast_pair() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    prop::collection::vec(1usize..4, 1..4).prop_flat_map(|dims| {
        let rank = dims.len();
        (
            Just(dims.clone()),
            prop::collection::vec(any::<bool>(), rank),
            0..=rank,
        )
            .prop_map(|(dims, ones, drop)| {
                let other = dims
                    .iter()
                    .zip(ones)
                    .map(|(&d, one)| if one { 1 } else { d })
                    .skip(drop)
                    .collect();
                (dims, other)
            })
    })
}

fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0; dims.len()];
    for (i, &d) in dims.iter().enumerate().rev() {
        index[i] = flat % d;
        flat /= d;
    }
    index
}

/// Index into a broadcast operand: trailing alignment, size-1 axes pinned.
fn project(index: &[usize], dims: &[usize]) -> Vec<usize> {
    let skip = index.len() - dims.len();
    index[skip..]
        .iter()
        .zip(dims)
        .map(|(&i, &d)| if d == 1 { 0 } else { i })
        .collect()
}

proptest! {
    #[test]
    fn broadcast_add_is_pointwise((a_dims, b_dims) in broadcast_pair(), seed in 0u64..1000) {
        let a = Tensor::randn_seeded(a_dims.as_slice(), seed);
        let b = Tensor::randn_seeded(b_dims.as_slice(), seed + 1);
        let c = a.add(&b).unwrap();
        prop_assert_eq!(c.dims(), a_dims.as_slice());
        // operand order does not change the result shape
        let ba = b.add(&a).unwrap();
        prop_assert_eq!(ba.dims(), a_dims.as_slice());
        for flat in 0..c.elem_count() {
            let idx = unravel(flat, &a_dims);
            let expected = a.get(&idx).unwrap() + b.get(&project(&idx, &b_dims)).unwrap();
            prop_assert_eq!(c.get(&idx).unwrap(), expected);
        }
    }

    #[test]
    fn sum_to_is_adjoint_of_broadcast_to((big, small) in broadcast_pair(), seed in 0u64..1000) {
        // <broadcast_to(x), y> == <x, sum_to(y)>
        let x = Tensor::randn_seeded(small.as_slice(), seed);
        let y = Tensor::randn_seeded(big.as_slice(), seed + 7);
        let lhs = x.broadcast_to(big.as_slice()).unwrap().mul(&y).unwrap().sum_all().unwrap();
        let rhs = x.mul(&y.sum_to(small.as_slice()).unwrap()).unwrap().sum_all().unwrap();
        let (lhs, rhs) = (lhs.to_scalar().unwrap(), rhs.to_scalar().unwrap());
        prop_assert!((lhs - rhs).abs() <= 1e-3 * lhs.abs().max(1.0), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn transpose_twice_is_identity(dims in prop::collection::vec(1usize..5, 2..5), seed in 0u64..1000) {
        let t = Tensor::randn_seeded(dims.as_slice(), seed);
        let rank = dims.len();
        let back = t.transpose(&[]).unwrap().transpose(&[]).unwrap();
        prop_assert_eq!(back.to_vec(), t.to_vec());
        let perm: Vec<usize> = (1..rank).chain(0..1).collect();
        let p = t.permute(&perm).unwrap();
        prop_assert!(p.shares_storage_with(&t));
        prop_assert_eq!(p.contiguous().reshape(p.dims()).unwrap().to_vec(), p.to_vec());
    }
}

#[test]
fn incompatible_shapes_do_not_broadcast() {
    let a = Tensor::zeros((2, 3));
    let b = Tensor::zeros((4, 3));
    assert!(matches!(a.add(&b), Err(Error::ShapeMismatch { .. })));
    assert!(Tensor::zeros(3).broadcast_to((2, 4)).is_err());
}

#[test]
fn views_alias_their_base() {
    let base = Tensor::arange(12).reshape((3, 4)).unwrap();
    let t = base.transpose(&[1, 0]).unwrap();
    let row = base.index(1).unwrap();
    let cols = base.slice(1, 1, 3).unwrap();
    for v in [&t, &row, &cols] {
        assert!(v.shares_storage_with(&base));
    }
    assert!(!t.is_contiguous());

    t.set(&[2, 1], 100.0).unwrap();
    assert_eq!(base.get(&[1, 2]).unwrap(), 100.0);
    assert_eq!(row.to_vec(), vec![4.0, 5.0, 100.0, 7.0]);
    assert_eq!(cols.get(&[1, 1]).unwrap(), 100.0);

    // a contiguous copy is detached from the base
    let copy = t.contiguous();
    assert!(!copy.shares_storage_with(&base));
    copy.set(&[0, 0], -1.0).unwrap();
    assert_eq!(base.get(&[0, 0]).unwrap(), 0.0);
}

#[test]
fn reshape_of_strided_view_keeps_order() {
    let base = Tensor::arange(6).reshape((2, 3)).unwrap();
    let t = base.transpose(&[1, 0]).unwrap();
    let flat = t.reshape(6).unwrap();
    assert_eq!(flat.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    assert_eq!(flat.shape(), &Shape::from(6));
}

#[test]
fn cpu_backend_applies_scalar_expressions() {
    let a = [1.0f32, -2.0, 3.0];
    let b = [4.0f32, 5.0, -6.0];
    let mut out = [0.0f32; 3];
    CpuBackend.binary(BinaryOp::Maximum, &a, &b, &mut out);
    assert_eq!(out, [4.0, 5.0, 3.0]);
    CpuBackend.unary(UnaryOp::Relu, &a, &mut out);
    assert_eq!(out, [1.0, 0.0, 3.0]);
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use dcz_core::backend::RayonBackend;

    #[test]
    fn rayon_matches_cpu_bit_for_bit() {
        let n = 10_000;
        let a = Tensor::randn_seeded(n, 1).to_vec();
        let b = Tensor::rand_seeded(n, 2).to_vec();

        for op in [BinaryOp::Add, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Maximum] {
            let mut cpu = vec![0.0; n];
            let mut par = vec![0.0; n];
            CpuBackend.binary(op, &a, &b, &mut cpu);
            RayonBackend.binary(op, &a, &b, &mut par);
            assert_eq!(cpu.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
                       par.iter().map(|v| v.to_bits()).collect::<Vec<_>>(), "{op:?}");
        }
        for op in [UnaryOp::Exp, UnaryOp::Tanh, UnaryOp::Sigmoid] {
            let mut cpu = vec![0.0; n];
            let mut par = vec![0.0; n];
            CpuBackend.unary(op, &a, &mut cpu);
            RayonBackend.unary(op, &a, &mut par);
            assert_eq!(cpu, par, "{op:?}");
        }

        let (m, k, p) = (37, 23, 19);
        let x = Tensor::randn_seeded(m * k, 3).to_vec();
        let y = Tensor::randn_seeded(k * p, 4).to_vec();
        let mut cpu = vec![0.0; m * p];
        let mut par = vec![0.0; m * p];
        CpuBackend.gemm(&x, &y, &mut cpu, m, k, p);
        RayonBackend.gemm(&x, &y, &mut par, m, k, p);
        assert_eq!(cpu, par);
    }
}

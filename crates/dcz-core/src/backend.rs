use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, Result};

// Backend: swappable dense f32 kernels
//
// The tensor engine does all the shape work (broadcasting, strides, batch
// loops) and hands a backend nothing but dense, equally sized slices. A
// backend is therefore a pure performance substitution: every
// implementation evaluates each output element with the same scalar
// expression in the same order, so swapping backends never changes a bit of
// the result.
//
// CpuBackend is the portable reference and is always available. With the
// `parallel` feature, RayonBackend splits the same loops across rayon
// workers. The active backend is process-wide and starts from the
// DCZ_BACKEND environment variable ("cpu" or "rayon").

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Square,
    Sin,
    Cos,
    Tanh,
    Sigmoid,
    Relu,
}

/// Reduction operations along axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl BinaryOp {
    /// The scalar expression every backend must use for this op.
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Maximum => {
                if a >= b {
                    a
                } else {
                    b
                }
            }
        }
    }
}

impl UnaryOp {
    /// The scalar expression every backend must use for this op.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tanh => x.tanh(),
            // tanh form stays finite for large |x|
            UnaryOp::Sigmoid => (x * 0.5).tanh() * 0.5 + 0.5,
            UnaryOp::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
        }
    }
}

/// Dense kernel strategy. All slices are contiguous and already validated
/// by the caller: `lhs`, `rhs` and `out` have equal length, and gemm
/// operands are exactly `m*k`, `k*n` and `m*n` long.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `out[i] = op(lhs[i], rhs[i])`
    fn binary(&self, op: BinaryOp, lhs: &[f32], rhs: &[f32], out: &mut [f32]);

    /// `out[i] = op(input[i])`
    fn unary(&self, op: UnaryOp, input: &[f32], out: &mut [f32]);

    /// `c = a @ b` for row-major `a: [m, k]`, `b: [k, n]`, `c: [m, n]`.
    /// `c` is overwritten.
    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize);
}

/// One row of `c = a @ b`. Accumulates over `k` in order starting from zero,
/// walking `b` row by row for cache locality.
#[inline]
fn gemm_row(a_row: &[f32], b: &[f32], c_row: &mut [f32], k: usize, n: usize) {
    c_row.iter_mut().for_each(|v| *v = 0.0);
    for p in 0..k {
        let a_ip = a_row[p];
        let b_row = &b[p * n..(p + 1) * n];
        for (c, &bv) in c_row.iter_mut().zip(b_row.iter()) {
            *c += a_ip * bv;
        }
    }
}

/// Portable single-threaded reference backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn binary(&self, op: BinaryOp, lhs: &[f32], rhs: &[f32], out: &mut [f32]) {
        for ((o, &a), &b) in out.iter_mut().zip(lhs).zip(rhs) {
            *o = op.apply(a, b);
        }
    }

    fn unary(&self, op: UnaryOp, input: &[f32], out: &mut [f32]) {
        for (o, &x) in out.iter_mut().zip(input) {
            *o = op.apply(x);
        }
    }

    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
        if n == 0 {
            return;
        }
        for i in 0..m {
            gemm_row(&a[i * k..(i + 1) * k], b, &mut c[i * n..(i + 1) * n], k, n);
        }
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::{gemm_row, Backend, BinaryOp, UnaryOp};

    /// Elements per rayon task for elementwise kernels.
    const CHUNK: usize = 4096;

    /// Data-parallel backend. Same per-element expressions as
    /// [`super::CpuBackend`], split across the rayon pool.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RayonBackend;

    impl Backend for RayonBackend {
        fn name(&self) -> &'static str {
            "rayon"
        }

        fn binary(&self, op: BinaryOp, lhs: &[f32], rhs: &[f32], out: &mut [f32]) {
            out.par_chunks_mut(CHUNK)
                .zip(lhs.par_chunks(CHUNK))
                .zip(rhs.par_chunks(CHUNK))
                .for_each(|((o, a), b)| {
                    for ((o, &a), &b) in o.iter_mut().zip(a).zip(b) {
                        *o = op.apply(a, b);
                    }
                });
        }

        fn unary(&self, op: UnaryOp, input: &[f32], out: &mut [f32]) {
            out.par_chunks_mut(CHUNK)
                .zip(input.par_chunks(CHUNK))
                .for_each(|(o, x)| {
                    for (o, &x) in o.iter_mut().zip(x) {
                        *o = op.apply(x);
                    }
                });
        }

        fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
            if n == 0 || m == 0 {
                return;
            }
            c.par_chunks_mut(n).enumerate().for_each(|(i, c_row)| {
                gemm_row(&a[i * k..(i + 1) * k], b, c_row, k, n);
            });
        }
    }
}

#[cfg(feature = "parallel")]
pub use parallel::RayonBackend;

// Backend selection

/// Which kernel backend the tensor engine dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Rayon,
}

impl BackendKind {
    /// Parse a `DCZ_BACKEND` value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "naive" => Some(BackendKind::Cpu),
            "rayon" | "parallel" => Some(BackendKind::Rayon),
            _ => None,
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Cpu => true,
            BackendKind::Rayon => cfg!(feature = "parallel"),
        }
    }
}

const UNSET: u8 = 0;
const CPU: u8 = 1;
const RAYON: u8 = 2;

static ACTIVE: AtomicU8 = AtomicU8::new(UNSET);
static CPU_BACKEND: CpuBackend = CpuBackend;
#[cfg(feature = "parallel")]
static RAYON_BACKEND: RayonBackend = RayonBackend;

/// Environment variable consulted the first time a kernel runs.
pub const BACKEND_ENV: &str = "DCZ_BACKEND";

fn kind_code(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::Cpu => CPU,
        BackendKind::Rayon => RAYON,
    }
}

fn init_from_env() -> u8 {
    let code = match std::env::var(BACKEND_ENV) {
        Ok(value) => match BackendKind::parse(&value) {
            Some(kind) if kind.is_available() => kind_code(kind),
            Some(kind) => {
                log::warn!("{BACKEND_ENV}={value}: {kind:?} backend not compiled in, using cpu");
                CPU
            }
            None => {
                log::warn!("{BACKEND_ENV}={value}: unknown backend, using cpu");
                CPU
            }
        },
        Err(_) => CPU,
    };
    // A concurrent set_backend wins over the environment.
    match ACTIVE.compare_exchange(UNSET, code, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            log::debug!("kernel backend initialised: code {code}");
            code
        }
        Err(existing) => existing,
    }
}

/// Select the kernel backend for the whole process.
///
/// Fails with `UnsupportedOperation` if the backend was not compiled in.
pub fn set_backend(kind: BackendKind) -> Result<()> {
    if !kind.is_available() {
        return Err(Error::unsupported(format!(
            "{kind:?} backend requires the `parallel` feature"
        )));
    }
    ACTIVE.store(kind_code(kind), Ordering::Release);
    log::debug!("kernel backend set to {kind:?}");
    Ok(())
}

/// The active backend kind.
pub fn current_kind() -> BackendKind {
    let mut code = ACTIVE.load(Ordering::Acquire);
    if code == UNSET {
        code = init_from_env();
    }
    if code == RAYON {
        BackendKind::Rayon
    } else {
        BackendKind::Cpu
    }
}

/// The active backend.
pub fn current() -> &'static dyn Backend {
    match current_kind() {
        #[cfg(feature = "parallel")]
        BackendKind::Rayon => &RAYON_BACKEND,
        _ => &CPU_BACKEND,
    }
}

//! Dense linear algebra and elementwise primitives.
//!
//! Every function validates its arguments on the host, then enqueues a single
//! kernel on the stream and returns without waiting. Operands are row-major.

use crossent_common::{CrossEntError, KernelError, Result};

use crate::buffer::DeviceBuffer;
use crate::stream::Stream;

pub const SET: &str = "set";
pub const COPY: &str = "copy";
pub const SCALE: &str = "scale";
pub const SCALE_BY_DEVICE: &str = "scale_by_device";
pub const EXP: &str = "exp";
pub const GEMM: &str = "gemm";
pub const GEMV: &str = "gemv";
pub const SUM: &str = "sum";

pub(crate) fn invalid(reason: impl Into<String>) -> CrossEntError {
    KernelError::InvalidArguments { reason: reason.into() }.into()
}

pub(crate) fn ensure_len<T>(name: &str, buf: &DeviceBuffer<T>, expected: usize) -> Result<()> {
    if buf.len() != expected {
        return Err(invalid(format!("{name}: expected {expected} elements, got {}", buf.len())));
    }
    Ok(())
}

pub(crate) fn ensure_distinct<T>(
    name: &str,
    out: &DeviceBuffer<T>,
    input: &DeviceBuffer<T>,
) -> Result<()> {
    if out.same_allocation(input) {
        return Err(invalid(format!("{name}: output must not alias an input")));
    }
    Ok(())
}

/// Fill `x` with `value`.
pub fn set<T>(stream: &Stream, x: &DeviceBuffer<T>, value: T) -> Result<()>
where
    T: Copy + Send + Sync + 'static,
{
    let x = x.clone();
    stream.launch(SET, move |device| {
        let mut x = x.write();
        device.for_each(&mut x, |_, v| *v = value);
    })
}

/// `dst = src`. A copy onto the same allocation is a no-op.
pub fn copy<T>(stream: &Stream, src: &DeviceBuffer<T>, dst: &DeviceBuffer<T>) -> Result<()>
where
    T: Copy + Send + Sync + 'static,
{
    ensure_len("copy dst", dst, src.len())?;
    if src.same_allocation(dst) {
        return Ok(());
    }
    let (src, dst) = (src.clone(), dst.clone());
    stream.launch(COPY, move |device| {
        let src = src.read();
        let mut dst = dst.write();
        let src: &[T] = &src;
        device.for_each(&mut dst, |i, v| *v = src[i]);
    })
}

/// `x *= alpha` with a host scalar.
pub fn scale(stream: &Stream, alpha: f32, x: &DeviceBuffer<f32>) -> Result<()> {
    let x = x.clone();
    stream.launch(SCALE, move |device| {
        let mut x = x.write();
        device.for_each(&mut x, |_, v| *v *= alpha);
    })
}

/// `x *= alpha[0]` where the scalar lives in device memory.
pub fn scale_by_device(
    stream: &Stream,
    alpha: &DeviceBuffer<f32>,
    x: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("scale_by_device alpha", alpha, 1)?;
    ensure_distinct("scale_by_device", x, alpha)?;
    let (alpha, x) = (alpha.clone(), x.clone());
    stream.launch(SCALE_BY_DEVICE, move |device| {
        let alpha = alpha.read()[0];
        let mut x = x.write();
        device.for_each(&mut x, |_, v| *v *= alpha);
    })
}

/// `x = exp(x)` elementwise.
pub fn exp(stream: &Stream, x: &DeviceBuffer<f32>) -> Result<()> {
    let x = x.clone();
    stream.launch(EXP, move |device| {
        let mut x = x.write();
        device.for_each(&mut x, |_, v| *v = v.exp());
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    No,
    Yes,
}

/// Shape and coefficients of `C = alpha * op(A) * op(B) + beta * C`, where
/// `op(A)` is `m x k`, `op(B)` is `k x n` and `C` is `m x n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmParams {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub beta: f32,
}

impl GemmParams {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { trans_a: Transpose::No, trans_b: Transpose::No, m, n, k, alpha: 1.0, beta: 0.0 }
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn transpose_a(mut self) -> Self {
        self.trans_a = Transpose::Yes;
        self
    }

    pub fn transpose_b(mut self) -> Self {
        self.trans_b = Transpose::Yes;
        self
    }
}

/// General matrix multiply. With `beta == 0` the prior contents of `c` are
/// ignored, even if they are not finite.
pub fn gemm(
    stream: &Stream,
    params: GemmParams,
    a: &DeviceBuffer<f32>,
    b: &DeviceBuffer<f32>,
    c: &DeviceBuffer<f32>,
) -> Result<()> {
    let GemmParams { trans_a, trans_b, m, n, k, alpha, beta } = params;
    ensure_len("gemm A", a, m * k)?;
    ensure_len("gemm B", b, k * n)?;
    ensure_len("gemm C", c, m * n)?;
    ensure_distinct("gemm C/A", c, a)?;
    ensure_distinct("gemm C/B", c, b)?;

    let (a, b, c) = (a.clone(), b.clone(), c.clone());
    stream.launch(GEMM, move |device| {
        // Same allocation for A and B is allowed; both are read-only.
        let a_guard = a.read();
        let b_guard = if a.same_allocation(&b) { None } else { Some(b.read()) };
        let a: &[f32] = &a_guard;
        let b: &[f32] = b_guard.as_deref().map_or(a, Vec::as_slice);
        let mut c = c.write();

        let a_at = |i: usize, p: usize| match trans_a {
            Transpose::No => a[i * k + p],
            Transpose::Yes => a[p * m + i],
        };
        let b_at = |p: usize, j: usize| match trans_b {
            Transpose::No => b[p * n + j],
            Transpose::Yes => b[j * k + p],
        };

        device.for_each_row(&mut c, n, |i, row| {
            for (j, out) in row.iter_mut().enumerate() {
                let acc: f32 = (0..k).map(|p| a_at(i, p) * b_at(p, j)).sum();
                *out = if beta == 0.0 { alpha * acc } else { alpha * acc + beta * *out };
            }
        });
    })
}

/// Matrix-vector multiply `y = alpha * op(A) * x + beta * y` with `A` of
/// shape `m x n`.
#[allow(clippy::too_many_arguments)]
pub fn gemv(
    stream: &Stream,
    trans: Transpose,
    m: usize,
    n: usize,
    alpha: f32,
    a: &DeviceBuffer<f32>,
    x: &DeviceBuffer<f32>,
    beta: f32,
    y: &DeviceBuffer<f32>,
) -> Result<()> {
    let (x_len, y_len) = match trans {
        Transpose::No => (n, m),
        Transpose::Yes => (m, n),
    };
    ensure_len("gemv A", a, m * n)?;
    ensure_len("gemv x", x, x_len)?;
    ensure_len("gemv y", y, y_len)?;
    ensure_distinct("gemv y/A", y, a)?;
    ensure_distinct("gemv y/x", y, x)?;

    let (a, x, y) = (a.clone(), x.clone(), y.clone());
    stream.launch(GEMV, move |device| {
        let a_guard = a.read();
        let x_guard = if a.same_allocation(&x) { None } else { Some(x.read()) };
        let a: &[f32] = &a_guard;
        let x: &[f32] = x_guard.as_deref().map_or(a, Vec::as_slice);
        let mut y = y.write();

        device.for_each(&mut y, |r, out| {
            let acc: f32 = match trans {
                Transpose::No => (0..n).map(|j| a[r * n + j] * x[j]).sum(),
                Transpose::Yes => (0..m).map(|i| a[i * n + r] * x[i]).sum(),
            };
            *out = if beta == 0.0 { alpha * acc } else { alpha * acc + beta * *out };
        });
    })
}

/// `out[0] = sum(x)`.
pub fn sum(stream: &Stream, x: &DeviceBuffer<f32>, out: &DeviceBuffer<f32>) -> Result<()> {
    ensure_len("sum out", out, 1)?;
    ensure_distinct("sum", out, x)?;
    let (x, out) = (x.clone(), out.clone());
    stream.launch(SUM, move |device| {
        let total = device.sum(&x.read());
        out.write()[0] = total;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crossent_common::DeviceConfig;
    use std::sync::Arc;

    fn stream() -> Stream {
        let device = Device::new(DeviceConfig {
            num_workers: 2,
            worker_group_size: 4,
            thread_name_prefix: "math-test".to_string(),
        })
        .unwrap();
        Stream::new(Arc::new(device)).unwrap()
    }

    fn host(stream: &Stream, buf: &DeviceBuffer<f32>) -> Vec<f32> {
        buf.to_host(stream).unwrap()
    }

    // ── Elementwise ──────────────────────────────────────────────────────

    #[test]
    fn test_set_copy_scale_exp() {
        let s = stream();
        let x = DeviceBuffer::<f32>::zeros(5);
        let y = DeviceBuffer::<f32>::zeros(5);
        set(&s, &x, 2.0).unwrap();
        copy(&s, &x, &y).unwrap();
        scale(&s, 0.5, &y).unwrap();
        exp(&s, &y).unwrap();
        assert_eq!(host(&s, &x), vec![2.0; 5]);
        for v in host(&s, &y) {
            assert!((v - std::f32::consts::E).abs() < 1e-6);
        }
    }

    #[test]
    fn test_copy_onto_itself_is_noop() {
        let s = stream();
        let x = DeviceBuffer::from_host(vec![1.0f32, 2.0]);
        copy(&s, &x, &x.clone()).unwrap();
        assert_eq!(s.stats().kernels_launched, 0);
        assert_eq!(host(&s, &x), vec![1.0, 2.0]);
    }

    #[test]
    fn test_copy_rejects_length_mismatch() {
        let s = stream();
        let x = DeviceBuffer::<f32>::zeros(3);
        let y = DeviceBuffer::<f32>::zeros(4);
        assert!(copy(&s, &x, &y).is_err());
    }

    #[test]
    fn test_scale_by_device_reads_scalar_at_run_time() {
        let s = stream();
        let alpha = DeviceBuffer::<f32>::zeros(1);
        let x = DeviceBuffer::from_host(vec![1.0f32, -2.0, 3.0]);
        set(&s, &alpha, 4.0).unwrap();
        scale_by_device(&s, &alpha, &x).unwrap();
        assert_eq!(host(&s, &x), vec![4.0, -8.0, 12.0]);
        assert!(scale_by_device(&s, &x, &x).is_err());
    }

    // ── gemm / gemv ──────────────────────────────────────────────────────

    #[test]
    fn test_gemm_plain() {
        let s = stream();
        // [2x3] * [3x2]
        let a = DeviceBuffer::from_host(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DeviceBuffer::from_host(vec![7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let c = DeviceBuffer::<f32>::zeros(4);
        gemm(&s, GemmParams::new(2, 2, 3), &a, &b, &c).unwrap();
        assert_eq!(host(&s, &c), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_gemm_transposed_operands() {
        let s = stream();
        // A^T where A is stored [3x2]; B^T where B is stored [2x3].
        let a = DeviceBuffer::from_host(vec![1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let b = DeviceBuffer::from_host(vec![7.0f32, 9.0, 11.0, 8.0, 10.0, 12.0]);
        let c = DeviceBuffer::<f32>::zeros(4);
        let params = GemmParams::new(2, 2, 3).transpose_a().transpose_b();
        gemm(&s, params, &a, &b, &c).unwrap();
        assert_eq!(host(&s, &c), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_gemm_rank_one_update_accumulates() {
        let s = stream();
        // C[i][j] = C[i][j] - v[i] * 1
        let v = DeviceBuffer::from_host(vec![1.0f32, 10.0]);
        let ones = DeviceBuffer::from_host(vec![1.0f32; 3]);
        let c = DeviceBuffer::from_host(vec![5.0f32, 6.0, 7.0, 50.0, 60.0, 70.0]);
        gemm(&s, GemmParams::new(2, 3, 1).alpha(-1.0).beta(1.0), &v, &ones, &c).unwrap();
        assert_eq!(host(&s, &c), vec![4.0, 5.0, 6.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_gemm_beta_zero_ignores_garbage() {
        let s = stream();
        let a = DeviceBuffer::from_host(vec![1.0f32]);
        let b = DeviceBuffer::from_host(vec![2.0f32]);
        let c = DeviceBuffer::from_host(vec![f32::NAN]);
        gemm(&s, GemmParams::new(1, 1, 1), &a, &b, &c).unwrap();
        assert_eq!(host(&s, &c), vec![2.0]);
    }

    #[test]
    fn test_gemm_rejects_aliased_output() {
        let s = stream();
        let a = DeviceBuffer::<f32>::zeros(4);
        let b = DeviceBuffer::<f32>::zeros(4);
        assert!(gemm(&s, GemmParams::new(2, 2, 2), &a, &b, &a).is_err());
        assert!(gemm(&s, GemmParams::new(2, 2, 2), &a, &b, &b).is_err());
    }

    #[test]
    fn test_gemv_both_orientations() {
        let s = stream();
        let a = DeviceBuffer::from_host(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]); // [2x3]
        let x3 = DeviceBuffer::from_host(vec![1.0f32; 3]);
        let x2 = DeviceBuffer::from_host(vec![1.0f32, 2.0]);
        let y2 = DeviceBuffer::<f32>::zeros(2);
        let y3 = DeviceBuffer::from_host(vec![1.0f32; 3]);
        gemv(&s, Transpose::No, 2, 3, 1.0, &a, &x3, 0.0, &y2).unwrap();
        gemv(&s, Transpose::Yes, 2, 3, 1.0, &a, &x2, 1.0, &y3).unwrap();
        assert_eq!(host(&s, &y2), vec![6.0, 15.0]);
        assert_eq!(host(&s, &y3), vec![10.0, 13.0, 16.0]);
    }

    #[test]
    fn test_sum_into_scalar() {
        let s = stream();
        let x = DeviceBuffer::from_host((1..=10).map(|v| v as f32).collect());
        let out = DeviceBuffer::<f32>::zeros(1);
        sum(&s, &x, &out).unwrap();
        assert_eq!(s.read_scalar(&out).unwrap(), 55.0);
        assert!(sum(&s, &x, &DeviceBuffer::zeros(2)).is_err());
    }
}

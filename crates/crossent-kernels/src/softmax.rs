//! Numerically stable softmax for the dense and spatial layouts.
//!
//! Dense softmax is assembled from primitives: a row-max reduction, a
//! rank-one update subtracting each row's max, an elementwise exp, a
//! row-sum matrix-vector product and a per-row division. Spatial softmax
//! runs one worker per position and walks the channel axis with stride
//! `H * W`.

use crossent_common::{DenseShape, Result, SpatialShape};

use crate::buffer::{DeviceBuffer, DisjointSlice};
use crate::math::{self, ensure_distinct, ensure_len, GemmParams, Transpose};
use crate::stream::Stream;

pub const ROW_MAX: &str = "row_max";
pub const DIVIDE_BY_ROW: &str = "divide_by_row";
pub const SPATIAL_SOFTMAX: &str = "spatial_softmax";

/// `out[i] = max_j x[i, j]`.
pub fn row_max(
    stream: &Stream,
    shape: DenseShape,
    x: &DeviceBuffer<f32>,
    out: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("row_max x", x, shape.numel())?;
    ensure_len("row_max out", out, shape.n)?;
    ensure_distinct("row_max", out, x)?;
    let d = shape.d;
    let (x, out) = (x.clone(), out.clone());
    stream.launch(ROW_MAX, move |device| {
        let x = x.read();
        let x: &[f32] = &x;
        let mut out = out.write();
        device.for_each(&mut out, |i, m| {
            *m = x[i * d..(i + 1) * d].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        });
    })
}

/// `x[i, j] /= row_sums[i]`. Each element finds its row as `flat / d`.
pub fn divide_by_row(
    stream: &Stream,
    shape: DenseShape,
    x: &DeviceBuffer<f32>,
    row_sums: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("divide_by_row x", x, shape.numel())?;
    ensure_len("divide_by_row sums", row_sums, shape.n)?;
    ensure_distinct("divide_by_row", x, row_sums)?;
    let d = shape.d;
    let (x, row_sums) = (x.clone(), row_sums.clone());
    stream.launch(DIVIDE_BY_ROW, move |device| {
        let sums = row_sums.read();
        let sums: &[f32] = &sums;
        let mut x = x.write();
        device.for_each(&mut x, |flat, v| *v /= sums[flat / d]);
    })
}

/// Dense softmax of `logits` into `probs`.
///
/// `scale` (length `N`) is scratch that ends up holding the row sums of the
/// shifted exponentials. `ones` (length `D`) must be filled with `1.0` by
/// the caller; it is the right operand of both the rank-one update and the
/// row-sum product.
pub fn softmax_dense(
    stream: &Stream,
    shape: DenseShape,
    logits: &DeviceBuffer<f32>,
    probs: &DeviceBuffer<f32>,
    scale: &DeviceBuffer<f32>,
    ones: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("softmax probs", probs, shape.numel())?;
    ensure_len("softmax ones", ones, shape.d)?;
    ensure_distinct("softmax probs", probs, logits)?;

    let DenseShape { n, d } = shape;
    row_max(stream, shape, logits, scale)?;
    math::copy(stream, logits, probs)?;
    // probs -= rowmax * ones^T
    math::gemm(stream, GemmParams::new(n, d, 1).alpha(-1.0).beta(1.0), scale, ones, probs)?;
    math::exp(stream, probs)?;
    math::gemv(stream, Transpose::No, n, d, 1.0, probs, ones, 0.0, scale)?;
    divide_by_row(stream, shape, probs, scale)
}

/// Spatial softmax over the channel axis of `[N, D, H, W]` logits.
pub fn softmax_spatial(
    stream: &Stream,
    shape: SpatialShape,
    logits: &DeviceBuffer<f32>,
    probs: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("spatial_softmax logits", logits, shape.numel())?;
    ensure_len("spatial_softmax probs", probs, shape.numel())?;
    ensure_distinct("spatial_softmax", probs, logits)?;
    let (logits, probs) = (logits.clone(), probs.clone());
    stream.launch(SPATIAL_SOFTMAX, move |device| {
        let x = logits.read();
        let x: &[f32] = &x;
        let mut p = probs.write();
        let out = DisjointSlice::new(p.as_mut_slice());
        device.for_each_index(shape.positions(), |index| {
            let pos = shape.position(index);
            let at = |c| shape.offset(pos.example, c, pos.y, pos.x);

            let max = (0..shape.d).map(|c| x[at(c)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for c in 0..shape.d {
                let e = (x[at(c)] - max).exp();
                // SAFETY: offsets of one position belong to this worker only.
                unsafe { out.set(at(c), e) };
                sum += e;
            }
            for c in 0..shape.d {
                // SAFETY: as above.
                unsafe { out.set(at(c), out.get(at(c)) / sum) };
            }
        });
    })
}

//! Per-example cross-entropy from probabilities.
//!
//! Label values are checked on the device: an out-of-range label is a fatal
//! kernel assertion that faults the stream, not a recoverable error.

use crossent_common::{DenseShape, Result, SpatialShape, IGNORE_LABEL};

use crate::buffer::DeviceBuffer;
use crate::math::{ensure_distinct, ensure_len};
use crate::stream::Stream;

pub const LABEL_CROSS_ENTROPY: &str = "label_cross_entropy";
pub const PROB_CROSS_ENTROPY: &str = "prob_cross_entropy";
pub const SPATIAL_CROSS_ENTROPY: &str = "spatial_cross_entropy";

/// Floor applied before the log in the dense modes.
pub const DENSE_LOG_FLOOR: f32 = f32::MIN_POSITIVE;

/// Floor applied before the log in the spatial mode.
pub const SPATIAL_LOG_FLOOR: f32 = 1e-20;

/// Panics (inside a kernel) unless `0 <= label < d`.
#[inline]
pub(crate) fn assert_label(label: i32, d: usize, at: usize) -> usize {
    assert!(
        label >= 0 && (label as usize) < d,
        "label {label} at index {at} is outside [0, {d})"
    );
    label as usize
}

/// `losses[i] = -ln(max(P[i, label[i]], FLT_MIN)) * w[i]`.
pub fn label_cross_entropy(
    stream: &Stream,
    shape: DenseShape,
    probs: &DeviceBuffer<f32>,
    labels: &DeviceBuffer<i32>,
    weights: Option<&DeviceBuffer<f32>>,
    losses: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("label_cross_entropy probs", probs, shape.numel())?;
    ensure_len("label_cross_entropy labels", labels, shape.n)?;
    ensure_len("label_cross_entropy losses", losses, shape.n)?;
    ensure_distinct("label_cross_entropy", losses, probs)?;
    if let Some(w) = weights {
        ensure_len("label_cross_entropy weights", w, shape.n)?;
        ensure_distinct("label_cross_entropy", losses, w)?;
    }

    let d = shape.d;
    let (probs, labels, losses) = (probs.clone(), labels.clone(), losses.clone());
    let weights = weights.cloned();
    stream.launch(LABEL_CROSS_ENTROPY, move |device| {
        let p = probs.read();
        let p: &[f32] = &p;
        let labels = labels.read();
        let labels: &[i32] = &labels;
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut losses = losses.write();

        device.for_each(&mut losses, |i, loss| {
            let label = assert_label(labels[i], d, i);
            let weight = w.map_or(1.0, |w| w[i]);
            *loss = -p[i * d + label].max(DENSE_LOG_FLOOR).ln() * weight;
        });
    })
}

/// Soft-label loss `losses[i] = -sum_j ln(max(P[i, j], FLT_MIN)) * T[i, j] * w[i]`.
pub fn prob_cross_entropy(
    stream: &Stream,
    shape: DenseShape,
    probs: &DeviceBuffer<f32>,
    label_probs: &DeviceBuffer<f32>,
    weights: Option<&DeviceBuffer<f32>>,
    losses: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("prob_cross_entropy probs", probs, shape.numel())?;
    ensure_len("prob_cross_entropy targets", label_probs, shape.numel())?;
    ensure_len("prob_cross_entropy losses", losses, shape.n)?;
    ensure_distinct("prob_cross_entropy", losses, probs)?;
    ensure_distinct("prob_cross_entropy", losses, label_probs)?;
    if let Some(w) = weights {
        ensure_len("prob_cross_entropy weights", w, shape.n)?;
        ensure_distinct("prob_cross_entropy", losses, w)?;
    }

    let d = shape.d;
    let (probs, targets, losses) = (probs.clone(), label_probs.clone(), losses.clone());
    let weights = weights.cloned();
    stream.launch(PROB_CROSS_ENTROPY, move |device| {
        let p_guard = probs.read();
        let t_guard = if targets.same_allocation(&probs) { None } else { Some(targets.read()) };
        let p: &[f32] = &p_guard;
        let t: &[f32] = t_guard.as_deref().map_or(p, Vec::as_slice);
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut losses = losses.write();

        device.for_each(&mut losses, |i, loss| {
            let row = i * d..(i + 1) * d;
            let total: f32 = p[row.clone()]
                .iter()
                .zip(&t[row])
                .map(|(&p, &t)| -p.max(DENSE_LOG_FLOOR).ln() * t)
                .sum();
            *loss = total * w.map_or(1.0, |w| w[i]);
        });
    })
}

/// Spatial loss, one worker per position.
///
/// Positions labelled [`IGNORE_LABEL`] get loss `0` and used weight `0`.
/// Otherwise `losses[idx] = -ln(max(P[i, label, y, x], 1e-20)) * w` and
/// `weights_used[idx] = w`, with `w = 1` when no weights are given.
#[allow(clippy::too_many_arguments)]
pub fn spatial_cross_entropy(
    stream: &Stream,
    shape: SpatialShape,
    probs: &DeviceBuffer<f32>,
    labels: &DeviceBuffer<i32>,
    weights: Option<&DeviceBuffer<f32>>,
    losses: &DeviceBuffer<f32>,
    weights_used: &DeviceBuffer<f32>,
) -> Result<()> {
    let positions = shape.positions();
    ensure_len("spatial_cross_entropy probs", probs, shape.numel())?;
    ensure_len("spatial_cross_entropy labels", labels, positions)?;
    ensure_len("spatial_cross_entropy losses", losses, positions)?;
    ensure_len("spatial_cross_entropy weights_used", weights_used, positions)?;
    ensure_distinct("spatial_cross_entropy", losses, weights_used)?;
    for out in [losses, weights_used] {
        ensure_distinct("spatial_cross_entropy", out, probs)?;
        if let Some(w) = weights {
            ensure_distinct("spatial_cross_entropy", out, w)?;
        }
    }
    if let Some(w) = weights {
        ensure_len("spatial_cross_entropy weights", w, positions)?;
    }

    let (probs, labels) = (probs.clone(), labels.clone());
    let (losses, weights_used) = (losses.clone(), weights_used.clone());
    let weights = weights.cloned();
    stream.launch(SPATIAL_CROSS_ENTROPY, move |device| {
        let p = probs.read();
        let p: &[f32] = &p;
        let labels = labels.read();
        let labels: &[i32] = &labels;
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut losses = losses.write();
        let mut used = weights_used.write();

        device.for_each_pair(&mut losses, &mut used, |idx, loss, used| {
            let raw = labels[idx];
            if raw == IGNORE_LABEL {
                *loss = 0.0;
                *used = 0.0;
                return;
            }
            let label = assert_label(raw, shape.d, idx);
            let weight = w.map_or(1.0, |w| w[idx]);
            let prob = p[shape.channel_offset(idx, label)];
            *loss = -prob.max(SPATIAL_LOG_FLOOR).ln() * weight;
            *used = weight;
        });
    })
}

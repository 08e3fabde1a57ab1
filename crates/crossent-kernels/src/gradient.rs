//! Gradient kernels for softmax followed by cross-entropy.
//!
//! Each kernel expects `dx` to already hold a copy of the forward
//! probabilities and turns it, in place, into the per-element gradient
//! `(P - target) * w`. Normalization by the total weight and the upstream
//! gradient is applied afterwards by the caller.

use crossent_common::{DenseShape, Result, SpatialShape, IGNORE_LABEL};

use crate::buffer::{DeviceBuffer, DisjointSlice};
use crate::cross_entropy::assert_label;
use crate::math::{ensure_distinct, ensure_len};
use crate::stream::Stream;

pub const LABEL_GRADIENT: &str = "label_gradient";
pub const PROB_GRADIENT: &str = "prob_gradient";
pub const SPATIAL_GRADIENT: &str = "spatial_gradient";

/// One worker per example: subtract 1 at the label, then scale the row by
/// the example weight.
pub fn label_gradient(
    stream: &Stream,
    shape: DenseShape,
    labels: &DeviceBuffer<i32>,
    weights: Option<&DeviceBuffer<f32>>,
    dx: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("label_gradient labels", labels, shape.n)?;
    ensure_len("label_gradient dx", dx, shape.numel())?;
    if let Some(w) = weights {
        ensure_len("label_gradient weights", w, shape.n)?;
        ensure_distinct("label_gradient", dx, w)?;
    }

    let d = shape.d;
    let (labels, dx) = (labels.clone(), dx.clone());
    let weights = weights.cloned();
    stream.launch(LABEL_GRADIENT, move |device| {
        let labels = labels.read();
        let labels: &[i32] = &labels;
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut dx = dx.write();

        device.for_each_row(&mut dx, d, |i, row| {
            let label = assert_label(labels[i], d, i);
            row[label] -= 1.0;
            if let Some(w) = w {
                let weight = w[i];
                row.iter_mut().for_each(|v| *v *= weight);
            }
        });
    })
}

/// Soft-label gradient `dx[i, j] = (P[i, j] - T[i, j]) * w[i]`.
pub fn prob_gradient(
    stream: &Stream,
    shape: DenseShape,
    label_probs: &DeviceBuffer<f32>,
    weights: Option<&DeviceBuffer<f32>>,
    dx: &DeviceBuffer<f32>,
) -> Result<()> {
    ensure_len("prob_gradient targets", label_probs, shape.numel())?;
    ensure_len("prob_gradient dx", dx, shape.numel())?;
    ensure_distinct("prob_gradient", dx, label_probs)?;
    if let Some(w) = weights {
        ensure_len("prob_gradient weights", w, shape.n)?;
        ensure_distinct("prob_gradient", dx, w)?;
    }

    let d = shape.d;
    let (targets, dx) = (label_probs.clone(), dx.clone());
    let weights = weights.cloned();
    stream.launch(PROB_GRADIENT, move |device| {
        let t = targets.read();
        let t: &[f32] = &t;
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut dx = dx.write();

        device.for_each_row(&mut dx, d, |i, row| {
            let weight = w.map_or(1.0, |w| w[i]);
            for (v, &t) in row.iter_mut().zip(&t[i * d..(i + 1) * d]) {
                *v = (*v - t) * weight;
            }
        });
    })
}

/// Spatial gradient, one worker per position.
///
/// Ignored positions get an all-zero gradient and used weight `0`. Other
/// positions subtract 1 at the label channel and scale all channels by the
/// position weight, recording it in `weights_used`.
pub fn spatial_gradient(
    stream: &Stream,
    shape: SpatialShape,
    labels: &DeviceBuffer<i32>,
    weights: Option<&DeviceBuffer<f32>>,
    dx: &DeviceBuffer<f32>,
    weights_used: &DeviceBuffer<f32>,
) -> Result<()> {
    let positions = shape.positions();
    ensure_len("spatial_gradient labels", labels, positions)?;
    ensure_len("spatial_gradient dx", dx, shape.numel())?;
    ensure_len("spatial_gradient weights_used", weights_used, positions)?;
    ensure_distinct("spatial_gradient", dx, weights_used)?;
    if let Some(w) = weights {
        ensure_len("spatial_gradient weights", w, positions)?;
        ensure_distinct("spatial_gradient", dx, w)?;
        ensure_distinct("spatial_gradient", weights_used, w)?;
    }

    let (labels, dx, weights_used) = (labels.clone(), dx.clone(), weights_used.clone());
    let weights = weights.cloned();
    stream.launch(SPATIAL_GRADIENT, move |device| {
        let labels = labels.read();
        let labels: &[i32] = &labels;
        let w = weights.as_ref().map(DeviceBuffer::read);
        let w: Option<&[f32]> = w.as_deref().map(Vec::as_slice);
        let mut dx = dx.write();
        let grad = DisjointSlice::new(dx.as_mut_slice());
        let mut used = weights_used.write();

        device.for_each(&mut used, |idx, used| {
            let pos = shape.position(idx);
            let at = |c| shape.offset(pos.example, c, pos.y, pos.x);
            let raw = labels[idx];
            if raw == IGNORE_LABEL {
                for c in 0..shape.d {
                    // SAFETY: each position owns its channel offsets.
                    unsafe { grad.set(at(c), 0.0) };
                }
                *used = 0.0;
                return;
            }
            let label = assert_label(raw, shape.d, idx);
            // SAFETY: as above.
            unsafe { grad.set(at(label), grad.get(at(label)) - 1.0) };
            let weight = w.map_or(1.0, |w| w[idx]);
            if w.is_some() {
                for c in 0..shape.d {
                    // SAFETY: as above.
                    unsafe { grad.set(at(c), grad.get(at(c)) * weight) };
                }
            }
            *used = weight;
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::math;
    use crossent_common::DeviceConfig;
    use std::sync::Arc;

    fn stream() -> Stream {
        let device = Device::new(DeviceConfig {
            num_workers: 2,
            worker_group_size: 2,
            thread_name_prefix: "grad-test".to_string(),
        })
        .unwrap();
        Stream::new(Arc::new(device)).unwrap()
    }

    fn assert_close(got: &[f32], want: &[f32]) {
        assert_eq!(got.len(), want.len());
        for (i, (g, w)) in got.iter().zip(want).enumerate() {
            assert!((g - w).abs() < 1e-6, "index {i}: got {g}, want {w}");
        }
    }

    #[test]
    fn test_label_gradient_subtracts_one_at_label() {
        let s = stream();
        let probs = DeviceBuffer::from_host(vec![0.2, 0.5, 0.3]);
        let dx = DeviceBuffer::zeros(3);
        math::copy(&s, &probs, &dx).unwrap();
        let labels = DeviceBuffer::from_host(vec![1]);
        label_gradient(&s, DenseShape::new(1, 3), &labels, None, &dx).unwrap();
        assert_close(&dx.to_host(&s).unwrap(), &[0.2, -0.5, 0.3]);
    }

    #[test]
    fn test_label_gradient_scales_whole_row() {
        let s = stream();
        let dx = DeviceBuffer::from_host(vec![0.25, 0.75, 0.5, 0.5]);
        let labels = DeviceBuffer::from_host(vec![0, 1]);
        let weights = DeviceBuffer::from_host(vec![2.0, 0.0]);
        label_gradient(&s, DenseShape::new(2, 2), &labels, Some(&weights), &dx).unwrap();
        assert_close(&dx.to_host(&s).unwrap(), &[-1.5, 1.5, 0.0, 0.0]);
    }

    #[test]
    fn test_label_gradient_rejects_out_of_range_label() {
        let s = stream();
        let dx = DeviceBuffer::from_host(vec![0.5, 0.5]);
        let labels = DeviceBuffer::from_host(vec![2]);
        label_gradient(&s, DenseShape::new(1, 2), &labels, None, &dx).unwrap();
        let err = s.synchronize().unwrap_err();
        assert_eq!(err.as_device_assertion().map(|(k, _)| k), Some(LABEL_GRADIENT));
    }

    #[test]
    fn test_prob_gradient() {
        let s = stream();
        let dx = DeviceBuffer::from_host(vec![0.2, 0.5, 0.3]);
        let targets = DeviceBuffer::from_host(vec![0.0, 0.5, 0.5]);
        let weights = DeviceBuffer::from_host(vec![2.0]);
        prob_gradient(&s, DenseShape::new(1, 3), &targets, Some(&weights), &dx).unwrap();
        assert_close(&dx.to_host(&s).unwrap(), &[0.4, 0.0, -0.4]);
    }

    #[test]
    fn test_spatial_gradient_ignore_and_weights() {
        let s = stream();
        // N=1, D=2, H=1, W=3.
        let shape = SpatialShape::new(1, 2, 1, 3);
        let dx = DeviceBuffer::from_host(vec![0.25, 0.5, 0.1, 0.75, 0.5, 0.9]);
        let labels = DeviceBuffer::from_host(vec![1, IGNORE_LABEL, 0]);
        let weights = DeviceBuffer::from_host(vec![2.0, 7.0, 1.0]);
        let used = DeviceBuffer::zeros(3);
        spatial_gradient(&s, shape, &labels, Some(&weights), &dx, &used).unwrap();
        assert_close(&dx.to_host(&s).unwrap(), &[0.5, 0.0, -0.9, -0.5, 0.0, 0.9]);
        assert_eq!(used.to_host(&s).unwrap(), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_spatial_gradient_unweighted() {
        let s = stream();
        let shape = SpatialShape::new(1, 2, 2, 1);
        let dx = DeviceBuffer::from_host(vec![0.3, 0.6, 0.7, 0.4]);
        let labels = DeviceBuffer::from_host(vec![0, 1]);
        let used = DeviceBuffer::zeros(2);
        spatial_gradient(&s, shape, &labels, None, &dx, &used).unwrap();
        assert_close(&dx.to_host(&s).unwrap(), &[-0.7, 0.6, 0.7, -0.6]);
        assert_eq!(used.to_host(&s).unwrap(), vec![1.0, 1.0]);
    }
}

//! Weighted-average reduction of per-element losses.
//!
//! The total weight decides whether the host has to wait: with an implicit
//! count it is known up front, with per-element weights it is summed on the
//! device and copied back, which is the only host sync in a forward or
//! backward pass.

use crossent_common::Result;

use crate::buffer::DeviceBuffer;
use crate::math::{self, ensure_len};
use crate::stream::Stream;

/// Where the denominator of the average comes from.
#[derive(Debug, Clone, Copy)]
pub enum TotalWeight<'a> {
    /// Every element has weight 1.
    Count(usize),
    /// Sum of a device buffer.
    Sum(&'a DeviceBuffer<f32>),
}

/// Resolve the total weight on the host.
///
/// `scratch` must hold one element; it receives the device-side sum for
/// [`TotalWeight::Sum`].
pub fn total_weight(
    stream: &Stream,
    total: TotalWeight<'_>,
    scratch: &DeviceBuffer<f32>,
) -> Result<f32> {
    match total {
        TotalWeight::Count(n) => Ok(n as f32),
        TotalWeight::Sum(weights) => {
            math::sum(stream, weights, scratch)?;
            stream.read_scalar(scratch)
        }
    }
}

/// Factor that turns a summed loss (or gradient) into the scaled average.
/// `None` when the total weight is not positive; the value is then left
/// unscaled.
pub fn normalization(scale: f32, total_weight: f32) -> Option<f32> {
    (total_weight > 0.0).then(|| scale / total_weight)
}

/// Summary of one reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Average {
    pub total_weight: f32,
    /// Whether the sum was scaled by `scale / total_weight`.
    pub normalized: bool,
}

/// `avg_loss[0] = scale * sum(losses) / total_weight`, or the plain sum when
/// the total weight is not positive.
pub fn weighted_average(
    stream: &Stream,
    losses: &DeviceBuffer<f32>,
    total: TotalWeight<'_>,
    scale: f32,
    avg_loss: &DeviceBuffer<f32>,
    scratch: &DeviceBuffer<f32>,
) -> Result<Average> {
    ensure_len("weighted_average avg_loss", avg_loss, 1)?;
    ensure_len("weighted_average scratch", scratch, 1)?;
    math::sum(stream, losses, avg_loss)?;
    let tw = total_weight(stream, total, scratch)?;
    match normalization(scale, tw) {
        Some(factor) => {
            math::scale(stream, factor, avg_loss)?;
            Ok(Average { total_weight: tw, normalized: true })
        }
        None => {
            log::warn!("total weight is {tw}; leaving the summed loss unscaled");
            Ok(Average { total_weight: tw, normalized: false })
        }
    }
}

//! Softmax with cross-entropy loss, forward pass.

use crossent_common::{LossConfig, Result};
use crossent_kernels::{
    label_cross_entropy, prob_cross_entropy, softmax_dense, softmax_spatial,
    spatial_cross_entropy, weighted_average, DeviceTensor, TotalWeight,
};

use crate::context::ExecutionContext;
use crate::inputs::{resolve, ForwardInputs, Labels, Layout};
use crate::scratch::Scratch;

/// Outputs of one forward call.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Softmax probabilities, shaped like the logits.
    pub probs: DeviceTensor<f32>,
    /// Scaled weighted-average loss, zero-dimensional.
    pub avg_loss: DeviceTensor<f32>,
}

/// Forward operator. The mode (dense or spatial) and scale are fixed per
/// instance; scratch buffers persist across calls.
///
/// One call in flight per instance: `forward` takes `&mut self`.
#[derive(Debug)]
pub struct SoftmaxWithLoss {
    ctx: ExecutionContext,
    config: LossConfig,
    scratch: Scratch,
}

impl SoftmaxWithLoss {
    pub fn new(ctx: ExecutionContext, config: LossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { ctx, config, scratch: Scratch::default() })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Number of scratch allocations made so far.
    pub fn scratch_reallocations(&self) -> u64 {
        self.scratch.reallocations()
    }

    /// Compute probabilities and the averaged loss.
    ///
    /// Shape violations return an error before anything is launched. An
    /// out-of-range label faults the stream; the error surfaces at the
    /// next synchronization (inside this call when it needs the total
    /// weight, otherwise when the caller reads an output).
    pub fn forward(&mut self, inputs: &ForwardInputs<'_>) -> Result<ForwardOutput> {
        let layout = resolve(&self.config, inputs)?;
        let stream = self.ctx.stream();
        let scale = self.config.scale;
        let logits = inputs.logits.buffer();
        let weights = inputs.weights.map(DeviceTensor::buffer);

        let probs = DeviceTensor::zeros(inputs.logits.dims());
        let avg_loss = DeviceTensor::zeros(&[]);

        let average = match layout {
            Layout::Dense { shape, labels } => {
                log::debug!(
                    "softmax_with_loss forward: dense N={} D={} weighted={} label_prob={} scale={scale}",
                    shape.n,
                    shape.d,
                    weights.is_some(),
                    self.config.label_prob,
                );
                let s = &mut self.scratch;
                s.prepare_dense_forward(stream, shape)?;
                softmax_dense(stream, shape, logits, probs.buffer(), &s.row_scale, &s.ones)?;
                match labels {
                    Labels::Index(labels) => label_cross_entropy(
                        stream,
                        shape,
                        probs.buffer(),
                        labels.buffer(),
                        weights,
                        &s.losses,
                    )?,
                    Labels::Prob(targets) => prob_cross_entropy(
                        stream,
                        shape,
                        probs.buffer(),
                        targets.buffer(),
                        weights,
                        &s.losses,
                    )?,
                }
                let total = weights.map_or(TotalWeight::Count(shape.n), TotalWeight::Sum);
                weighted_average(stream, &s.losses, total, scale, avg_loss.buffer(), &s.total_weight)?
            }
            Layout::Spatial { shape, labels } => {
                log::debug!(
                    "softmax_with_loss forward: spatial N={} D={} H={} W={} weighted={} scale={scale}",
                    shape.n,
                    shape.d,
                    shape.h,
                    shape.w,
                    weights.is_some(),
                );
                let s = &mut self.scratch;
                s.prepare_spatial_forward(shape);
                softmax_spatial(stream, shape, logits, probs.buffer())?;
                spatial_cross_entropy(
                    stream,
                    shape,
                    probs.buffer(),
                    labels.buffer(),
                    weights,
                    &s.losses,
                    &s.weights_used,
                )?;
                let total = TotalWeight::Sum(&s.weights_used);
                weighted_average(stream, &s.losses, total, scale, avg_loss.buffer(), &s.total_weight)?
            }
        };
        log::debug!(
            "softmax_with_loss forward: total weight {} ({})",
            average.total_weight,
            if average.normalized { "normalized" } else { "left unscaled" }
        );

        Ok(ForwardOutput { probs, avg_loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossent_common::{CrossEntError, DeviceConfig, ShapeError};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(DeviceConfig {
            num_workers: 2,
            worker_group_size: 4,
            thread_name_prefix: "fwd".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_loss_config() {
        let cfg = LossConfig::spatial(1.0).with_label_prob();
        assert!(SoftmaxWithLoss::new(ctx(), cfg).is_err());
    }

    #[test]
    fn test_uniform_logits_loss_is_ln_d() {
        let mut op = SoftmaxWithLoss::new(ctx(), LossConfig::default()).unwrap();
        let x = DeviceTensor::from_host(&[2, 4], vec![0.0; 8]).unwrap();
        let y = DeviceTensor::from_host(&[2], vec![0, 3]).unwrap();
        let out = op.forward(&ForwardInputs::new(&x, Labels::Index(&y))).unwrap();
        let stream = op.context().stream();
        let loss = out.avg_loss.to_host(stream).unwrap()[0];
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
        assert!(out.avg_loss.dims().is_empty());
        assert_eq!(out.probs.dims(), &[2, 4]);
        assert_eq!(out.probs.to_host(stream).unwrap(), vec![0.25; 8]);
    }

    #[test]
    fn test_shape_error_launches_nothing() {
        let mut op = SoftmaxWithLoss::new(ctx(), LossConfig::default()).unwrap();
        let x = DeviceTensor::<f32>::zeros(&[2, 4]);
        let y = DeviceTensor::<i32>::zeros(&[3]);
        let err = op.forward(&ForwardInputs::new(&x, Labels::Index(&y))).unwrap_err();
        assert!(matches!(err, CrossEntError::Shape(ShapeError::Dim { tensor: "labels", .. })));
        assert_eq!(op.context().stats().kernels_launched, 0);
    }
}

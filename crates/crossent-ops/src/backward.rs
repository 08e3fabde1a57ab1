//! Gradient of softmax with cross-entropy loss with respect to the logits.

use crossent_common::{LossConfig, Result};
use crossent_kernels::{
    label_gradient, math, normalization, prob_gradient, spatial_gradient, total_weight,
    DeviceTensor, TotalWeight,
};

use crate::context::ExecutionContext;
use crate::inputs::{resolve_backward, BackwardInputs, Labels, Layout};
use crate::scratch::Scratch;

/// Backward operator, configured like the matching [`crate::SoftmaxWithLoss`].
#[derive(Debug)]
pub struct SoftmaxWithLossGradient {
    ctx: ExecutionContext,
    config: LossConfig,
    scratch: Scratch,
}

impl SoftmaxWithLossGradient {
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

    pub fn scratch_reallocations(&self) -> u64 {
        self.scratch.reallocations()
    }

    /// Gradient of the averaged loss, shaped like the logits:
    /// `(P - target) * w * scale / total_weight * d_avg_loss`.
    ///
    /// When the total weight is not positive the `scale / total_weight`
    /// factor is skipped.
    pub fn backward(&mut self, inputs: &BackwardInputs<'_>) -> Result<DeviceTensor<f32>> {
        let layout = resolve_backward(&self.config, inputs)?;
        let stream = self.ctx.stream();
        let weights = inputs.weights.map(DeviceTensor::buffer);

        let dx = DeviceTensor::zeros(inputs.logits.dims());
        math::copy(stream, inputs.probs.buffer(), dx.buffer())?;

        let s = &mut self.scratch;
        let tw = match layout {
            Layout::Dense { shape, labels } => {
                log::debug!(
                    "softmax_with_loss backward: dense N={} D={} weighted={}",
                    shape.n,
                    shape.d,
                    weights.is_some()
                );
                s.prepare_dense_backward();
                match labels {
                    Labels::Index(labels) => {
                        label_gradient(stream, shape, labels.buffer(), weights, dx.buffer())?
                    }
                    Labels::Prob(targets) => {
                        prob_gradient(stream, shape, targets.buffer(), weights, dx.buffer())?
                    }
                }
                let total = weights.map_or(TotalWeight::Count(shape.n), TotalWeight::Sum);
                total_weight(stream, total, &s.total_weight)?
            }
            Layout::Spatial { shape, labels } => {
                log::debug!(
                    "softmax_with_loss backward: spatial N={} D={} H={} W={} weighted={}",
                    shape.n,
                    shape.d,
                    shape.h,
                    shape.w,
                    weights.is_some()
                );
                s.prepare_spatial_backward(shape);
                spatial_gradient(
                    stream,
                    shape,
                    labels.buffer(),
                    weights,
                    dx.buffer(),
                    &s.weights_used,
                )?;
                total_weight(stream, TotalWeight::Sum(&s.weights_used), &s.total_weight)?
            }
        };

        match normalization(self.config.scale, tw) {
            Some(factor) => math::scale(stream, factor, dx.buffer())?,
            None => log::warn!("total weight is {tw}; leaving the gradient unscaled"),
        }
        math::scale_by_device(stream, inputs.d_avg_loss.buffer(), dx.buffer())?;
        Ok(dx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::ForwardInputs;
    use crossent_common::DeviceConfig;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(DeviceConfig {
            num_workers: 2,
            worker_group_size: 4,
            thread_name_prefix: "bwd".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_single_example_gradient() {
        let mut op = SoftmaxWithLossGradient::new(ctx(), LossConfig::default()).unwrap();
        let x = DeviceTensor::<f32>::zeros(&[1, 3]);
        let y = DeviceTensor::from_host(&[1], vec![1]).unwrap();
        let p = DeviceTensor::from_host(&[1, 3], vec![0.2, 0.5, 0.3]).unwrap();
        let g = DeviceTensor::scalar(1.0f32);
        let fwd = ForwardInputs::new(&x, Labels::Index(&y));
        let dx = op.backward(&BackwardInputs::new(fwd, &p, &g)).unwrap();
        let got = dx.to_host(op.context().stream()).unwrap();
        for (a, b) in got.iter().zip([0.2f32, -0.5, 0.3]) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(dx.dims(), &[1, 3]);
    }

    #[test]
    fn test_scale_and_upstream_gradient_multiply() {
        let mut op = SoftmaxWithLossGradient::new(ctx(), LossConfig::dense(3.0)).unwrap();
        let x = DeviceTensor::<f32>::zeros(&[2, 2]);
        let y = DeviceTensor::from_host(&[2], vec![0, 1]).unwrap();
        let p = DeviceTensor::from_host(&[2, 2], vec![0.5; 4]).unwrap();
        let g = DeviceTensor::scalar(0.5f32);
        let fwd = ForwardInputs::new(&x, Labels::Index(&y));
        let dx = op.backward(&BackwardInputs::new(fwd, &p, &g)).unwrap();
        // (P - onehot) * 3 / 2 * 0.5
        let got = dx.to_host(op.context().stream()).unwrap();
        let want = [-0.375f32, 0.375, 0.375, -0.375];
        for (a, b) in got.iter().zip(want) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }
}

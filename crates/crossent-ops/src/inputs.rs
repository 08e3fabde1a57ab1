//! Operator inputs and their shape contracts.

use crossent_common::{DenseShape, LossConfig, ShapeError, SpatialShape};
use crossent_kernels::DeviceTensor;

/// Targets of the loss.
#[derive(Debug, Clone, Copy)]
pub enum Labels<'a> {
    /// Class indices, `i32`.
    Index(&'a DeviceTensor<i32>),
    /// One probability distribution per example (dense `label_prob` mode).
    Prob(&'a DeviceTensor<f32>),
}

impl Labels<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Labels::Index(_) => "class indices",
            Labels::Prob(_) => "probabilities",
        }
    }
}

/// Inputs of [`crate::SoftmaxWithLoss::forward`].
#[derive(Debug, Clone, Copy)]
pub struct ForwardInputs<'a> {
    pub logits: &'a DeviceTensor<f32>,
    pub labels: Labels<'a>,
    pub weights: Option<&'a DeviceTensor<f32>>,
}

impl<'a> ForwardInputs<'a> {
    pub fn new(logits: &'a DeviceTensor<f32>, labels: Labels<'a>) -> Self {
        Self { logits, labels, weights: None }
    }

    pub fn with_weights(mut self, weights: &'a DeviceTensor<f32>) -> Self {
        self.weights = Some(weights);
        self
    }
}

/// Inputs of [`crate::SoftmaxWithLossGradient::backward`].
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a> {
    pub logits: &'a DeviceTensor<f32>,
    pub labels: Labels<'a>,
    pub weights: Option<&'a DeviceTensor<f32>>,
    /// Probabilities produced by the forward pass.
    pub probs: &'a DeviceTensor<f32>,
    /// Upstream gradient of the averaged loss, one element.
    pub d_avg_loss: &'a DeviceTensor<f32>,
}

impl<'a> BackwardInputs<'a> {
    pub fn new(
        forward: ForwardInputs<'a>,
        probs: &'a DeviceTensor<f32>,
        d_avg_loss: &'a DeviceTensor<f32>,
    ) -> Self {
        Self {
            logits: forward.logits,
            labels: forward.labels,
            weights: forward.weights,
            probs,
            d_avg_loss,
        }
    }

    fn forward(&self) -> ForwardInputs<'a> {
        ForwardInputs { logits: self.logits, labels: self.labels, weights: self.weights }
    }
}

/// Validated interpretation of a call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Layout<'a> {
    Dense { shape: DenseShape, labels: Labels<'a> },
    Spatial { shape: SpatialShape, labels: &'a DeviceTensor<i32> },
}

/// Check the forward contract for the configured mode.
pub(crate) fn resolve<'a>(
    config: &LossConfig,
    inputs: &ForwardInputs<'a>,
) -> Result<Layout<'a>, ShapeError> {
    let dims = inputs.logits.dims();
    if config.spatial {
        let shape = SpatialShape::from_dims(dims)?;
        let Labels::Index(labels) = inputs.labels else {
            return Err(ShapeError::LabelKind {
                reason: format!("spatial mode needs class indices, got {}", inputs.labels.kind()),
            });
        };
        shape.check_labels(labels.dims())?;
        if let Some(w) = inputs.weights {
            shape.check_weights(w.dims())?;
        }
        return Ok(Layout::Spatial { shape, labels });
    }

    let shape = DenseShape::from_dims(dims, config.axis)?;
    match (config.label_prob, inputs.labels) {
        (false, Labels::Index(labels)) => {
            shape.check_labels(&dims[..config.axis], labels.dims())?
        }
        (true, Labels::Prob(targets)) => shape.check_label_probs(targets.dims())?,
        (label_prob, labels) => {
            return Err(ShapeError::LabelKind {
                reason: format!("label_prob = {label_prob} but labels are {}", labels.kind()),
            })
        }
    }
    if let Some(w) = inputs.weights {
        shape.check_weights(w.dims())?;
    }
    Ok(Layout::Dense { shape, labels: inputs.labels })
}

/// Check the backward contract: the forward contract plus `probs` shaped
/// like the logits and a one-element upstream gradient.
pub(crate) fn resolve_backward<'a>(
    config: &LossConfig,
    inputs: &BackwardInputs<'a>,
) -> Result<Layout<'a>, ShapeError> {
    let layout = resolve(config, &inputs.forward())?;
    let logits = inputs.logits.dims();
    let probs = inputs.probs.dims();
    if probs.len() != logits.len() {
        return Err(ShapeError::Rank { tensor: "probs", expected: logits.len(), actual: probs.len() });
    }
    for (dim, (&expected, &actual)) in logits.iter().zip(probs).enumerate() {
        if expected != actual {
            return Err(ShapeError::Dim { tensor: "probs", dim, expected, actual });
        }
    }
    if inputs.d_avg_loss.numel() != 1 {
        return Err(ShapeError::Numel {
            tensor: "d_avg_loss",
            expected: 1,
            actual: inputs.d_avg_loss.numel(),
        });
    }
    Ok(layout)
}

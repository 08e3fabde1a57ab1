//! Softmax with cross-entropy loss operators.
//!
//! [`SoftmaxWithLoss`] turns logits and labels into probabilities and a
//! scaled weighted-average loss; [`SoftmaxWithLossGradient`] produces the
//! gradient of that loss with respect to the logits. Both run on an
//! [`ExecutionContext`] and queue their kernels on its stream; the only
//! point where a call waits is the transfer of the total weight, and that
//! transfer is skipped entirely for unweighted dense inputs.
//!
//! ```no_run
//! use crossent_common::LossConfig;
//! use crossent_kernels::DeviceTensor;
//! use crossent_ops::{ExecutionContext, ForwardInputs, Labels, SoftmaxWithLoss};
//!
//! # fn main() -> crossent_common::Result<()> {
//! let ctx = ExecutionContext::with_defaults()?;
//! let mut op = SoftmaxWithLoss::new(ctx.clone(), LossConfig::default())?;
//! let logits = DeviceTensor::from_host(&[2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0])?;
//! let labels = DeviceTensor::from_host(&[2], vec![2, 0])?;
//! let out = op.forward(&ForwardInputs::new(&logits, Labels::Index(&labels)))?;
//! let loss = ctx.stream().read_scalar(out.avg_loss.buffer())?;
//! # let _ = loss;
//! # Ok(())
//! # }
//! ```

pub mod backward;
pub mod context;
pub mod forward;
pub mod inputs;
mod scratch;

pub use backward::SoftmaxWithLossGradient;
pub use context::ExecutionContext;
pub use forward::{ForwardOutput, SoftmaxWithLoss};
pub use inputs::{BackwardInputs, ForwardInputs, Labels};

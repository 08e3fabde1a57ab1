//! Kernels for fused softmax and cross-entropy.
//!
//! The execution model mirrors an accelerator: a [`Device`] runs
//! data-parallel kernels over worker groups, a [`Stream`] orders kernel
//! launches and is the only place the host waits, and [`DeviceBuffer`]s are
//! the memory kernels read and write. Kernels fail their launch with
//! [`crossent_common::KernelError::InvalidArguments`] when operands do not
//! fit; failures detected while running (bad label values) fault the stream.

pub mod average;
pub mod buffer;
pub mod cross_entropy;
pub mod device;
pub mod gradient;
pub mod math;
pub mod softmax;
pub mod stream;

pub use average::{normalization, total_weight, weighted_average, Average, TotalWeight};
pub use buffer::{DeviceBuffer, DeviceTensor};
pub use cross_entropy::{
    label_cross_entropy, prob_cross_entropy, spatial_cross_entropy, DENSE_LOG_FLOOR,
    SPATIAL_LOG_FLOOR,
};
pub use device::{Device, LaunchConfig};
pub use gradient::{label_gradient, prob_gradient, spatial_gradient};
pub use math::{GemmParams, Transpose};
pub use softmax::{divide_by_row, row_max, softmax_dense, softmax_spatial};
pub use stream::{Stream, StreamStats};

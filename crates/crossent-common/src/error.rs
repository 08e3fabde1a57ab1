//! Error types shared by the crossent crates.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CrossEntError>;

/// Top-level error for the softmax cross-entropy operators.
#[derive(Debug, Error)]
pub enum CrossEntError {
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl CrossEntError {
    /// Returns the captured device fault, if this error is one.
    pub fn as_device_assertion(&self) -> Option<(&'static str, &str)> {
        match self {
            Self::Kernel(KernelError::DeviceAssertion { kernel, message }) => {
                Some((*kernel, message.as_str()))
            }
            _ => None,
        }
    }
}

/// Errors raised while preparing or executing kernels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Host-side argument validation failed before the kernel was enqueued.
    #[error("invalid kernel arguments: {reason}")]
    InvalidArguments { reason: String },

    /// A device-side precondition aborted a kernel. The stream stays
    /// faulted afterwards and reports this error at every sync point.
    #[error("device assertion failed in kernel `{kernel}`: {message}")]
    DeviceAssertion { kernel: &'static str, message: String },

    /// The stream submission thread is gone.
    #[error("stream closed: {reason}")]
    StreamClosed { reason: String },

    /// The worker pool backing the device could not be built.
    #[error("failed to build worker pool: {reason}")]
    WorkerPool { reason: String },
}

/// Shape and rank precondition failures detected on the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{tensor}: expected rank {expected}, got {actual}")]
    Rank { tensor: &'static str, expected: usize, actual: usize },

    #[error("{tensor}: axis {axis} out of range for rank {rank}")]
    Axis { tensor: &'static str, axis: usize, rank: usize },

    #[error("{tensor}: dimension {dim} expected {expected}, got {actual}")]
    Dim { tensor: &'static str, dim: usize, expected: usize, actual: usize },

    #[error("{tensor}: expected {expected} elements, got {actual}")]
    Numel { tensor: &'static str, expected: usize, actual: usize },

    #[error("{tensor}: class dimension must be non-zero, got {dims:?}")]
    NoClasses { tensor: &'static str, dims: Vec<usize> },

    #[error("label kind does not match operator mode: {reason}")]
    LabelKind { reason: String },
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

//! Shape interpretation for the dense and spatial loss layouts.
//!
//! Dense logits are viewed as a row-major `[N, D]` matrix. Spatial logits are
//! `[N, D, H, W]` with the channel dimension between the example and the
//! spatial dimensions, so the `D` values of one position are `H * W` apart.
//! [`SpatialShape::offset`] is the only place that layout is spelled out;
//! every spatial kernel addresses memory through it.

use crate::error::ShapeError;

/// Label value marking a spatial position that contributes nothing.
pub const IGNORE_LABEL: i32 = -1;

/// Product of `dims[..axis]`.
pub fn size_to_dim(dims: &[usize], axis: usize) -> usize {
    dims[..axis.min(dims.len())].iter().product()
}

/// Product of `dims[axis..]`.
pub fn size_from_dim(dims: &[usize], axis: usize) -> usize {
    dims[axis.min(dims.len())..].iter().product()
}

// An empty batch is allowed; a class dimension of zero is not.
fn ensure_classes(tensor: &'static str, dims: &[usize], d: usize) -> Result<(), ShapeError> {
    if d == 0 {
        return Err(ShapeError::NoClasses { tensor, dims: dims.to_vec() });
    }
    Ok(())
}

/// `[N, D]` view of dense logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseShape {
    /// Number of examples.
    pub n: usize,
    /// Number of classes.
    pub d: usize,
}

impl DenseShape {
    pub fn new(n: usize, d: usize) -> Self {
        Self { n, d }
    }

    /// Flatten `dims` around `axis`.
    pub fn from_dims(dims: &[usize], axis: usize) -> Result<Self, ShapeError> {
        if dims.is_empty() || axis >= dims.len() {
            return Err(ShapeError::Axis { tensor: "logits", axis, rank: dims.len() });
        }
        let d = size_from_dim(dims, axis);
        ensure_classes("logits", dims, d)?;
        Ok(Self { n: size_to_dim(dims, axis), d })
    }

    pub fn numel(&self) -> usize {
        self.n * self.d
    }

    /// Hard labels carry the leading logits dimensions `logits[..axis]`,
    /// optionally followed by a trailing dimension of 1. With `axis == 1`
    /// that is `[N]` or `[N, 1]`.
    pub fn check_labels(&self, leading: &[usize], dims: &[usize]) -> Result<(), ShapeError> {
        debug_assert_eq!(leading.iter().product::<usize>(), self.n);
        let rank = leading.len();
        let (head, trailing) = match dims.len() {
            r if r == rank => (dims, None),
            r if r == rank + 1 => (&dims[..rank], Some(dims[rank])),
            r => return Err(ShapeError::Rank { tensor: "labels", expected: rank, actual: r }),
        };
        for (dim, (&expected, &actual)) in leading.iter().zip(head).enumerate() {
            if expected != actual {
                return Err(ShapeError::Dim { tensor: "labels", dim, expected, actual });
            }
        }
        match trailing {
            Some(c) if c != 1 => {
                Err(ShapeError::Dim { tensor: "labels", dim: rank, expected: 1, actual: c })
            }
            _ => Ok(()),
        }
    }

    /// Soft labels carry one distribution per example.
    pub fn check_label_probs(&self, dims: &[usize]) -> Result<(), ShapeError> {
        let numel: usize = dims.iter().product();
        if numel != self.numel() {
            return Err(ShapeError::Numel {
                tensor: "labels",
                expected: self.numel(),
                actual: numel,
            });
        }
        Ok(())
    }

    /// One weight per example.
    pub fn check_weights(&self, dims: &[usize]) -> Result<(), ShapeError> {
        let numel: usize = dims.iter().product();
        if numel != self.n {
            return Err(ShapeError::Numel { tensor: "weights", expected: self.n, actual: numel });
        }
        Ok(())
    }
}

/// A single spatial position `(example, y, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub example: usize,
    pub y: usize,
    pub x: usize,
}

/// `[N, D, H, W]` view of spatial logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialShape {
    pub n: usize,
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl SpatialShape {
    pub fn new(n: usize, d: usize, h: usize, w: usize) -> Self {
        Self { n, d, h, w }
    }

    pub fn from_dims(dims: &[usize]) -> Result<Self, ShapeError> {
        let [n, d, h, w] = dims else {
            return Err(ShapeError::Rank { tensor: "logits", expected: 4, actual: dims.len() });
        };
        ensure_classes("logits", dims, *d)?;
        Ok(Self { n: *n, d: *d, h: *h, w: *w })
    }

    pub fn numel(&self) -> usize {
        self.n * self.d * self.h * self.w
    }

    /// Positions per example (`H * W`), also the channel stride.
    pub fn plane(&self) -> usize {
        self.h * self.w
    }

    /// Total number of positions across the batch (`N * H * W`).
    pub fn positions(&self) -> usize {
        self.n * self.plane()
    }

    /// Flat offset of `(example, channel, y, x)`.
    ///
    /// `i * D * H * W + c * H * W + y * W + x`. Forward, loss and gradient
    /// kernels must all go through this function.
    #[inline]
    pub fn offset(&self, example: usize, channel: usize, y: usize, x: usize) -> usize {
        debug_assert!(example < self.n && channel < self.d && y < self.h && x < self.w);
        example * self.d * self.h * self.w + channel * self.h * self.w + y * self.w + x
    }

    /// Decode a flat position index in `0..positions()`.
    #[inline]
    pub fn position(&self, index: usize) -> Position {
        let plane = self.plane();
        let example = index / plane;
        let rem = index % plane;
        Position { example, y: rem / self.w, x: rem % self.w }
    }

    /// Flat offset of channel `c` at flat position `index`.
    #[inline]
    pub fn channel_offset(&self, index: usize, channel: usize) -> usize {
        let p = self.position(index);
        self.offset(p.example, channel, p.y, p.x)
    }

    /// Labels must be `[N, H, W]`.
    pub fn check_labels(&self, dims: &[usize]) -> Result<(), ShapeError> {
        let expected = [self.n, self.h, self.w];
        if dims.len() != expected.len() {
            return Err(ShapeError::Rank { tensor: "labels", expected: 3, actual: dims.len() });
        }
        for (dim, (&e, &a)) in expected.iter().zip(dims).enumerate() {
            if e != a {
                return Err(ShapeError::Dim { tensor: "labels", dim, expected: e, actual: a });
            }
        }
        Ok(())
    }

    /// One weight per position.
    pub fn check_weights(&self, dims: &[usize]) -> Result<(), ShapeError> {
        let numel: usize = dims.iter().product();
        if numel != self.positions() {
            return Err(ShapeError::Numel {
                tensor: "weights",
                expected: self.positions(),
                actual: numel,
            });
        }
        Ok(())
    }
}

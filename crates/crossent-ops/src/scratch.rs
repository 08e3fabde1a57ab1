//! Scratch buffers owned by an operator instance.
//!
//! Buffers are resized lazily: a call with the same shape as the previous
//! one reuses every allocation.

use crossent_common::{DenseShape, Result, SpatialShape};
use crossent_kernels::{math, DeviceBuffer, Stream};

#[derive(Debug, Default)]
pub(crate) struct Scratch {
    /// Per-example or per-position losses.
    pub losses: DeviceBuffer<f32>,
    /// Effective per-position weights (spatial).
    pub weights_used: DeviceBuffer<f32>,
    /// Row maxima, then row sums (dense softmax).
    pub row_scale: DeviceBuffer<f32>,
    /// `D` ones (dense softmax).
    pub ones: DeviceBuffer<f32>,
    /// Device-side total weight.
    pub total_weight: DeviceBuffer<f32>,
    reallocations: u64,
}

impl Scratch {
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    fn fit(counter: &mut u64, buffer: &mut DeviceBuffer<f32>, len: usize) -> bool {
        let resized = buffer.resize(len);
        if resized {
            *counter += 1;
        }
        resized
    }

    pub fn prepare_dense_forward(&mut self, stream: &Stream, shape: DenseShape) -> Result<()> {
        let c = &mut self.reallocations;
        Self::fit(c, &mut self.losses, shape.n);
        Self::fit(c, &mut self.row_scale, shape.n);
        Self::fit(c, &mut self.total_weight, 1);
        if Self::fit(c, &mut self.ones, shape.d) {
            math::set(stream, &self.ones, 1.0f32)?;
        }
        Ok(())
    }

    pub fn prepare_spatial_forward(&mut self, shape: SpatialShape) {
        let c = &mut self.reallocations;
        Self::fit(c, &mut self.losses, shape.positions());
        Self::fit(c, &mut self.weights_used, shape.positions());
        Self::fit(c, &mut self.total_weight, 1);
    }

    pub fn prepare_dense_backward(&mut self) {
        Self::fit(&mut self.reallocations, &mut self.total_weight, 1);
    }

    pub fn prepare_spatial_backward(&mut self, shape: SpatialShape) {
        let c = &mut self.reallocations;
        Self::fit(c, &mut self.weights_used, shape.positions());
        Self::fit(c, &mut self.total_weight, 1);
    }
}

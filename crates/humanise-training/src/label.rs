//! Reusable real/fake label storage

use candle_core::{Device, Tensor};

use humanise_core::{HumaniseError, HumaniseResult};

pub const REAL_LABEL: f32 = 1.0;
pub const FAKE_LABEL: f32 = 0.0;

/// Fixed-capacity label storage, allocated once per session.
///
/// Each batch borrows its first `batch_size` entries, overwrites them with
/// the label it needs and hands a detached copy to the criterion. The buffer
/// never grows; oversized batches are rejected.
pub struct LabelBuffer {
    values: Vec<f32>,
    device: Device,
}

/// The first `batch_size` entries of a [`LabelBuffer`].
pub struct LabelView<'a> {
    values: &'a mut [f32],
    device: &'a Device,
}

impl LabelBuffer {
    pub fn new(capacity: usize, device: &Device) -> Self {
        Self {
            values: vec![0.0; capacity],
            device: device.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Borrow the entries for one batch.
    pub fn materialize(&mut self, batch_size: usize) -> HumaniseResult<LabelView<'_>> {
        if batch_size == 0 || batch_size > self.values.len() {
            return Err(HumaniseError::LabelCapacity {
                requested: batch_size,
                capacity: self.values.len(),
            });
        }

        Ok(LabelView {
            values: &mut self.values[..batch_size],
            device: &self.device,
        })
    }

    /// Shorthand for `materialize(batch_size)?.fill(value)`.
    pub fn fill(&mut self, batch_size: usize, value: f32) -> HumaniseResult<Tensor> {
        self.materialize(batch_size)?.fill(value)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

impl LabelView<'_> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overwrite every entry with `value`; returns a `[batch_size]` tensor outside any graph.
    pub fn fill(self, value: f32) -> HumaniseResult<Tensor> {
        self.values.fill(value);
        let len = self.values.len();
        Ok(Tensor::from_slice(&*self.values, len, self.device)?)
    }
}

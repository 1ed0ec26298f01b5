//! Behaviour shared by every cache record.

use candle_core::Tensor;

use crate::core::AttentionError;

/// A cache whose rows follow beams as they are pruned and reordered.
pub trait KeyValueCache {
    /// Number of cached positions (0 when nothing has been written yet).
    fn seq_len(&self) -> usize;

    /// Replaces row `i` with the old row `indices[i]` for every cached tensor.
    ///
    /// `indices` is a rank-1 `u32` tensor whose length becomes the new row count.
    fn reorder(&mut self, indices: &Tensor) -> Result<(), AttentionError>;

    /// Drops all cached tensors.
    fn clear(&mut self);
}

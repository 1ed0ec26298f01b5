use attention::{DecoderCache, KeyValueCache};
use candle_core::{Result, Tensor};

/// Per-row decoder state that must follow its beam when beams are reordered.
pub trait ReorderState {
    /// Row `i` of the new state becomes row `indices[i]` of the old one.
    fn reorder(&mut self, indices: &Tensor) -> Result<()>;
}

impl ReorderState for DecoderCache {
    fn reorder(&mut self, indices: &Tensor) -> Result<()> {
        Ok(KeyValueCache::reorder(self, indices)?)
    }
}

/// Stateless decoders that recompute everything from the fed tokens.
impl ReorderState for () {
    fn reorder(&mut self, _indices: &Tensor) -> Result<()> {
        Ok(())
    }
}

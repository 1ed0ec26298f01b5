//! Cache records for one decoder layer and for the whole stack.

use candle_core::Tensor;

use super::api::KeyValueCache;
use crate::core::AttentionError;

const SEQ_AXIS: usize = 2;

/// Keys and values accumulated by one attention module.
#[derive(Debug, Clone, Default)]
pub struct KvEntry {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KvEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    pub fn keys(&self) -> Option<&Tensor> {
        self.k.as_ref()
    }

    pub fn values(&self) -> Option<&Tensor> {
        self.v.as_ref()
    }

    /// Concatenates new keys/values onto the cached ones along the sequence
    /// axis, stores the result and returns the full history.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        if k.rank() != 4 || v.rank() != 4 {
            return Err(AttentionError::shape(format!(
                "cached projections must be [rows, heads, seq, head_dim], got k {:?} v {:?}",
                k.dims(),
                v.dims()
            )));
        }
        let (k_all, v_all) = match (&self.k, &self.v) {
            (Some(k_prev), Some(v_prev)) => {
                if k_prev.dims()[..2] != k.dims()[..2] || k_prev.dim(3)? != k.dim(3)? {
                    return Err(AttentionError::shape(format!(
                        "cache holds {:?} but step produced {:?}",
                        k_prev.dims(),
                        k.dims()
                    )));
                }
                (
                    Tensor::cat(&[k_prev, k], SEQ_AXIS)?,
                    Tensor::cat(&[v_prev, v], SEQ_AXIS)?,
                )
            }
            _ => (k.clone(), v.clone()),
        };
        self.k = Some(k_all.clone());
        self.v = Some(v_all.clone());
        Ok((k_all, v_all))
    }

    /// Stores a fixed key/value pair (e.g. projected encoder output).
    pub fn set(&mut self, k: Tensor, v: Tensor) {
        self.k = Some(k);
        self.v = Some(v);
    }
}

impl KeyValueCache for KvEntry {
    fn seq_len(&self) -> usize {
        self.k
            .as_ref()
            .and_then(|k| k.dims().get(SEQ_AXIS).copied())
            .unwrap_or(0)
    }

    fn reorder(&mut self, indices: &Tensor) -> Result<(), AttentionError> {
        if let Some(k) = &self.k {
            self.k = Some(k.index_select(indices, 0)?);
        }
        if let Some(v) = &self.v {
            self.v = Some(v.index_select(indices, 0)?);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Cache record for one decoder layer.
///
/// `self_attention` grows by one position per step. `cross_attention` holds
/// the projected encoder output, computed on the first step and reused.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    pub self_attention: KvEntry,
    pub cross_attention: KvEntry,
}

impl KeyValueCache for LayerCache {
    fn seq_len(&self) -> usize {
        self.self_attention.seq_len()
    }

    fn reorder(&mut self, indices: &Tensor) -> Result<(), AttentionError> {
        self.self_attention.reorder(indices)?;
        self.cross_attention.reorder(indices)
    }

    fn clear(&mut self) {
        self.self_attention.clear();
        self.cross_attention.clear();
    }
}

/// Indexed array of layer caches owned by one decode call.
#[derive(Debug, Clone, Default)]
pub struct DecoderCache {
    layers: Vec<LayerCache>,
}

impl DecoderCache {
    /// Allocates one empty record per decoder layer.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerCache::default(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerCache> {
        self.layers.get(index)
    }

    pub fn layer_mut(&mut self, index: usize) -> Result<&mut LayerCache, AttentionError> {
        let count = self.layers.len();
        self.layers.get_mut(index).ok_or_else(|| {
            AttentionError::shape(format!("cache has {count} layers, layer {index} requested"))
        })
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut LayerCache> {
        self.layers.iter_mut()
    }
}

impl KeyValueCache for DecoderCache {
    fn seq_len(&self) -> usize {
        self.layers.first().map(KeyValueCache::seq_len).unwrap_or(0)
    }

    fn reorder(&mut self, indices: &Tensor) -> Result<(), AttentionError> {
        for layer in &mut self.layers {
            layer.reorder(indices)?;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.layers.iter_mut().for_each(KeyValueCache::clear);
    }
}

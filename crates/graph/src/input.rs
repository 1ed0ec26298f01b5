//! Integer-id graph inputs produced by preprocessing.
//!
//! Two layouts are supported. The reified layout turns every relation into a
//! node and describes each slot by its node id, an edge-label id and the ids
//! of the two entities it connects. The role layout gives every slot a
//! structural role id and ships an explicit adjacency matrix.

use attention::masks::{padding_bias, padding_indicator, PAD_ID};
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::checks;
use serde::{Deserialize, Serialize};

/// Fixed number of node slots emitted by preprocessing.
pub const MAX_NODES: usize = 16;

/// Which of the two id layouts a model is built for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphLayout {
    #[default]
    Reified,
    Roles,
}

impl std::fmt::Display for GraphLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reified => f.write_str("reified"),
            Self::Roles => f.write_str("roles"),
        }
    }
}

/// One batch of graph inputs. All id tensors are `[batch, nodes]`, zero padded.
#[derive(Debug, Clone)]
pub enum GraphInput {
    Reified {
        nodes: Tensor,
        labels: Tensor,
        node1: Tensor,
        node2: Tensor,
    },
    Roles {
        nodes: Tensor,
        roles: Tensor,
        /// `[batch, nodes, nodes]`, nonzero where an edge exists.
        adjacency: Tensor,
    },
}

impl GraphInput {
    pub fn reified(nodes: Tensor, labels: Tensor, node1: Tensor, node2: Tensor) -> Result<Self> {
        let input = Self::Reified {
            nodes,
            labels,
            node1,
            node2,
        };
        input.validate()?;
        Ok(input)
    }

    pub fn roles(nodes: Tensor, roles: Tensor, adjacency: Tensor) -> Result<Self> {
        let input = Self::Roles {
            nodes,
            roles,
            adjacency,
        };
        input.validate()?;
        Ok(input)
    }

    pub fn layout(&self) -> GraphLayout {
        match self {
            Self::Reified { .. } => GraphLayout::Reified,
            Self::Roles { .. } => GraphLayout::Roles,
        }
    }

    pub fn nodes(&self) -> &Tensor {
        match self {
            Self::Reified { nodes, .. } | Self::Roles { nodes, .. } => nodes,
        }
    }

    pub fn device(&self) -> &Device {
        self.nodes().device()
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.nodes().dims2()?.0)
    }

    pub fn num_nodes(&self) -> Result<usize> {
        Ok(self.nodes().dims2()?.1)
    }

    /// Checks that every id tensor shares the `[batch, nodes]` layout of `nodes`.
    pub fn validate(&self) -> Result<()> {
        let nodes = self.nodes();
        checks::expect_rank("graph.nodes", nodes, 2)?;
        checks::expect_index_dtype("graph.nodes", nodes)?;
        let (batch, slots) = nodes.dims2()?;
        if slots == 0 {
            bail!("graph input must contain at least one node slot");
        }
        match self {
            Self::Reified {
                labels,
                node1,
                node2,
                ..
            } => {
                for (label, tensor) in [
                    ("graph.labels", labels),
                    ("graph.node1", node1),
                    ("graph.node2", node2),
                ] {
                    checks::expect_index_dtype(label, tensor)?;
                    checks::expect_shape(label, tensor, &[batch, slots])?;
                }
            }
            Self::Roles {
                roles, adjacency, ..
            } => {
                checks::expect_index_dtype("graph.roles", roles)?;
                checks::expect_shape("graph.roles", roles, &[batch, slots])?;
                checks::expect_shape("graph.adjacency", adjacency, &[batch, slots, slots])?;
            }
        }
        Ok(())
    }

    /// `[batch, nodes, nodes]` float adjacency with self-loops on every slot.
    ///
    /// Reified graphs connect every pair of non-padded slots; role graphs use
    /// the supplied matrix. Self-loops guarantee no row is entirely masked.
    pub fn adjacency(&self, dtype: DType) -> Result<Tensor> {
        let (batch, slots) = self.nodes().dims2()?;
        let device = self.device();
        let edges = match self {
            Self::Reified { nodes, .. } => {
                let present = nodes.ne(PAD_ID)?.to_dtype(DType::F32)?;
                present
                    .unsqueeze(2)?
                    .broadcast_mul(&present.unsqueeze(1)?)?
            }
            Self::Roles { adjacency, .. } => adjacency.to_dtype(DType::F32)?.ne(0f32)?.to_dtype(DType::F32)?,
        };
        let loops = identity_adjacency(batch, slots, device)?;
        edges.broadcast_maximum(&loops)?.to_dtype(dtype)
    }

    /// `[batch, nodes]` indicator that is `1.0` on padded slots.
    pub fn padding(&self) -> Result<Tensor> {
        padding_indicator(self.nodes())
    }

    /// `[batch, 1, 1, nodes]` bias hiding padded slots from attention readers.
    pub fn attention_bias(&self) -> Result<Tensor> {
        padding_bias(self.nodes())
    }
}

/// `[batch, nodes, nodes]` matrix holding only self-loops.
pub fn identity_adjacency(batch: usize, nodes: usize, device: &Device) -> Result<Tensor> {
    Tensor::eye(nodes, DType::F32, device)?
        .unsqueeze(0)?
        .broadcast_as((batch, nodes, nodes))?
        .contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const M: usize>(rows: &[[u32; 4]; M]) -> Result<Tensor> {
        Tensor::new(rows, &Device::Cpu)
    }

    #[test]
    fn reified_adjacency_connects_present_slots() -> Result<()> {
        let nodes = ids(&[[5, 7, 0, 0]])?;
        let zeros = nodes.zeros_like()?;
        let input = GraphInput::reified(nodes, zeros.clone(), zeros.clone(), zeros)?;
        let adjacency = input.adjacency(DType::F32)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(
            adjacency,
            vec![
                vec![1., 1., 0., 0.],
                vec![1., 1., 0., 0.],
                vec![0., 0., 1., 0.],
                vec![0., 0., 0., 1.],
            ]
        );
        Ok(())
    }

    #[test]
    fn role_adjacency_gains_self_loops() -> Result<()> {
        let device = Device::Cpu;
        let nodes = ids(&[[3, 4, 0, 0]])?;
        let roles = ids(&[[1, 2, 0, 0]])?;
        let mut raw = vec![0f32; 16];
        raw[1] = 1.0;
        let adjacency = Tensor::from_vec(raw, (1, 4, 4), &device)?;
        let input = GraphInput::roles(nodes, roles, adjacency)?;
        let resolved = input.adjacency(DType::F32)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(resolved[0], vec![1., 1., 0., 0.]);
        assert_eq!(resolved[1], vec![0., 1., 0., 0.]);
        assert_eq!(resolved[3], vec![0., 0., 0., 1.]);
        Ok(())
    }

    #[test]
    fn mismatched_role_tensor_is_rejected() -> Result<()> {
        let nodes = ids(&[[3, 4, 0, 0]])?;
        let roles = Tensor::new(&[[1u32, 2, 0]], &Device::Cpu)?;
        let adjacency = identity_adjacency(1, 4, &Device::Cpu)?;
        assert!(GraphInput::roles(nodes, roles, adjacency).is_err());
        Ok(())
    }

    #[test]
    fn float_node_ids_are_rejected() -> Result<()> {
        let nodes = Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?;
        let other = Tensor::zeros((1, 4), DType::U32, &Device::Cpu)?;
        assert!(GraphInput::reified(nodes, other.clone(), other.clone(), other).is_err());
        Ok(())
    }

    #[test]
    fn attention_bias_masks_padded_slots() -> Result<()> {
        let nodes = ids(&[[5, 0, 0, 0]])?;
        let zeros = nodes.zeros_like()?;
        let input = GraphInput::reified(nodes, zeros.clone(), zeros.clone(), zeros)?;
        let bias = input.attention_bias()?;
        assert_eq!(bias.dims(), &[1, 1, 1, 4]);
        assert_eq!(input.padding()?.to_vec2::<f32>()?, vec![vec![0., 1., 1., 1.]]);
        Ok(())
    }
}

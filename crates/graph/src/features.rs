//! Embedding of [`GraphInput`] ids into dense node and edge features.

use candle_core::{bail, DType, Device, Result, Tensor, Var};
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    PrecisionPolicy,
};

use crate::input::{GraphInput, GraphLayout};

/// Dense inputs of the graph encoder stack.
#[derive(Debug, Clone)]
pub struct GraphFeatures {
    /// `[batch, nodes, hidden]`
    pub nodes: Tensor,
    /// `[batch, nodes, hidden]` structural role of every slot.
    pub edges: Tensor,
    /// `[batch, nodes, hidden]` edge-label embeddings, reified inputs only.
    pub labels: Option<Tensor>,
    /// `[batch, nodes, nodes]` with self-loops.
    pub adjacency: Tensor,
}

/// Looks up node, label and role ids.
///
/// Node, label and endpoint ids share the source vocabulary table. For
/// reified inputs the two endpoint embeddings are concatenated and projected
/// back to `hidden`; role inputs use a separate role table. Only the part the
/// chosen layout reads is allocated.
#[derive(Debug, Clone)]
pub struct GraphEmbedder {
    source: TokenEmbedding,
    edges: EdgeEmbedding,
    policy: PrecisionPolicy,
}

#[derive(Debug, Clone)]
enum EdgeEmbedding {
    Endpoints(Linear),
    Roles(TokenEmbedding),
}

fn lookup_table(vocab_size: usize, hidden_size: usize, device: &Device, dtype: DType) -> Result<TokenEmbedding> {
    let mut config = TokenEmbeddingConfig::new(vocab_size, hidden_size, dtype, device);
    config.scale_by_sqrt_dim = false;
    TokenEmbedding::new(config)
}

impl GraphEmbedder {
    /// Embedder for [`GraphInput::Reified`] batches.
    pub fn reified(vocab_size: usize, hidden_size: usize, device: &Device, dtype: DType) -> Result<Self> {
        let node_role = Linear::with_init(
            LinearConfig::new(2 * hidden_size, hidden_size),
            LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            source: lookup_table(vocab_size, hidden_size, device, dtype)?,
            edges: EdgeEmbedding::Endpoints(node_role),
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Embedder for [`GraphInput::Roles`] batches.
    pub fn roles(
        vocab_size: usize,
        role_vocab_size: usize,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        Ok(Self {
            source: lookup_table(vocab_size, hidden_size, device, dtype)?,
            edges: EdgeEmbedding::Roles(lookup_table(role_vocab_size, hidden_size, device, dtype)?),
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn layout(&self) -> GraphLayout {
        match self.edges {
            EdgeEmbedding::Endpoints(_) => GraphLayout::Reified,
            EdgeEmbedding::Roles(_) => GraphLayout::Roles,
        }
    }

    pub fn source_embedding(&self) -> &TokenEmbedding {
        &self.source
    }

    pub fn embed(&self, input: &GraphInput) -> Result<GraphFeatures> {
        input.validate()?;
        let nodes = self.source.forward(input.nodes())?;
        let adjacency = input.adjacency(nodes.dtype())?;
        match (input, &self.edges) {
            (
                GraphInput::Reified {
                    labels,
                    node1,
                    node2,
                    ..
                },
                EdgeEmbedding::Endpoints(node_role),
            ) => {
                let endpoints = Tensor::cat(
                    &[&self.source.forward(node1)?, &self.source.forward(node2)?],
                    2,
                )?;
                Ok(GraphFeatures {
                    nodes,
                    edges: node_role.forward(&endpoints, &self.policy)?,
                    labels: Some(self.source.forward(labels)?),
                    adjacency,
                })
            }
            (GraphInput::Roles { roles, .. }, EdgeEmbedding::Roles(table)) => Ok(GraphFeatures {
                nodes,
                edges: table.forward(roles)?,
                labels: None,
                adjacency,
            }),
            _ => bail!(
                "embedder built for {} graphs received a {} input",
                self.layout(),
                input.layout()
            ),
        }
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.source.named_parameters(&format!("{scope}.source"));
        match &self.edges {
            EdgeEmbedding::Endpoints(node_role) => {
                params.extend(node_role.named_parameters(&format!("{scope}.node_role")))
            }
            EdgeEmbedding::Roles(table) => params.extend(table.named_parameters(&format!("{scope}.roles"))),
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::identity_adjacency;

    #[test]
    fn reified_features_share_the_node_layout() -> Result<()> {
        let device = Device::Cpu;
        let embedder = GraphEmbedder::reified(20, 8, &device, DType::F32)?;
        let nodes = Tensor::new(&[[5u32, 7, 9, 0]], &device)?;
        let labels = Tensor::new(&[[0u32, 11, 0, 0]], &device)?;
        let input = GraphInput::reified(nodes.clone(), labels, nodes.clone(), nodes)?;
        let features = embedder.embed(&input)?;
        assert_eq!(features.nodes.dims(), &[1, 4, 8]);
        assert_eq!(features.edges.dims(), &[1, 4, 8]);
        assert_eq!(features.labels.as_ref().map(|t| t.dims().to_vec()), Some(vec![1, 4, 8]));
        assert_eq!(features.adjacency.dims(), &[1, 4, 4]);

        let padded = features.nodes.narrow(1, 3, 1)?.abs()?.sum_all()?.to_vec0::<f32>()?;
        assert_eq!(padded, 0.0);
        Ok(())
    }

    #[test]
    fn role_features_have_no_labels() -> Result<()> {
        let device = Device::Cpu;
        let embedder = GraphEmbedder::roles(20, 4, 8, &device, DType::F32)?;
        let input = GraphInput::roles(
            Tensor::new(&[[5u32, 7]], &device)?,
            Tensor::new(&[[1u32, 3]], &device)?,
            identity_adjacency(1, 2, &device)?,
        )?;
        let features = embedder.embed(&input)?;
        assert!(features.labels.is_none());
        assert_eq!(features.edges.dims(), &[1, 2, 8]);
        Ok(())
    }

    #[test]
    fn only_the_layout_parameters_are_allocated() -> Result<()> {
        let device = Device::Cpu;
        let names = |embedder: &GraphEmbedder| -> Vec<String> {
            embedder
                .named_parameters("embedder")
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        };

        let roles = names(&GraphEmbedder::roles(20, 4, 8, &device, DType::F32)?);
        assert!(roles.iter().any(|name| name.starts_with("embedder.roles")));
        assert!(!roles.iter().any(|name| name.starts_with("embedder.node_role")));

        let reified = names(&GraphEmbedder::reified(20, 8, &device, DType::F32)?);
        assert!(reified.iter().any(|name| name.starts_with("embedder.node_role")));
        assert!(!reified.iter().any(|name| name.starts_with("embedder.roles")));
        Ok(())
    }

    #[test]
    fn mismatched_layout_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let embedder = GraphEmbedder::reified(20, 8, &device, DType::F32)?;
        assert_eq!(embedder.layout(), GraphLayout::Reified);
        let input = GraphInput::roles(
            Tensor::new(&[[5u32, 7]], &device)?,
            Tensor::new(&[[1u32, 3]], &device)?,
            identity_adjacency(1, 2, &device)?,
        )?;
        let err = embedder.embed(&input).unwrap_err();
        assert!(err.to_string().contains("reified"));
        Ok(())
    }
}

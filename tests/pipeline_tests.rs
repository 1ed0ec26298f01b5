use std::io::Write;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use graph2text::{
    graph::identity_adjacency, setup_device, BeamSearchConfig, ExperimentConfig, GraphInput,
    Trainer, MAX_NODES,
};

const CONFIG: &str = r#"
[model]
src_vocab_size = 24
tgt_vocab_size = 20
role_vocab_size = 4
hidden_size = 16
filter_size = 32
num_layers = 2
num_heads = 2
seed = 7

[model.encoder]
kind = "graph"
layout = "roles"

[decoding]
beam_size = 3
alpha = 0.6
max_decode_length = 5
eos_id = 2

[scheduler]
strategy = "noam"
warmup_steps = 20
"#;

fn row(ids: &[u32]) -> Vec<u32> {
    let mut data = vec![0u32; MAX_NODES];
    data[..ids.len()].copy_from_slice(ids);
    data
}

fn role_graph(device: &Device) -> Result<GraphInput> {
    let nodes = Tensor::from_vec(row(&[5, 7, 9]), (1, MAX_NODES), device)?;
    let roles = Tensor::from_vec(row(&[1, 2, 3]), (1, MAX_NODES), device)?;
    Ok(GraphInput::roles(
        nodes,
        roles,
        identity_adjacency(1, MAX_NODES, device)?,
    )?)
}

#[test]
fn device_setup_succeeds() {
    assert!(setup_device().is_ok());
}

#[test]
fn configured_pipeline_trains_and_decodes() -> Result<()> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(CONFIG.as_bytes())?;
    let config = ExperimentConfig::from_path(file.path())?;

    let device = Device::Cpu;
    let mut trainer = Trainer::new(&config, &device)?;
    let input = role_graph(&device)?;
    let targets = Tensor::new(&[[6u32, 11, 2, 0]], &device)?;
    for _ in 0..3 {
        let snapshot = trainer.train_step(&input, &targets)?;
        assert!(snapshot.step_loss.is_finite());
    }

    let prediction = trainer.predict(&input)?;
    let sequence = &prediction.sequences[0];
    assert!(!sequence.is_empty() && sequence.len() <= 5);
    assert!(!sequence[..sequence.len() - 1].contains(&2));
    assert_eq!(prediction.outputs.dtype(), DType::U32);
    assert_eq!(prediction.scores.dims(), &[1]);
    Ok(())
}

#[test]
fn one_beam_matches_greedy_through_the_facade() -> Result<()> {
    let config: ExperimentConfig = {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(CONFIG.as_bytes())?;
        ExperimentConfig::from_path(file.path())?
    };
    let model = graph2text::Graph2Text::new(config.resolve_model_config(&Device::Cpu)?)?;
    let input = role_graph(&Device::Cpu)?;
    let beam = model.predict(&input, &BeamSearchConfig::greedy(5, 2))?;
    let greedy = model.predict_greedy(&input, 5, 2)?;
    assert_eq!(beam.sequences, greedy.sequences);
    Ok(())
}

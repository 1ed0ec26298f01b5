use std::collections::HashSet;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use generation::BeamSearchConfig;
use graph::{identity_adjacency, GraphInput, MAX_NODES};
use model::{shift_right, DecoderKind, EncoderKind, Graph2Text, ModelConfig};

const SRC_VOCAB: usize = 40;
const TGT_VOCAB: usize = 30;
const EOS: u32 = 2;

fn config(encoder: EncoderKind, decoder: DecoderKind) -> ModelConfig {
    let mut config = ModelConfig::new(encoder, decoder, SRC_VOCAB, TGT_VOCAB);
    config.hidden_size = 16;
    config.filter_size = 32;
    config.num_layers = 2;
    config.num_heads = 4;
    config
}

fn padded(ids: &[u32], batch: usize) -> Result<Tensor> {
    let mut data = vec![0u32; batch * MAX_NODES];
    for row in 0..batch {
        data[row * MAX_NODES..row * MAX_NODES + ids.len()].copy_from_slice(ids);
    }
    Ok(Tensor::from_vec(data, (batch, MAX_NODES), &Device::Cpu)?)
}

fn reified_input(batch: usize) -> Result<GraphInput> {
    Ok(GraphInput::reified(
        padded(&[5, 7, 9, 11], batch)?,
        padded(&[0, 13, 0, 14], batch)?,
        padded(&[5, 5, 9, 9], batch)?,
        padded(&[5, 9, 9, 7], batch)?,
    )?)
}

fn role_input() -> Result<GraphInput> {
    Ok(GraphInput::roles(
        padded(&[5, 7, 9], 1)?,
        padded(&[1, 2, 3], 1)?,
        identity_adjacency(1, MAX_NODES, &Device::Cpu)?,
    )?)
}

fn targets(batch: usize) -> Result<Tensor> {
    let row = [4u32, 8, 15, 16, EOS, 0];
    let data: Vec<u32> = (0..batch).flat_map(|_| row).collect();
    Ok(Tensor::from_vec(data, (batch, row.len()), &Device::Cpu)?)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_vec0::<f32>()?)
}

fn all_combinations() -> Vec<(EncoderKind, DecoderKind)> {
    let encoders = [EncoderKind::graph(), EncoderKind::Transformer, EncoderKind::Recurrent];
    let decoders = [
        DecoderKind::transformer(),
        DecoderKind::Transformer {
            tie_embeddings: false,
        },
        DecoderKind::Recurrent,
    ];
    encoders
        .iter()
        .flat_map(|e| decoders.iter().map(move |d| (*e, *d)))
        .collect()
}

#[test]
fn every_variant_pair_trains_and_predicts() -> Result<()> {
    for (encoder, decoder) in all_combinations() {
        let model = Graph2Text::new(config(encoder, decoder))?;
        let input = reified_input(2)?;
        let output = model.train_forward(&input, &targets(2)?, true)?;
        assert_eq!(output.logits.dims(), &[2, 6, TGT_VOCAB]);
        assert_eq!(output.loss.is_some(), decoder == DecoderKind::Recurrent);

        let prediction = model.predict(&input, &BeamSearchConfig::new(3, 0.6, 4, EOS))?;
        assert_eq!(prediction.scores.dims(), &[2]);
        assert_eq!(prediction.outputs.dims()[0], 2);
        assert!(prediction.sequences.iter().all(|s| !s.is_empty() && s.len() <= 4));
    }
    Ok(())
}

#[test]
fn indivisible_heads_fail_before_building() {
    let mut cfg = config(EncoderKind::graph(), DecoderKind::transformer());
    cfg.hidden_size = 10;
    cfg.num_heads = 3;
    assert!(Graph2Text::new(cfg).is_err());
}

#[test]
fn incremental_decoding_matches_full_pass() -> Result<()> {
    for decoder in [DecoderKind::transformer(), DecoderKind::Recurrent] {
        let model = Graph2Text::new(config(EncoderKind::graph(), decoder))?;
        let input = reified_input(2)?;
        let encoded = model.encode(&input, false)?;
        let targets = Tensor::new(&[[4u32, 8, 15, 16, 23], [3, 9, 27, 6, 12]], &Device::Cpu)?;
        let decoder_input = shift_right(&targets, model.config().start_id)?;
        let full = model
            .decoder()
            .forward_teacher_forced(&decoder_input, &targets, &encoded, false)?
            .logits;

        let mut cache = model.decoder().start_incremental(&encoded)?;
        for t in 0..5 {
            let step = model
                .decoder()
                .step(&decoder_input.narrow(1, t, 1)?, t, &encoded, &mut cache)?;
            let expected = full.narrow(1, t, 1)?.squeeze(1)?;
            assert!(max_diff(&step, &expected)? < 1e-4, "{decoder:?} position {t}");
        }
    }
    Ok(())
}

#[test]
fn decoder_positions_ignore_later_tokens() -> Result<()> {
    let model = Graph2Text::new(config(EncoderKind::Transformer, DecoderKind::transformer()))?;
    let input = reified_input(1)?;
    let encoded = model.encode(&input, false)?;
    let original = Tensor::new(&[[1u32, 4, 8, 15, 16]], &Device::Cpu)?;
    let altered = Tensor::new(&[[1u32, 4, 8, 22, 3]], &Device::Cpu)?;
    let decode = |ids: &Tensor| {
        model
            .decoder()
            .forward_teacher_forced(ids, ids, &encoded, false)
            .map(|out| out.logits)
    };
    let a = decode(&original)?;
    let b = decode(&altered)?;
    assert!(max_diff(&a.narrow(1, 0, 3)?, &b.narrow(1, 0, 3)?)? < 1e-5);
    assert!(max_diff(&a.narrow(1, 3, 2)?, &b.narrow(1, 3, 2)?)? > 0.0);
    Ok(())
}

#[test]
fn single_beam_prediction_equals_greedy() -> Result<()> {
    for decoder in [DecoderKind::transformer(), DecoderKind::Recurrent] {
        let model = Graph2Text::new(config(EncoderKind::graph(), decoder))?;
        let input = reified_input(3)?;
        let beam = model.predict(&input, &BeamSearchConfig::new(1, 0.6, 7, EOS))?;
        let greedy = model.predict_greedy(&input, 7, EOS)?;
        assert_eq!(beam.sequences, greedy.sequences);
    }
    Ok(())
}

#[test]
fn three_node_graph_decodes_within_five_steps() -> Result<()> {
    let model = Graph2Text::new(config(EncoderKind::graph_with_roles(), DecoderKind::transformer()))?;
    let prediction = model.predict(&role_input()?, &BeamSearchConfig::new(1, 0.6, 5, EOS))?;
    let sequence = &prediction.sequences[0];
    assert!(!sequence.is_empty() && sequence.len() <= 5);
    let last = *sequence.last().unwrap_or(&0);
    assert!(last == EOS || sequence.len() == 5);
    assert!(!sequence[..sequence.len() - 1].contains(&EOS));
    assert_eq!(prediction.outputs.dtype(), DType::U32);
    Ok(())
}

#[test]
fn graph_encoder_rejects_the_other_layout() -> Result<()> {
    let model = Graph2Text::new(config(EncoderKind::graph(), DecoderKind::transformer()))?;
    assert!(model.predict(&role_input()?, &BeamSearchConfig::new(1, 0.6, 5, EOS)).is_err());
    let names: Vec<String> = model.named_parameters().into_iter().map(|(name, _)| name).collect();
    assert!(!names.iter().any(|name| name.contains(".roles.")));
    Ok(())
}

#[test]
fn parameter_names_are_unique() -> Result<()> {
    for (encoder, decoder) in all_combinations() {
        let model = Graph2Text::new(config(encoder, decoder))?;
        let params = model.named_parameters();
        let names: HashSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names.len(), params.len(), "{encoder:?}/{decoder:?}");
    }
    Ok(())
}

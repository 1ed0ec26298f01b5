//! Graph-to-text generation: a graph-attention encoder over RDF-derived
//! graphs, a transformer decoder with an incremental cache, and beam search.
//!
//! The member crates are re-exported under their own names; the most used
//! types are also available at the root.

pub use attention;
pub use embedding;
pub use generation;
pub use graph;
pub use layers;
pub use model;
pub use training;

pub use generation::{BeamSearchConfig, BeamSearchOutput};
pub use graph::{GraphInput, MAX_NODES};
pub use model::{DecoderKind, EncoderKind, Graph2Text, ModelConfig, Prediction, TrainOutput};
pub use training::{ExperimentConfig, Trainer, TrainingError};

use anyhow::Result;
#[cfg(feature = "metal")]
use candle_core::DType;
use candle_core::Device;

/// Picks Metal, then CUDA, then CPU. `CANDLE_FORCE_CPU` skips accelerators.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        use std::panic::AssertUnwindSafe;

        let metal_device = std::panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        if let Ok(Ok(device)) = metal_device {
            if metal_preflight(&device).is_ok() {
                log::info!("Metal device selected: {:?}", device);
                return Ok(device);
            }
            log::warn!("Metal device detected but preflight failed, falling back");
        } else {
            log::debug!("Metal unavailable, falling back");
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Exercises the kernels the model relies on: matmul, softmax, gather.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use candle_core::Tensor;

    let x = Tensor::randn(0.0f32, 1.0f32, (2, 16, 8), device)?;
    let scores = x.matmul(&x.transpose(1, 2)?)?;
    let _ = candle_nn::ops::softmax_last_dim(&scores)?;

    let host = (0..16u32).collect::<Vec<_>>();
    let indices = Tensor::from_vec(host, (16,), &Device::Cpu)?.to_device(device)?;
    let table = Tensor::randn(0.0f32, 1.0f32, (16, 8), device)?;
    let _ = table.index_select(&indices.to_dtype(DType::U32)?, 0)?;
    Ok(())
}

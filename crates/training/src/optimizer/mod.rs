use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config::OptimizerSection, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub clip_global_norm: Option<f64>,
}

impl From<&OptimizerSection> for AdamWConfig {
    fn from(value: &OptimizerSection) -> Self {
        Self {
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            clip_global_norm: value.clip_global_norm,
        }
    }
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self::from(&OptimizerSection::default())
    }
}

/// AdamW over named parameters. The learning rate is supplied per step by
/// the schedule; moments are kept in f32 and so are master copies of
/// reduced-precision parameters.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// Norms and layer-norm parameters are not decayed.
fn should_apply_weight_decay(name: &str) -> bool {
    !(name.ends_with(".bias") || name.contains("norm"))
}

impl AdamW {
    pub fn new(named_parameters: Vec<(String, Var)>, config: AdamWConfig) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let dtype = tensor.dtype();
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            let second_moment = first_moment.zeros_like()?;
            let master = if dtype != DType::F32 {
                Some(Var::from_tensor(&tensor.to_dtype(DType::F32)?)?)
            } else {
                None
            };
            params.push(ParameterSlot {
                apply_weight_decay: should_apply_weight_decay(&name),
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }
        log::debug!("adamw over {} parameter tensors", params.len());

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update at `learning_rate` and returns the global gradient
    /// norm measured before clipping. Parameters without a gradient are left
    /// untouched.
    pub fn step(&mut self, grads: &GradStore, learning_rate: f64) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let norm_sq = grad.sqr()?.sum_all()?.to_vec0::<f32>()? as f64;
            processed.push((index, grad, norm_sq));
        }
        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm = processed.iter().map(|(_, _, sq)| sq).sum::<f64>().sqrt();
        if !total_norm.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite gradient norm {total_norm}"
            )));
        }
        let clip_scale = match self.config.clip_global_norm {
            Some(max_norm) if total_norm > max_norm => Some(max_norm / (total_norm + EPS)),
            _ => None,
        };

        self.step += 1;
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(self.step as i32)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(self.step as i32)).max(EPS);

        for (index, grad, _) in processed {
            let slot = &mut self.params[index];
            let grad = match clip_scale {
                Some(scale) => grad.affine(scale, 0.0)?,
                None => grad,
            };

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)? + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = new_m
                .affine(scale_m, 0.0)?
                .div(&denom)?
                .affine(learning_rate, 0.0)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot.param.as_tensor().to_dtype(DType::F32)?,
            };
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };
            let next = decayed.sub(&update)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next)?;
            }
            if slot.dtype == DType::F32 {
                slot.param.set(&next)?;
            } else {
                slot.param.set(&next.to_dtype(slot.dtype)?)?;
            }
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(total_norm)
    }
}

//! Dense affine projections.
//!
//! `Linear` accepts any input whose trailing dimension equals `input_dim`; the
//! leading dimensions are flattened for the matmul and restored afterwards, so
//! `(batch, nodes, in)`, `(batch, seq, in)` and `(rows, in)` all work. Weights
//! are stored as [`Var`]s shaped `(output_dim, input_dim)` so gradients reach
//! them during teacher-forced training.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Whether a learnable bias vector is added after the projection.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration with a bias term.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a configuration without a bias term.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    fn config(&self) -> &LinearConfig;

    /// Applies the projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearInit {
    /// Glorot uniform, the default kernel initialiser for dense layers.
    XavierUniform,
    /// Glorot normal.
    XavierNormal,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let fan_sum = (in_dim + out_dim) as f64;
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / fan_sum).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / fan_sum).sqrt() as f32;
                Tensor::randn(0f32, std, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        let bias = match bias {
            Some(bias) => Some(Var::from_tensor(&bias)?),
            None => None,
        };
        Ok(Self {
            weight: Var::from_tensor(&weight)?,
            bias,
            config,
        })
    }

    /// Builds a linear layer with random weights and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Overwrites the weight in place, keeping its dtype.
    pub fn set_weight(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        self.weight.set(&value.to_dtype(self.weight.dtype())?)
    }

    /// Overwrites the bias in place.
    pub fn set_bias(&self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(bias) => {
                Self::validate_bias(&self.config, Some(value))?;
                bias.set(&value.to_dtype(bias.dtype())?)
            }
            None => Err(Error::Msg("layer has no bias to copy into".into())),
        }
    }

    /// Trainable parameters under `scope`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{scope}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{scope}.bias"), bias.clone()));
        }
        params
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => checks::expect_shape("linear.bias", tensor, &[config.output_dim]),
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if hidden.rank() < 2 {
            return Err(Error::Msg(format!(
                "linear expects at least [rows, {}], got {:?}",
                self.config.input_dim,
                hidden.dims()
            )));
        }
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;

        let dims = hidden.dims();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let input = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.input_dim))?;
        let weight = policy.cast_for_matmul(self.weight.as_tensor())?;
        let mut output = input.matmul(&weight.t()?)?;

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias.as_tensor())?)?;
        }

        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.output_dim);
        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .broadcast_add(bias)?
            .reshape((batch, seq, weight.dim(0)?))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4);
        let weight = Tensor::randn(0f32, 0.05, (4, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 4, &device)?;

        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input, &policy)?;
            assert_eq!(output.dims(), &[2, 5, 4]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, &bias)?;
            let diff = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = if dtype == DType::F32 { 1e-5 } else { 5e-2 };
            assert!(diff < tol, "dtype {dtype:?} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn leading_dimensions_are_preserved() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::without_bias(6, 3),
            LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let four_d = Tensor::ones((2, 2, 4, 6), DType::F32, &device)?;
        assert_eq!(linear.forward(&four_d, &policy)?.dims(), &[2, 2, 4, 3]);
        let rows = Tensor::ones((7, 6), DType::F32, &device)?;
        assert_eq!(linear.forward(&rows, &policy)?.dims(), &[7, 3]);
        assert!(linear.forward(&Tensor::ones((7, 5), DType::F32, &device)?, &policy).is_err());
        Ok(())
    }

    #[test]
    fn xavier_uniform_respects_bound() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(64, 32),
            LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let bound = (6.0f32 / 96.0).sqrt();
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound);
        let bias = linear.bias().map(|b| b.sum_all()).transpose()?;
        assert_eq!(bias.map(|b| b.to_vec0::<f32>()).transpose()?, Some(0.0));
        Ok(())
    }

    #[test]
    fn set_weight_updates_named_parameter() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::without_bias(2, 2),
            LinearInit::XavierNormal,
            &device,
            DType::F32,
        )?;
        let identity = Tensor::new(&[[1f32, 0.], [0., 1.]], &device)?;
        linear.set_weight(&identity)?;
        let params = linear.named_parameters("proj");
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "proj.weight");
        assert_eq!(params[0].1.as_tensor().to_vec2::<f32>()?, vec![vec![1., 0.], vec![0., 1.]]);
        Ok(())
    }
}

//! Precision policy shared by every layer.
//!
//! Parameters may be stored in `f16`/`bf16` while matmuls and activations run in
//! `f32`. Reductions such as layer-norm statistics and softmax denominators are
//! always promoted to `f32`.

use candle_core::{DType, Result, Tensor};

/// Comparison tolerances for the three phases of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    pub storage: f32,
    pub compute: f32,
    pub reduction: f32,
}

/// Describes how tensors are cast while flowing through a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype, promoting half types.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
            reduction: epsilon_for(self.reduction),
        }
    }

    /// Casts a tensor to the compute dtype ahead of a matmul.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

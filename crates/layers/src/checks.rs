//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor under inspection so failures
//! read like `gat.adjacency: expected shape [2, 16, 16], got [2, 16]`. All of
//! them return `candle_core::Result<()>` so call sites propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures a tensor has the requested number of dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {actual} ({:?})",
            tensor.dims()
        )))
    }
}

/// Validates that the trailing dimension equals `size`.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(last) if *last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dimension {size}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks that token-id tensors carry an integer dtype accepted by `index_select`.
pub fn expect_index_dtype(label: &str, tensor: &Tensor) -> Result<()> {
    expect_dtype_in(label, tensor, &[DType::U8, DType::U32, DType::I64])
}

/// Requires two tensors to share a dtype.
pub fn expect_same_dtype(
    left_label: &str,
    left: &Tensor,
    right_label: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_label} ({:?}) and {right_label} ({:?}) must share a dtype",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Rejects casts that would silently truncate floating point data into integers.
pub fn ensure_cast_supported(label: &str, from: DType, to: DType) -> Result<()> {
    if from.is_float() && !to.is_float() {
        Err(Error::Msg(format!(
            "{label}: refusing to cast {:?} to non-float {:?}",
            from, to
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_errors_mention_label() -> Result<()> {
        let tensor = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let err = expect_shape("probe", &tensor, &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("probe"));
        expect_rank("probe", &tensor, 2)?;
        expect_last_dim("probe", &tensor, 3)?;
        assert!(expect_batch_seq_hidden("probe", &tensor, 3).is_err());
        Ok(())
    }

    #[test]
    fn index_dtypes_are_accepted() -> Result<()> {
        let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
        expect_index_dtype("ids", &ids)?;
        let floats = ids.to_dtype(DType::F32)?;
        assert!(expect_index_dtype("ids", &floats).is_err());
        assert!(ensure_cast_supported("cast", DType::F32, DType::U32).is_err());
        Ok(())
    }
}

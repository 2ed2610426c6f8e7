//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

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

/// Ensures a tensor has the requested rank.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(seq, batch, hidden)` convention with a known hidden size.
pub fn expect_seq_batch_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (seq, batch, {hidden}) layout, got {:?}",
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

/// Checks that two tensors share a dtype.
pub fn expect_same_dtype(label: &str, tensor: &Tensor, other_label: &str, other: &Tensor) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label} has dtype {:?} but {other_label} has {:?}",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn seq_batch_hidden_rejects_wrong_hidden() -> Result<()> {
        let t = Tensor::zeros((4, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(expect_seq_batch_hidden("x", &t, 8).is_ok());
        assert!(expect_seq_batch_hidden("x", &t, 6).is_err());
        assert!(expect_rank("x", &t, 2).is_err());
        Ok(())
    }
}

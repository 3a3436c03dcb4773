//! Size and source propagation.
//!
//! `size` (`[B, T, 1]`) counts the original tokens folded into each current
//! token; `source` (`[B, T, T_original]`) records which ones. Both are pure
//! functions of the incoming tensor and the layer's [`Merge`].

use crate::error::{ReductionError, Result};
use crate::merge::{Merge, ReduceMode};
use crate::tensor::TokenTensor;

/// Size-weighted average merge.
///
/// Embeddings are scaled by size, summed into their receivers and divided by
/// the merged size. A missing `size` means every token has size one. Returns
/// `(merged, merged_size)`; identity merges return both inputs unchanged.
pub fn merge_wavg(merge: &Merge, x: &TokenTensor, size: Option<&TokenTensor>) -> Result<(TokenTensor, TokenTensor)> {
    let ones;
    let size = match size {
        Some(s) => s,
        None => {
            ones = TokenTensor::ones_size(x.batch, x.tokens);
            &ones
        }
    };
    if merge.is_identity() {
        x.expect_tokens(merge.batch(), merge.tokens_in(), "merged tensor")?;
        size.expect_tokens(x.batch, x.tokens, "size tensor")?;
        return Ok((x.clone(), size.clone()));
    }

    let weighted = x.scale_rows(size)?;
    let merged = merge.apply(&weighted, ReduceMode::Sum)?;
    let merged_size = merge.apply(size, ReduceMode::Sum)?;
    Ok((merged.divide_rows(&merged_size)?, merged_size))
}

/// Merge a size tensor (sum), starting from ones when absent.
pub fn merge_size(merge: &Merge, size: Option<&TokenTensor>) -> Result<TokenTensor> {
    match size {
        Some(s) => merge.apply(s, ReduceMode::Sum),
        None => merge.apply(&TokenTensor::ones_size(merge.batch(), merge.tokens_in()), ReduceMode::Sum),
    }
}

/// Merge a source tensor (max), starting from identity provenance when absent.
pub fn merge_source(merge: &Merge, source: Option<&TokenTensor>) -> Result<TokenTensor> {
    match source {
        Some(s) => merge.apply(s, ReduceMode::Amax),
        None => merge.apply(
            &TokenTensor::identity_source(merge.batch(), merge.tokens_in()),
            ReduceMode::Amax,
        ),
    }
}

/// Merge an attention mask (`[B, T, 1]`): a merged token is valid when any
/// of its members was.
pub fn merge_attention_mask(merge: &Merge, mask: &TokenTensor) -> Result<TokenTensor> {
    merge.apply(mask, ReduceMode::Amax)
}

/// Additive attention bias `ln(size)` for proportional attention.
pub fn log_size_bias(size: &TokenTensor) -> Result<TokenTensor> {
    if size.channels != 1 {
        return Err(ReductionError::ShapeMismatch(format!(
            "size tensor must have one channel, found {}",
            size.channels
        )));
    }
    let mut out = size.clone();
    out.data.iter_mut().for_each(|v| *v = v.ln());
    Ok(out)
}

/// Current token holding original token `original` of batch element `b`.
///
/// Returns `None` when the index is out of range or no current token
/// records it.
pub fn source_owner(source: &TokenTensor, b: usize, original: usize) -> Option<usize> {
    if b >= source.batch || original >= source.channels {
        return None;
    }
    (0..source.tokens).find(|&t| source.row(b, t)[original] > 0.0)
}

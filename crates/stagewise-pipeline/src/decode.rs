//! Greedy next-token selection and next-step inputs.

use stagewise_types::{Tensor, TensorView};

use crate::error::{PipelineError, Result};

/// Next token per batch row and whether every row hit end-of-sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTokens {
    pub ids: Vec<i64>,
    pub all_eos: bool,
}

impl NextTokens {
    /// `[batch, 1]` input ids for the next step.
    pub fn to_input_ids(&self) -> Tensor {
        Tensor::from_i64(vec![self.ids.len() as i64, 1], &self.ids)
    }
}

/// Index of the largest value. Ties go to the lowest index; NaN never wins.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Pick the arg-max id at the last sequence position of every batch row.
///
/// `logits` is `[batch, seq, vocab]` (or `[batch, vocab]` for a single
/// position) in any floating point dtype. Higher ranks are rejected.
pub fn greedy_next_tokens(
    logits: &TensorView<'_>,
    batch_size: usize,
    eos_token_id: i64,
) -> Result<NextTokens> {
    let rank = logits.shape.len();
    if !(2..=3).contains(&rank) {
        return Err(PipelineError::Execution(format!(
            "logits must be [batch, vocab] or [batch, seq, vocab], got {:?}",
            logits.shape
        )));
    }
    let vocab = logits.dim(rank - 1).filter(|&v| v > 0);
    let seq = if rank == 2 { Some(1) } else { logits.dim(rank - 2).filter(|&s| s > 0) };
    let batch = logits.dim(0);
    let (Some(vocab), Some(seq), Some(batch)) = (vocab, seq, batch) else {
        return Err(PipelineError::Execution(format!(
            "logits shape {:?} has no concrete batch/sequence/vocab",
            logits.shape
        )));
    };
    if batch != batch_size {
        return Err(PipelineError::Execution(format!(
            "logits batch {batch} does not match request batch {batch_size}"
        )));
    }

    let width = logits.dtype.element_bytes();
    let row_bytes = seq * vocab * width;
    if logits.data.len() < batch * row_bytes {
        return Err(PipelineError::Execution(format!(
            "logits hold {} bytes, shape {:?} needs {}",
            logits.data.len(),
            logits.shape,
            batch * row_bytes
        )));
    }

    let last = (seq - 1) * vocab * width;
    let mut ids = Vec::with_capacity(batch);
    for row in 0..batch {
        let start = row * row_bytes + last;
        let position = TensorView {
            dtype: logits.dtype,
            shape: &[],
            data: &logits.data[start..start + vocab * width],
        };
        let id = argmax(&position.to_f32_vec()).ok_or_else(|| {
            PipelineError::Execution(format!("logits of batch row {row} are all NaN"))
        })?;
        ids.push(id as i64);
    }

    let all_eos = ids.iter().all(|&id| id == eos_token_id);
    Ok(NextTokens { ids, all_eos })
}

/// `[batch, 1]` position ids for decoding `step` of a prompt of `orig_len`
/// tokens. Step 1 consumes the first generated token at position `orig_len`.
pub fn next_position_ids(batch_size: usize, orig_len: usize, step: usize) -> Tensor {
    let position = (orig_len + step).saturating_sub(1) as i64;
    Tensor::from_i64(vec![batch_size as i64, 1], &vec![position; batch_size])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

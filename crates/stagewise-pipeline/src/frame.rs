//! Per-request execution state that outlives every token of the request.
//!
//! Each stage keeps two same-sized buffers per past/present pair. Step `s`
//! reads the cache written at step `s - 1` and writes the other buffer, so
//! an invocation never overwrites the state it is reading:
//!
//! ```text
//! step:    0        1        2        3
//! read:    A(len 0) B        A        B
//! write:   B        A        B        A
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use stagewise_types::config::AxisPair;
use stagewise_types::tensor::element_count;
use stagewise_types::{DevicePlacement, PipelineConfig, Tensor, TensorDtype, TensorView};

use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::token::{RequestId, TensorHandle};

// ── Buffer slots ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSlot {
    A,
    B,
}

impl BufferSlot {
    /// Slot written by the invocation at `step`. Step 0 reads the empty
    /// cache initialised in `A`, so even steps write `B`.
    pub fn written_at_step(step: usize) -> Self {
        if step % 2 == 0 {
            Self::B
        } else {
            Self::A
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Most recent value produced for one present output.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub slot: BufferSlot,
    pub shape: Vec<i64>,
    pub dtype: TensorDtype,
}

#[derive(Debug)]
pub(crate) struct CachePair {
    pub(crate) past: String,
    pub(crate) present: String,
    pub(crate) dtype: TensorDtype,
    /// Batch axis already fixed; sequence axis holds `max_seq_len`.
    template: Vec<i64>,
    pub(crate) a: Vec<u8>,
    pub(crate) b: Vec<u8>,
}

impl CachePair {
    pub(crate) fn shape_with_seq(&self, seq_axis: usize, len: usize) -> Vec<i64> {
        with_dim(&self.template, seq_axis, len)
    }

    pub(crate) fn buffer(&self, slot: BufferSlot) -> &[u8] {
        match slot {
            BufferSlot::A => &self.a,
            BufferSlot::B => &self.b,
        }
    }
}

#[derive(Debug)]
pub(crate) struct StageState {
    pub(crate) caches: Vec<CachePair>,
    /// present name → entry
    pub(crate) entries: HashMap<String, CacheEntry>,
}

#[derive(Debug)]
pub(crate) struct ScratchBuffer {
    pub(crate) name: String,
    pub(crate) dtype: TensorDtype,
    template: Vec<i64>,
    pub(crate) data: Vec<u8>,
}

impl ScratchBuffer {
    pub(crate) fn shape_with_seq(&self, seq_axis: usize, len: usize) -> Vec<i64> {
        with_dim(&self.template, seq_axis, len)
    }
}

/// A caller-requested output and where it should be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSlot {
    pub name: String,
    pub placement: Option<DevicePlacement>,
}

// ── Execution frame ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ExecutionFrame {
    pub request_id: RequestId,
    /// Position of the request in the caller's batch.
    pub request_index: usize,
    pub batch_size: usize,
    /// Sequence length of the prompt supplied at admission.
    pub input_seq_len: usize,
    /// Stage the request is queued at or executing on.
    pub stage_index: usize,
    pub(crate) stages: Vec<StageState>,
    /// Inter-stage output buffers; empty for the last stage.
    pub(crate) scratch: Vec<Vec<ScratchBuffer>>,
    pub(crate) outputs: Vec<OutputSlot>,
}

impl ExecutionFrame {
    /// Allocate cache and scratch buffers for one request.
    ///
    /// `engines[i]` supplies the shape metadata of `config.stages[i]`.
    pub fn new(
        config: &PipelineConfig,
        engines: &[Arc<dyn InferenceEngine>],
        request_id: RequestId,
        request_index: usize,
        batch_size: usize,
        input_seq_len: usize,
        outputs: Vec<OutputSlot>,
    ) -> Result<Self> {
        if engines.len() != config.num_stages() {
            return Err(PipelineError::Frame(format!(
                "{} engines for {} stages",
                engines.len(),
                config.num_stages()
            )));
        }

        let max_seq_len = config.max_seq_len;
        let mut stages = Vec::with_capacity(config.num_stages());
        let mut scratch = Vec::with_capacity(config.num_stages());

        for (index, (stage, engine)) in config.stages.iter().zip(engines).enumerate() {
            let mut caches = Vec::with_capacity(stage.state_pairs.len());
            let mut entries = HashMap::with_capacity(stage.state_pairs.len());

            for pair in &stage.state_pairs {
                let declared = engine.input_shape(&pair.past).ok_or_else(|| {
                    PipelineError::Frame(format!("stage {index}: no shape for `{}`", pair.past))
                })?;
                let dtype = engine.output_dtype(&pair.present).ok_or_else(|| {
                    PipelineError::Frame(format!("stage {index}: no dtype for `{}`", pair.present))
                })?;
                let template = resolve_shape(
                    declared,
                    stage.axes.state,
                    batch_size,
                    max_seq_len,
                    index,
                    &pair.past,
                )?;
                let size = byte_len(&template, dtype)?;

                entries.insert(
                    pair.present.clone(),
                    CacheEntry {
                        slot: BufferSlot::A,
                        shape: with_dim(&template, stage.axes.state.seq, 0),
                        dtype,
                    },
                );
                caches.push(CachePair {
                    past: pair.past.clone(),
                    present: pair.present.clone(),
                    dtype,
                    template,
                    a: vec![0u8; size],
                    b: vec![0u8; size],
                });
            }
            stages.push(StageState { caches, entries });

            let mut buffers = Vec::new();
            if !config.is_last_stage(index) {
                for output in stage.inter_stage_outputs.keys() {
                    let declared = engine.output_shape(output).ok_or_else(|| {
                        PipelineError::Frame(format!("stage {index}: no shape for `{output}`"))
                    })?;
                    let dtype = engine.output_dtype(output).ok_or_else(|| {
                        PipelineError::Frame(format!("stage {index}: no dtype for `{output}`"))
                    })?;
                    let template = resolve_shape(
                        declared,
                        stage.axes.inter_stage,
                        batch_size,
                        max_seq_len,
                        index,
                        output,
                    )?;
                    let size = byte_len(&template, dtype)?;
                    buffers.push(ScratchBuffer {
                        name: output.clone(),
                        dtype,
                        template,
                        data: vec![0u8; size],
                    });
                }
            }
            scratch.push(buffers);
        }

        Ok(Self {
            request_id,
            request_index,
            batch_size,
            input_seq_len,
            stage_index: 0,
            stages,
            scratch,
            outputs,
        })
    }

    /// Latest cache value recorded for `present` at `stage`.
    pub fn cache_entry(&self, stage: usize, present: &str) -> Option<&CacheEntry> {
        self.stages.get(stage)?.entries.get(present)
    }

    /// Bytes of the cache entry recorded for `present` at `stage`.
    pub fn cache_view(&self, stage: usize, present: &str) -> Option<TensorView<'_>> {
        let state = self.stages.get(stage)?;
        let entry = state.entries.get(present)?;
        let pair = state.caches.iter().find(|p| p.present == present)?;
        let len = byte_len(&entry.shape, entry.dtype).ok()?;
        Some(TensorView {
            dtype: entry.dtype,
            shape: &entry.shape,
            data: pair.buffer(entry.slot).get(..len)?,
        })
    }

    /// Borrow the value behind a token handle.
    pub fn view<'a>(&'a self, handle: &'a TensorHandle) -> Result<TensorView<'a>> {
        resolve_handle(&self.scratch, handle)
    }

    /// Copy the value behind a token handle out of the frame.
    pub fn materialize(&self, handle: &TensorHandle) -> Result<Tensor> {
        match handle {
            TensorHandle::Owned(t) => Ok(t.clone()),
            other => Ok(self.view(other)?.to_owned_tensor()),
        }
    }

    /// Total bytes held by cache and scratch buffers.
    pub fn allocated_bytes(&self) -> usize {
        let caches: usize = self
            .stages
            .iter()
            .flat_map(|s| &s.caches)
            .map(|p| p.a.len() + p.b.len())
            .sum();
        let scratch: usize = self.scratch.iter().flatten().map(|b| b.data.len()).sum();
        caches + scratch
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Resolve a handle against the scratch buffers of `upstream` stages.
pub(crate) fn resolve_handle<'a>(
    upstream: &'a [Vec<ScratchBuffer>],
    handle: &'a TensorHandle,
) -> Result<TensorView<'a>> {
    match handle {
        TensorHandle::Owned(t) => Ok(t.view()),
        TensorHandle::Scratch { stage, name, dtype, shape } => {
            let buffer = upstream
                .get(*stage)
                .and_then(|bufs| bufs.iter().find(|b| b.name == *name))
                .ok_or_else(|| {
                    PipelineError::Execution(format!(
                        "scratch buffer `{name}` of stage {stage} is not readable here"
                    ))
                })?;
            let len = byte_len(shape, *dtype)?;
            let data = buffer.data.get(..len).ok_or_else(|| {
                PipelineError::Execution(format!(
                    "`{name}` needs {len} bytes, scratch buffer holds {}",
                    buffer.data.len()
                ))
            })?;
            Ok(TensorView { dtype: *dtype, shape, data })
        }
    }
}

pub(crate) fn byte_len(shape: &[i64], dtype: TensorDtype) -> Result<usize> {
    element_count(shape)
        .and_then(|n| n.checked_mul(dtype.element_bytes()))
        .ok_or_else(|| PipelineError::Frame(format!("shape {shape:?} is not concrete")))
}

pub(crate) fn with_dim(shape: &[i64], axis: usize, len: usize) -> Vec<i64> {
    let mut out = shape.to_vec();
    if let Some(d) = out.get_mut(axis) {
        *d = len as i64;
    }
    out
}

/// Fix batch and sequence axes of a declared shape; every other dimension
/// must already be concrete.
fn resolve_shape(
    mut shape: Vec<i64>,
    axes: AxisPair,
    batch_size: usize,
    seq_len: usize,
    stage: usize,
    name: &str,
) -> Result<Vec<i64>> {
    let rank = shape.len();
    for axis in [axes.batch, axes.seq] {
        if axis >= rank {
            return Err(PipelineError::Frame(format!(
                "stage {stage}: axis {axis} out of range for `{name}` (rank {rank})"
            )));
        }
    }
    shape[axes.batch] = batch_size as i64;
    shape[axes.seq] = seq_len as i64;
    if shape.iter().any(|&d| d < 0) {
        return Err(PipelineError::Frame(format!(
            "stage {stage}: `{name}` is symbolic outside the batch/sequence axes: {shape:?}"
        )));
    }
    Ok(shape)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

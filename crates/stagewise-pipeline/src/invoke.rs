//! One invocation of one stage for one request.
//!
//! Binds the token's fresh values and the frame's cached state as inputs,
//! binds outputs to the frame's pre-allocated buffers, runs the engine, then
//! records the new cache entries and builds the token for the next hop.

use std::collections::HashMap;

use stagewise_types::{StageConfig, TensorDtype, TensorView};
use tracing::{debug, trace};

use crate::engine::{InferenceEngine, InputBinding, OutputBinding, OutputTarget};
use crate::error::{PipelineError, Result};
use crate::frame::{
    byte_len, resolve_handle, BufferSlot, CacheEntry, CachePair, ExecutionFrame, ScratchBuffer,
    StageState,
};
use crate::token::{TensorHandle, Token};

/// What an output binding turned into once the engine returned.
enum Produced {
    Cache { shape: Vec<i64>, dtype: TensorDtype },
    Scratch { shape: Vec<i64>, dtype: TensorDtype },
    Owned(stagewise_types::Tensor),
}

/// Run `stage` of the pipeline for the request owning `frame`.
///
/// Consumes the incoming token and returns the token for the next hop. On
/// success the frame's cache entries for this stage point at the buffers
/// written by this call.
pub fn execute_stage(
    engine: &dyn InferenceEngine,
    stage: &StageConfig,
    max_seq_len: usize,
    frame: &mut ExecutionFrame,
    token: Token,
) -> Result<Token> {
    let ExecutionFrame {
        request_id,
        stage_index,
        stages,
        scratch,
        outputs: response_slots,
        ..
    } = frame;
    let stage_index = *stage_index;
    let step = token.step;
    let axes = stage.axes;

    let StageState { caches, entries } = stages.get_mut(stage_index).ok_or_else(|| {
        PipelineError::Execution(format!("frame has no state for stage {stage_index}"))
    })?;

    let length_input = token.get(&stage.seq_len_input).ok_or_else(|| {
        PipelineError::Execution(format!("`{}` not present in token", stage.seq_len_input))
    })?;
    let input_seq_len = dim(length_input.shape(), axes.input.seq, &stage.seq_len_input)?;

    // All caches of a stage grow together; the first one speaks for the rest.
    let past_seq_len = match caches.first() {
        Some(pair) => {
            let entry = entries.get(&pair.present).ok_or_else(|| {
                PipelineError::Execution(format!("no cache entry for `{}`", pair.present))
            })?;
            dim(&entry.shape, axes.state.seq, &pair.present)?
        }
        None => 0,
    };
    let new_seq_len = input_seq_len + past_seq_len;
    if new_seq_len > max_seq_len {
        return Err(PipelineError::Execution(format!(
            "request {request_id}: sequence length {new_seq_len} exceeds max_seq_len {max_seq_len}"
        )));
    }
    let write_slot = BufferSlot::written_at_step(step);

    let produced = {
        let (upstream, own) = scratch.split_at_mut(stage_index);
        let own: &mut [ScratchBuffer] = own.first_mut().map(Vec::as_mut_slice).unwrap_or_default();

        // Split every A/B pair into the half being read and the half being written.
        let mut cache_reads: HashMap<&str, TensorView<'_>> = HashMap::new();
        let mut cache_writes: HashMap<&str, OutputTarget<'_>> = HashMap::new();
        for pair in caches.iter_mut() {
            let entry: &CacheEntry = entries.get(&pair.present).ok_or_else(|| {
                PipelineError::Execution(format!("no cache entry for `{}`", pair.present))
            })?;
            if entry.slot == write_slot {
                return Err(PipelineError::Execution(format!(
                    "cache `{}` would be read and written through buffer {:?} at step {step}",
                    pair.present, write_slot
                )));
            }
            let write_shape = pair.shape_with_seq(axes.state.seq, new_seq_len);
            let write_len = byte_len(&write_shape, pair.dtype)?;
            let read_len = byte_len(&entry.shape, entry.dtype)?;

            let CachePair { past, present, dtype, a, b, .. } = pair;
            let (read_buf, write_buf): (&[u8], &mut [u8]) = match write_slot {
                BufferSlot::A => (b.as_slice(), a.as_mut_slice()),
                BufferSlot::B => (a.as_slice(), b.as_mut_slice()),
            };
            if read_len > read_buf.len() || write_len > write_buf.len() {
                return Err(PipelineError::Execution(format!(
                    "cache `{present}` does not fit its pre-allocated buffer"
                )));
            }
            cache_reads.insert(
                past.as_str(),
                TensorView { dtype: entry.dtype, shape: &entry.shape, data: &read_buf[..read_len] },
            );
            cache_writes.insert(
                present.as_str(),
                OutputTarget::Buffer {
                    shape: write_shape,
                    dtype: *dtype,
                    data: &mut write_buf[..write_len],
                },
            );
        }

        let mut scratch_writes: HashMap<&str, OutputTarget<'_>> = HashMap::new();
        for buffer in own.iter_mut() {
            let shape = buffer.shape_with_seq(axes.inter_stage.seq, input_seq_len);
            let len = byte_len(&shape, buffer.dtype)?;
            let ScratchBuffer { name, dtype, data, .. } = buffer;
            let data = data.get_mut(..len).ok_or_else(|| {
                PipelineError::Execution(format!("`{name}` does not fit its scratch buffer"))
            })?;
            let target = OutputTarget::Buffer { shape, dtype: *dtype, data };
            scratch_writes.insert(name.as_str(), target);
        }

        let mut inputs = Vec::with_capacity(stage.input_names.len());
        for name in &stage.input_names {
            if let Some(handle) = token.get(name) {
                inputs.push(InputBinding { name, tensor: resolve_handle(upstream, handle)? });
            } else if let Some(view) = cache_reads.get(name.as_str()) {
                inputs.push(InputBinding { name, tensor: *view });
            } else {
                trace!(
                    request_id = *request_id,
                    stage = stage_index,
                    input = %name,
                    "input left unbound"
                );
            }
        }

        let mut outputs = Vec::with_capacity(stage.output_names.len());
        for name in &stage.output_names {
            let target = if let Some(target) = cache_writes.remove(name.as_str()) {
                target
            } else if let Some(slot) = response_slots.iter().find(|s| s.name == *name) {
                slot.placement.map_or(OutputTarget::Allocate, OutputTarget::Device)
            } else if let Some(target) = scratch_writes.remove(name.as_str()) {
                target
            } else {
                OutputTarget::Allocate
            };
            outputs.push(OutputBinding::new(name, target));
        }

        debug!(
            request_id = *request_id,
            step,
            stage = stage_index,
            input_seq_len,
            past_seq_len,
            read_slot = ?write_slot.other(),
            write_slot = ?write_slot,
            "invoking stage"
        );
        engine.run(&inputs, &mut outputs)?;

        let mut produced = Vec::with_capacity(outputs.len());
        for binding in outputs {
            let name = binding.name;
            let value = match binding.target {
                OutputTarget::Buffer { shape, dtype, .. } if stage.is_present(name) => {
                    Produced::Cache { shape, dtype }
                }
                OutputTarget::Buffer { shape, dtype, .. } => Produced::Scratch { shape, dtype },
                OutputTarget::Device(_) | OutputTarget::Allocate => {
                    Produced::Owned(binding.produced.ok_or_else(|| {
                        PipelineError::Execution(format!("engine did not produce `{name}`"))
                    })?)
                }
            };
            produced.push((name, value));
        }
        produced
    };

    let mut next = Token::new(token.request_id, step);
    for (name, value) in produced {
        let forwarded = stage.forwarded_as(name);
        debug_assert!(
            !(stage.is_present(name) && forwarded.is_some()),
            "`{name}` is both a cache output and an inter-stage output"
        );
        match value {
            Produced::Cache { shape, dtype } => {
                entries.insert(name.to_string(), CacheEntry { slot: write_slot, shape, dtype });
            }
            Produced::Scratch { shape, dtype } => {
                if let Some(input) = forwarded {
                    let handle = TensorHandle::Scratch {
                        stage: stage_index,
                        name: name.to_string(),
                        dtype,
                        shape,
                    };
                    next.push(input, handle);
                }
            }
            Produced::Owned(tensor) => {
                if let Some(input) = forwarded {
                    next.push(input, TensorHandle::Owned(tensor));
                }
            }
        }
    }

    Ok(next)
}

fn dim(shape: &[i64], axis: usize, name: &str) -> Result<usize> {
    shape
        .get(axis)
        .and_then(|&d| usize::try_from(d).ok())
        .ok_or_else(|| {
            PipelineError::Execution(format!("`{name}` has no concrete axis {axis} in {shape:?}"))
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

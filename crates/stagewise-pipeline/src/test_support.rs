//! Scripted in-process engines and topologies shared by the unit tests.
//!
//! The toy model keeps one feature row per position: cache rows are the
//! history of fed values, hidden states repeat the input id, and logits are
//! one-hot at whatever id the test script picks for the current step.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagewise_types::config::{AxisPair, StageAxes};
use stagewise_types::tensor::element_count;
use stagewise_types::{
    DevicePlacement, PipelineConfig, StageConfig, StatePair, Tensor, TensorDtype,
};

use crate::engine::{InferenceEngine, InputBinding, OutputBinding, OutputTarget};
use crate::error::EngineError;

pub(crate) const HIDDEN: usize = 2;

/// `(past_len, batch_row) → next token id`
pub(crate) type Script = Arc<dyn Fn(usize, usize) -> i64 + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub batch: usize,
    pub seq_len: usize,
    pub past_len: usize,
    /// Cache contents read this call, batch row 0, first feature.
    pub past_row0: Vec<f32>,
    pub read_addr: Option<usize>,
    pub write_addr: Option<usize>,
    pub input_names: Vec<String>,
    pub input_ids: Option<Vec<i64>>,
    pub position_ids: Option<Vec<i64>>,
    pub output_targets: Vec<(String, &'static str)>,
}

pub(crate) struct ScriptedEngine {
    inputs: Vec<(String, Vec<i64>)>,
    outputs: Vec<(String, Vec<i64>)>,
    primary: String,
    past: Option<(String, String)>,
    vocab: usize,
    script: Script,
    calls: Mutex<Vec<CallRecord>>,
    /// Every `run` call, including ones that fail or panic.
    invocations: AtomicUsize,
    fail_on_call: Option<usize>,
    panic_on_call: Option<usize>,
    delay: Duration,
}

impl ScriptedEngine {
    fn new(
        inputs: &[(&str, Vec<i64>)],
        outputs: &[(&str, Vec<i64>)],
        primary: &str,
        past: (&str, &str),
        vocab: usize,
        script: Script,
    ) -> Self {
        let own = |v: &[(&str, Vec<i64>)]| {
            v.iter().map(|(n, s)| (n.to_string(), s.clone())).collect::<Vec<_>>()
        };
        Self {
            inputs: own(inputs),
            outputs: own(outputs),
            primary: primary.into(),
            past: Some((past.0.into(), past.1.into())),
            vocab,
            script,
            calls: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            fail_on_call: None,
            panic_on_call: None,
            delay: Duration::ZERO,
        }
    }

    /// Embedding + first layers: ids → hidden states.
    pub(crate) fn front() -> Self {
        let h = HIDDEN as i64;
        Self::new(
            &[
                ("input_ids", vec![-1, -1]),
                ("position_ids", vec![-1, -1]),
                ("past_0", vec![-1, -1, h]),
            ],
            &[("hidden_states", vec![-1, -1, h]), ("present_0", vec![-1, -1, h])],
            "input_ids",
            ("past_0", "present_0"),
            0,
            Arc::new(|_, _| 0),
        )
    }

    /// Last layers + head: hidden states → logits.
    pub(crate) fn back(vocab: usize, script: Script) -> Self {
        let h = HIDDEN as i64;
        Self::new(
            &[("input_hidden_states", vec![-1, -1, h]), ("past_1", vec![-1, -1, h])],
            &[("logits", vec![-1, -1, vocab as i64]), ("present_1", vec![-1, -1, h])],
            "input_hidden_states",
            ("past_1", "present_1"),
            vocab,
            script,
        )
    }

    /// Whole model on one stage: ids → logits.
    pub(crate) fn single(vocab: usize, script: Script) -> Self {
        let h = HIDDEN as i64;
        Self::new(
            &[
                ("input_ids", vec![-1, -1]),
                ("position_ids", vec![-1, -1]),
                ("past_0", vec![-1, -1, h]),
            ],
            &[("logits", vec![-1, -1, vocab as i64]), ("present_0", vec![-1, -1, h])],
            "input_ids",
            ("past_0", "present_0"),
            vocab,
            script,
        )
    }

    pub(crate) fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub(crate) fn panicking_on(mut self, call: usize) -> Self {
        self.panic_on_call = Some(call);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    fn is_present(&self, name: &str) -> bool {
        self.past.as_ref().is_some_and(|(_, present)| present == name)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn input_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, s)| s.clone())
    }

    fn output_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, s)| s.clone())
    }

    fn output_dtype(&self, name: &str) -> Option<TensorDtype> {
        self.output_shape(name).map(|_| TensorDtype::F32)
    }

    fn run(
        &self,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<(), EngineError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let call_index = self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call_index) {
            return Err(EngineError::new("device lost"));
        }
        if self.panic_on_call == Some(call_index) {
            panic!("kernel launch failed");
        }

        let find = |name: &str| inputs.iter().find(|b| b.name == name).map(|b| b.tensor);
        let primary = find(&self.primary)
            .ok_or_else(|| EngineError::new(format!("`{}` not bound", self.primary)))?;
        let batch = primary.dim(0).unwrap_or(0);
        let seq = primary.dim(1).unwrap_or(0);
        let raw = primary.to_f32_vec();
        let stride = if primary.shape.len() == 3 { HIDDEN } else { 1 };
        let fed: Vec<f32> = (0..batch * seq).map(|i| raw[i * stride]).collect();

        let past = self.past.as_ref().and_then(|(p, _)| find(p));
        let past_len = past.and_then(|v| v.dim(1)).unwrap_or(0);
        let past_vals = past.map(|v| v.to_f32_vec()).unwrap_or_default();

        let mut record = CallRecord {
            batch,
            seq_len: seq,
            past_len,
            past_row0: (0..past_len).map(|t| past_vals[t * HIDDEN]).collect(),
            read_addr: past.map(|v| v.data.as_ptr() as usize),
            write_addr: None,
            input_names: inputs.iter().map(|b| b.name.to_string()).collect(),
            input_ids: find("input_ids").and_then(|v| v.to_i64_vec()),
            position_ids: find("position_ids").and_then(|v| v.to_i64_vec()),
            output_targets: Vec::new(),
        };

        for out in outputs.iter_mut() {
            record.output_targets.push((out.name.to_string(), target_kind(&out.target)));

            if self.is_present(out.name) {
                let total = past_len + seq;
                let mut vals = Vec::with_capacity(batch * total * HIDDEN);
                for b in 0..batch {
                    for t in 0..past_len {
                        let row = (b * past_len + t) * HIDDEN;
                        vals.extend_from_slice(&past_vals[row..row + HIDDEN]);
                    }
                    for t in 0..seq {
                        vals.extend(std::iter::repeat(fed[b * seq + t]).take(HIDDEN));
                    }
                }
                let shape = vec![batch as i64, total as i64, HIDDEN as i64];
                record.write_addr = write_output(out, shape, &vals)?;
            } else if out.name == "hidden_states" {
                let vals: Vec<f32> = fed
                    .iter()
                    .flat_map(|v| std::iter::repeat(*v).take(HIDDEN))
                    .collect();
                write_output(out, vec![batch as i64, seq as i64, HIDDEN as i64], &vals)?;
            } else if out.name == "logits" {
                let mut vals = vec![0.0f32; batch * seq * self.vocab];
                for b in 0..batch {
                    let id = (self.script)(past_len, b) as usize;
                    for t in 0..seq {
                        vals[(b * seq + t) * self.vocab + id] = 1.0;
                    }
                }
                write_output(out, vec![batch as i64, seq as i64, self.vocab as i64], &vals)?;
            } else {
                return Err(EngineError::new(format!("unknown output `{}`", out.name)));
            }
        }

        self.calls.lock().unwrap().push(record);
        Ok(())
    }
}

fn target_kind(target: &OutputTarget<'_>) -> &'static str {
    match target {
        OutputTarget::Buffer { .. } => "buffer",
        OutputTarget::Device(_) => "device",
        OutputTarget::Allocate => "allocate",
    }
}

fn write_output(
    binding: &mut OutputBinding<'_>,
    shape: Vec<i64>,
    values: &[f32],
) -> Result<Option<usize>, EngineError> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    match &mut binding.target {
        OutputTarget::Buffer { shape: expected, data, .. } => {
            if *expected != shape || data.len() != bytes.len() {
                return Err(EngineError::new(format!(
                    "`{}` bound as {expected:?} ({} bytes), produced {shape:?}",
                    binding.name,
                    data.len()
                )));
            }
            data.copy_from_slice(&bytes);
            Ok(Some(data.as_ptr() as usize))
        }
        OutputTarget::Device(_) | OutputTarget::Allocate => {
            binding.produced = Some(Tensor { dtype: TensorDtype::F32, shape, data: bytes });
            Ok(None)
        }
    }
}

// ── Topologies ───────────────────────────────────────────────────────────────

fn axes() -> StageAxes {
    let pair = AxisPair { batch: 0, seq: 1 };
    StageAxes { state: pair, input: pair, inter_stage: pair }
}

pub(crate) fn two_stage_config(max_seq_len: usize, eos_token_id: i64) -> PipelineConfig {
    PipelineConfig {
        stages: vec![
            StageConfig {
                name: "front".into(),
                device: DevicePlacement::cuda(0),
                input_names: vec!["input_ids".into(), "position_ids".into(), "past_0".into()],
                output_names: vec!["hidden_states".into(), "present_0".into()],
                state_pairs: vec![StatePair { past: "past_0".into(), present: "present_0".into() }],
                inter_stage_outputs: BTreeMap::from([(
                    "hidden_states".to_string(),
                    "input_hidden_states".to_string(),
                )]),
                seq_len_input: "input_ids".into(),
                axes: axes(),
            },
            StageConfig {
                name: "back".into(),
                device: DevicePlacement::cuda(1),
                input_names: vec!["input_hidden_states".into(), "past_1".into()],
                output_names: vec!["logits".into(), "present_1".into()],
                state_pairs: vec![StatePair { past: "past_1".into(), present: "present_1".into() }],
                inter_stage_outputs: BTreeMap::from([("logits".to_string(), "logits".to_string())]),
                seq_len_input: "input_hidden_states".into(),
                axes: axes(),
            },
        ],
        max_seq_len,
        eos_token_id,
        input_ids_name: "input_ids".into(),
        position_ids_name: "position_ids".into(),
        logits_name: "logits".into(),
    }
}

pub(crate) fn single_stage_config(max_seq_len: usize, eos_token_id: i64) -> PipelineConfig {
    PipelineConfig {
        stages: vec![StageConfig {
            name: "whole".into(),
            device: DevicePlacement::CPU,
            input_names: vec!["input_ids".into(), "position_ids".into(), "past_0".into()],
            output_names: vec!["logits".into(), "present_0".into()],
            state_pairs: vec![StatePair { past: "past_0".into(), present: "present_0".into() }],
            inter_stage_outputs: BTreeMap::from([("logits".to_string(), "logits".to_string())]),
            seq_len_input: "input_ids".into(),
            axes: axes(),
        }],
        max_seq_len,
        eos_token_id,
        input_ids_name: "input_ids".into(),
        position_ids_name: "position_ids".into(),
        logits_name: "logits".into(),
    }
}

pub(crate) fn two_stage_engines(
    vocab: usize,
    script: impl Fn(usize, usize) -> i64 + Send + Sync + 'static,
) -> Vec<Arc<dyn InferenceEngine>> {
    vec![
        Arc::new(ScriptedEngine::front()),
        Arc::new(ScriptedEngine::back(vocab, Arc::new(script))),
    ]
}

/// Prompt `ids` for a batch of one: `[1, len]` ids and positions.
pub(crate) fn prompt(ids: &[i64]) -> Vec<(String, Tensor)> {
    let len = ids.len() as i64;
    let positions: Vec<i64> = (0..len).collect();
    vec![
        ("input_ids".into(), Tensor::from_i64(vec![1, len], ids)),
        ("position_ids".into(), Tensor::from_i64(vec![1, len], &positions)),
    ]
}

// ── Mixed axis layouts ───────────────────────────────────────────────────────

/// Cache tensors laid out `[2, batch, 1, seq, 2]`.
const CACHE: [i64; 5] = [2, -1, 1, -1, 2];
/// Hidden states laid out `[seq, batch, WIDTH]`.
pub(crate) const WIDTH: i64 = 4;

#[derive(Debug, Clone)]
pub(crate) struct LayoutCall {
    pub primary_shape: Vec<i64>,
    pub past_shape: Vec<i64>,
    pub output_targets: Vec<(String, &'static str)>,
}

/// Engine whose tensors put batch and sequence on different axes per role.
/// It checks every bound output buffer against the shape it would produce.
pub(crate) struct LayoutEngine {
    primary: String,
    primary_axes: AxisPair,
    past: String,
    present: String,
    output: String,
    vocab: usize,
    script: Script,
    calls: Mutex<Vec<LayoutCall>>,
}

impl LayoutEngine {
    fn new(primary: &str, primary_axes: AxisPair, index: usize, output: &str) -> Self {
        Self {
            primary: primary.into(),
            primary_axes,
            past: format!("past_{index}"),
            present: format!("present_{index}"),
            output: output.into(),
            vocab: 0,
            script: Arc::new(|_, _| 0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn embed() -> Self {
        Self::new("input_ids", AxisPair { batch: 0, seq: 1 }, 0, "hidden_0")
    }

    pub(crate) fn middle() -> Self {
        Self::new("hidden_in_1", AxisPair { batch: 1, seq: 0 }, 1, "hidden_1")
    }

    pub(crate) fn head(vocab: usize, script: Script) -> Self {
        Self {
            vocab,
            script,
            ..Self::new("hidden_in_2", AxisPair { batch: 1, seq: 0 }, 2, "logits")
        }
    }

    pub(crate) fn calls(&self) -> Vec<LayoutCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl InferenceEngine for LayoutEngine {
    fn input_shape(&self, name: &str) -> Option<Vec<i64>> {
        let takes_ids = self.primary == "input_ids";
        if name == self.past {
            Some(CACHE.to_vec())
        } else if takes_ids && (name == "input_ids" || name == "position_ids") {
            Some(vec![-1, -1])
        } else if name == self.primary {
            Some(vec![-1, -1, WIDTH])
        } else {
            None
        }
    }

    fn output_shape(&self, name: &str) -> Option<Vec<i64>> {
        if name == self.present {
            Some(CACHE.to_vec())
        } else if name == self.output && name == "logits" {
            Some(vec![-1, -1, self.vocab as i64])
        } else if name == self.output {
            Some(vec![-1, -1, WIDTH])
        } else {
            None
        }
    }

    fn output_dtype(&self, name: &str) -> Option<TensorDtype> {
        self.output_shape(name).map(|_| TensorDtype::F32)
    }

    fn run(
        &self,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<(), EngineError> {
        let find = |name: &str| inputs.iter().find(|b| b.name == name).map(|b| b.tensor);
        let primary = find(&self.primary)
            .ok_or_else(|| EngineError::new(format!("`{}` not bound", self.primary)))?;
        let past = find(&self.past)
            .ok_or_else(|| EngineError::new(format!("`{}` not bound", self.past)))?;
        let batch = primary.dim(self.primary_axes.batch).unwrap_or(0);
        let seq = primary.dim(self.primary_axes.seq).unwrap_or(0);
        let past_len = past.dim(3).unwrap_or(0);

        let mut call = LayoutCall {
            primary_shape: primary.shape.to_vec(),
            past_shape: past.shape.to_vec(),
            output_targets: Vec::new(),
        };
        for out in outputs.iter_mut() {
            call.output_targets.push((out.name.to_string(), target_kind(&out.target)));

            let (b, s) = (batch as i64, seq as i64);
            if out.name == self.present {
                let shape = vec![2, b, 1, (past_len + seq) as i64, 2];
                let len = element_count(&shape).unwrap_or(0);
                write_output(out, shape, &vec![0.0; len])?;
            } else if out.name == "logits" {
                let mut vals = vec![0.0f32; batch * seq * self.vocab];
                for row in 0..batch {
                    let id = (self.script)(past_len, row) as usize;
                    vals[(row * seq + seq - 1) * self.vocab + id] = 1.0;
                }
                write_output(out, vec![b, s, self.vocab as i64], &vals)?;
            } else if out.name == self.output {
                let vals = vec![1.0; seq * batch * WIDTH as usize];
                write_output(out, vec![s, b, WIDTH], &vals)?;
            } else {
                return Err(EngineError::new(format!("unknown output `{}`", out.name)));
            }
        }

        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

fn layout_stage(
    name: &str,
    index: usize,
    primary: &str,
    extra_inputs: &[&str],
    forward: (&str, &str),
    input: AxisPair,
    inter_stage: AxisPair,
) -> StageConfig {
    let past = format!("past_{index}");
    let present = format!("present_{index}");
    let mut input_names = vec![primary.to_string()];
    input_names.extend(extra_inputs.iter().map(|n| n.to_string()));
    input_names.push(past.clone());
    StageConfig {
        name: name.into(),
        device: DevicePlacement::cuda(index as u32),
        input_names,
        output_names: vec![forward.0.into(), present.clone()],
        state_pairs: vec![StatePair { past, present }],
        inter_stage_outputs: BTreeMap::from([(forward.0.to_string(), forward.1.to_string())]),
        seq_len_input: primary.into(),
        axes: StageAxes { state: AxisPair { batch: 1, seq: 3 }, input, inter_stage },
    }
}

/// Three stages: ids `[batch, seq]`, hidden states `[seq, batch, 4]`,
/// caches `[2, batch, 1, seq, 2]`.
pub(crate) fn three_stage_config(max_seq_len: usize, eos_token_id: i64) -> PipelineConfig {
    let batch_major = AxisPair { batch: 0, seq: 1 };
    let seq_major = AxisPair { batch: 1, seq: 0 };
    PipelineConfig {
        stages: vec![
            layout_stage(
                "embed",
                0,
                "input_ids",
                &["position_ids"],
                ("hidden_0", "hidden_in_1"),
                batch_major,
                seq_major,
            ),
            layout_stage(
                "middle",
                1,
                "hidden_in_1",
                &[],
                ("hidden_1", "hidden_in_2"),
                seq_major,
                seq_major,
            ),
            layout_stage(
                "head",
                2,
                "hidden_in_2",
                &[],
                ("logits", "logits"),
                seq_major,
                batch_major,
            ),
        ],
        max_seq_len,
        eos_token_id,
        input_ids_name: "input_ids".into(),
        position_ids_name: "position_ids".into(),
        logits_name: "logits".into(),
    }
}

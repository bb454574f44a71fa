// Pipeline topology and scheduler tunables.
//
// A `PipelineConfig` is loaded once (usually from JSON), validated, and then
// shared read-only by the orchestrator and every stage runner.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::tensor::DevicePlacement;

// ── Axes ──────────────────────────────────────────────────────────────────────

/// Which dimension of a tensor is the batch and which is the sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPair {
    pub batch: usize,
    pub seq: usize,
}

/// Axis conventions differ between tensor roles, so each role carries its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAxes {
    /// Past/present cache tensors.
    pub state: AxisPair,
    /// Plain inputs (input ids, position ids, hidden states fed in).
    pub input: AxisPair,
    /// Outputs handed to the next stage.
    pub inter_stage: AxisPair,
}

impl Default for StageAxes {
    fn default() -> Self {
        Self {
            state: AxisPair { batch: 1, seq: 3 },
            input: AxisPair { batch: 0, seq: 1 },
            inter_stage: AxisPair { batch: 0, seq: 1 },
        }
    }
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// A past input and the present output that replaces it after each step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePair {
    pub past: String,
    pub present: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub device: DevicePlacement,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    #[serde(default)]
    pub state_pairs: Vec<StatePair>,
    /// This stage's output name → the input name it feeds. On the last stage
    /// the mapped names land in the token returned to the orchestrator.
    #[serde(default)]
    pub inter_stage_outputs: BTreeMap<String, String>,
    /// Input whose sequence axis gives the number of new positions this step.
    pub seq_len_input: String,
    #[serde(default)]
    pub axes: StageAxes,
}

impl StageConfig {
    pub fn is_present(&self, name: &str) -> bool {
        self.state_pairs.iter().any(|p| p.present == name)
    }

    /// Name under which `output` is handed to the next stage, if it is.
    pub fn forwarded_as(&self, output: &str) -> Option<&str> {
        self.inter_stage_outputs.get(output).map(String::as_str)
    }

    fn validate(&self, index: usize, next: Option<&StageConfig>) -> Result<()> {
        let unknown = |name: &str, list: &'static str| ConfigError::UnknownName {
            stage: index,
            name: name.to_string(),
            list,
        };

        if !self.input_names.contains(&self.seq_len_input) {
            return Err(unknown(&self.seq_len_input, "input names"));
        }

        let mut pasts = HashSet::new();
        let mut presents = HashSet::new();
        for pair in &self.state_pairs {
            if !self.input_names.contains(&pair.past) {
                return Err(unknown(&pair.past, "input names"));
            }
            if !self.output_names.contains(&pair.present) {
                return Err(unknown(&pair.present, "output names"));
            }
            if !pasts.insert(pair.past.as_str()) || !presents.insert(pair.present.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stage {index}: state pair {} → {} is declared twice",
                    pair.past, pair.present
                )));
            }
        }

        for (output, input) in &self.inter_stage_outputs {
            if !self.output_names.contains(output) {
                return Err(unknown(output, "output names"));
            }
            if presents.contains(output.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stage {index}: `{output}` is both a cache output and an inter-stage output"
                )));
            }
            if let Some(next) = next {
                if !next.input_names.contains(input) {
                    return Err(ConfigError::UnknownName {
                        stage: index + 1,
                        name: input.clone(),
                        list: "input names",
                    });
                }
            }
        }

        for (role, axes) in [
            ("state", self.axes.state),
            ("input", self.axes.input),
            ("inter-stage", self.axes.inter_stage),
        ] {
            if axes.batch == axes.seq {
                return Err(ConfigError::Invalid(format!(
                    "stage {index}: {role} batch and sequence axes are both {}",
                    axes.batch
                )));
            }
        }

        Ok(())
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered stages; also the cyclic order every request visits them in.
    pub stages: Vec<StageConfig>,
    pub max_seq_len: usize,
    pub eos_token_id: i64,
    #[serde(default = "default_input_ids_name")]
    pub input_ids_name: String,
    #[serde(default = "default_position_ids_name")]
    pub position_ids_name: String,
    #[serde(default = "default_logits_name")]
    pub logits_name: String,
}

fn default_input_ids_name() -> String {
    "input_ids".into()
}

fn default_position_ids_name() -> String {
    "position_ids".into()
}

fn default_logits_name() -> String {
    "logits".into()
}

impl PipelineConfig {
    /// Parse and validate a JSON pipeline description.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON pipeline description from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn is_last_stage(&self, index: usize) -> bool {
        index + 1 == self.stages.len()
    }

    /// Check every cross-reference in the topology.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("pipeline has no stages".into()));
        }
        if self.max_seq_len == 0 {
            return Err(ConfigError::Invalid("max_seq_len must be positive".into()));
        }

        for (i, stage) in self.stages.iter().enumerate() {
            stage.validate(i, self.stages.get(i + 1))?;
        }

        let first = &self.stages[0];
        for name in [&self.input_ids_name, &self.position_ids_name] {
            if !first.input_names.contains(name) {
                return Err(ConfigError::UnknownName {
                    stage: 0,
                    name: name.clone(),
                    list: "input names",
                });
            }
        }

        let last_index = self.stages.len() - 1;
        let last = &self.stages[last_index];
        if !last.inter_stage_outputs.values().any(|n| *n == self.logits_name) {
            return Err(ConfigError::Invalid(format!(
                "stage {last_index}: no output is forwarded as `{}`",
                self.logits_name
            )));
        }

        Ok(())
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads per stage. One per device is the usual setup.
    #[serde(default = "default_workers_per_stage")]
    pub workers_per_stage: usize,

    /// How long the orchestrator waits for any completion before failing
    /// the whole run.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_workers_per_stage() -> usize {
    1
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers_per_stage: default_workers_per_stage(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

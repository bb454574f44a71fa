//! The unit handed between stages and between decoding steps.

use stagewise_types::{Tensor, TensorDtype};

/// Identifier assigned to each admitted request.
pub type RequestId = u64;

/// A value threaded into the next invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorHandle {
    /// Freshly computed or caller-supplied value.
    Owned(Tensor),
    /// Output written into an upstream stage's scratch buffer in the
    /// request's execution frame.
    Scratch {
        stage: usize,
        name: String,
        dtype: TensorDtype,
        shape: Vec<i64>,
    },
}

impl TensorHandle {
    pub fn shape(&self) -> &[i64] {
        match self {
            Self::Owned(t) => &t.shape,
            Self::Scratch { shape, .. } => shape,
        }
    }
}

/// Each stage invocation consumes one token and produces a new one.
#[derive(Debug)]
pub struct Token {
    pub request_id: RequestId,
    pub step: usize,
    values: Vec<(String, TensorHandle)>,
    pub error: Option<String>,
}

impl Token {
    pub fn new(request_id: RequestId, step: usize) -> Self {
        Self { request_id, step, values: Vec::new(), error: None }
    }

    pub fn with_values(
        request_id: RequestId,
        step: usize,
        values: Vec<(String, TensorHandle)>,
    ) -> Self {
        Self { request_id, step, values, error: None }
    }

    /// Token carrying only an error, reported in place of a stage's output.
    pub fn failed(request_id: RequestId, step: usize, error: String) -> Self {
        Self { request_id, step, values: Vec::new(), error: Some(error) }
    }

    pub fn push(&mut self, name: impl Into<String>, value: TensorHandle) {
        self.values.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&TensorHandle> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

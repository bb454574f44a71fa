//! Contract with the per-stage inference engine.
//!
//! The scheduler never computes anything itself. For every invocation it
//! binds named inputs (borrowed views of token values or cached state) and
//! named outputs (pre-sized buffers owned by the execution frame, a device
//! placement requested by the caller, or an engine-chosen allocation), then
//! calls [`InferenceEngine::run`] exactly once.

use stagewise_types::{DevicePlacement, Tensor, TensorDtype, TensorView};

use crate::error::EngineError;

/// A named input handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct InputBinding<'a> {
    pub name: &'a str,
    pub tensor: TensorView<'a>,
}

/// Where the engine must put one output.
#[derive(Debug)]
pub enum OutputTarget<'a> {
    /// Write exactly `shape` elements of `dtype` into `data`.
    Buffer {
        shape: Vec<i64>,
        dtype: TensorDtype,
        data: &'a mut [u8],
    },
    /// Allocate the output on this device and hand it back via `produced`.
    Device(DevicePlacement),
    /// Allocate wherever the engine prefers and hand it back via `produced`.
    Allocate,
}

#[derive(Debug)]
pub struct OutputBinding<'a> {
    pub name: &'a str,
    pub target: OutputTarget<'a>,
    /// Filled by the engine for `Device` and `Allocate` targets.
    pub produced: Option<Tensor>,
}

impl<'a> OutputBinding<'a> {
    pub fn new(name: &'a str, target: OutputTarget<'a>) -> Self {
        Self { name, target, produced: None }
    }
}

/// One model stage bound to one device.
///
/// Implementations are called from the stage's worker threads and must be
/// `Send + Sync`; a stage never runs two invocations for the same request
/// concurrently.
pub trait InferenceEngine: Send + Sync {
    /// Declared shape of an input; symbolic dimensions are negative.
    fn input_shape(&self, name: &str) -> Option<Vec<i64>>;

    /// Declared shape of an output; symbolic dimensions are negative.
    fn output_shape(&self, name: &str) -> Option<Vec<i64>>;

    fn output_dtype(&self, name: &str) -> Option<TensorDtype>;

    /// Execute synchronously and populate every output binding.
    fn run(
        &self,
        inputs: &[InputBinding<'_>],
        outputs: &mut [OutputBinding<'_>],
    ) -> Result<(), EngineError>;
}

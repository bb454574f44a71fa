//! `stagewise-pipeline` — Pipelined multi-stage execution for autoregressive
//! generation.
//!
//! A model is split into ordered stages, each bound to one device and one
//! [`InferenceEngine`]. Many requests flow through the stages at once: while
//! stage *k* computes for request A, stage *k-1* is already computing for
//! request B. The crate schedules; engines compute.
//!
//! # Architecture
//!
//! ```text
//!              submit                        push
//! ┌──────────────┐   ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ Orchestrator │──▶│   Stage 0   │──▶│   Stage 1   │──▶│ ResponseQueue │
//! │  (Pipeline)  │   │  runner +   │   │  runner +   │   │  (per run)    │
//! └──────────────┘   │  engine     │   │  engine     │   └───────┬───────┘
//!        ▲           └─────────────┘   └─────────────┘           │
//!        └───────── next stage / next step / finished ◀──────────┘
//! ```
//!
//! Every hop carries the request's [`ExecutionFrame`] (cache and scratch
//! buffers) together with a [`Token`] (the values for the next invocation).
//! The orchestrator advances each request with [`RequestProgress`], decodes
//! greedily after the last stage, and aborts the whole batch on the first
//! error or stall.

pub mod decode;
pub mod engine;
pub mod error;
pub mod frame;
pub mod invoke;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod token;

#[cfg(test)]
mod test_support;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use decode::{argmax, greedy_next_tokens, next_position_ids, NextTokens};
pub use engine::{InferenceEngine, InputBinding, OutputBinding, OutputTarget};
pub use error::{EngineError, PipelineError, Result};
pub use frame::{BufferSlot, CacheEntry, ExecutionFrame, OutputSlot};
pub use invoke::execute_stage;
pub use orchestrator::{Pipeline, Request, Response, ResponseOutput, RunSummary};
pub use progress::{RequestProgress, RequestState, Transition};
pub use queue::{ResponseQueue, ResponseSender};
pub use runner::{Completion, RunContext, StageRunner, StageTask};
pub use token::{RequestId, TensorHandle, Token};

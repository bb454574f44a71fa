//! Batch entry point and the response loop.
//!
//! The orchestrator admits a batch of requests, hands each one to stage 0,
//! then consumes completions from the run's response queue and decides for
//! every completion whether the request moves to the next stage, starts the
//! next decoding step, or is finished. Any failure aborts the whole batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stagewise_types::tensor::element_count;
use stagewise_types::{ConfigError, DevicePlacement, PipelineConfig, SchedulerConfig, Tensor};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decode::{greedy_next_tokens, next_position_ids};
use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::frame::{ExecutionFrame, OutputSlot};
use crate::progress::{RequestProgress, Transition};
use crate::queue::ResponseQueue;
use crate::runner::{Completion, RunContext, StageRunner, StageTask};
use crate::token::{RequestId, TensorHandle, Token};

// ── Requests and responses ───────────────────────────────────────────────────

/// Named input tensors of one request. Names and values pair up by index.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub input_names: Vec<String>,
    pub input_values: Vec<Tensor>,
}

impl Request {
    pub fn new(inputs: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        let (input_names, input_values) = inputs.into_iter().unzip();
        Self { input_names, input_values }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        let index = self.input_names.iter().position(|n| n == name)?;
        self.input_values.get(index)
    }
}

/// One requested output of a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutput {
    pub name: String,
    /// Where the final stage should produce the value.
    pub placement: Option<DevicePlacement>,
    /// Pre-shaped destination, or `None` to receive the produced tensor.
    pub value: Option<Tensor>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub outputs: Vec<ResponseOutput>,
}

impl Response {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let outputs = names
            .into_iter()
            .map(|name| ResponseOutput { name: name.into(), placement: None, value: None })
            .collect();
        Self { outputs }
    }

    /// Add an output with a placement hint and/or a pre-shaped destination.
    /// A destination keeps its own shape; only dtype and element count must
    /// match what the final stage produces.
    pub fn with_output(
        mut self,
        name: impl Into<String>,
        placement: Option<DevicePlacement>,
        value: Option<Tensor>,
    ) -> Self {
        self.outputs.push(ResponseOutput { name: name.into(), placement, value });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.outputs.iter().find(|o| o.name == name)?.value.as_ref()
    }
}

/// What a successful run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub requests: usize,
    /// Full passes over all stages, per request in batch order.
    pub steps: Vec<usize>,
    /// Requests that stopped on end-of-sequence before the step budget.
    pub early_stopped: usize,
    /// Stage invocations observed.
    pub invocations: usize,
    pub elapsed: Duration,
}

// ── Run state ────────────────────────────────────────────────────────────────

struct Tracked {
    index: usize,
    orig_len: usize,
    progress: RequestProgress,
}

struct RunState {
    num_steps: usize,
    tracked: HashMap<RequestId, Tracked>,
    /// `(output slot, value)` per request, committed once every request is done.
    staged: Vec<Vec<(usize, Tensor)>>,
    steps: Vec<usize>,
    done: usize,
    early_stopped: usize,
    invocations: usize,
}

impl RunState {
    fn new(num_requests: usize, num_steps: usize) -> Self {
        Self {
            num_steps,
            tracked: HashMap::with_capacity(num_requests),
            staged: vec![Vec::new(); num_requests],
            steps: vec![0; num_requests],
            done: 0,
            early_stopped: 0,
            invocations: 0,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    scheduler: SchedulerConfig,
    engines: Vec<Arc<dyn InferenceEngine>>,
    runners: Vec<StageRunner>,
    next_request_id: AtomicU64,
}

impl Pipeline {
    /// Validate the topology against the engines and start one runner per
    /// stage. `engines[i]` executes `config.stages[i]`.
    pub fn new(
        config: PipelineConfig,
        scheduler: SchedulerConfig,
        engines: Vec<Arc<dyn InferenceEngine>>,
    ) -> Result<Self> {
        config.validate()?;
        if engines.len() != config.num_stages() {
            return Err(ConfigError::Invalid(format!(
                "{} engines supplied for {} stages",
                engines.len(),
                config.num_stages()
            ))
            .into());
        }
        for (index, (stage, engine)) in config.stages.iter().zip(&engines).enumerate() {
            if let Some(name) = stage.input_names.iter().find(|n| engine.input_shape(n).is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "stage {index}: engine does not declare input `{name}`"
                ))
                .into());
            }
            if let Some(name) = stage
                .output_names
                .iter()
                .find(|n| engine.output_shape(n).is_none() || engine.output_dtype(n).is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "stage {index}: engine does not declare output `{name}`"
                ))
                .into());
            }
        }

        let runners = config
            .stages
            .iter()
            .zip(&engines)
            .enumerate()
            .map(|(index, (stage, engine))| {
                StageRunner::new(
                    index,
                    stage.clone(),
                    config.max_seq_len,
                    Arc::clone(engine),
                    scheduler.workers_per_stage,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            stages = config.num_stages(),
            workers_per_stage = scheduler.workers_per_stage,
            max_seq_len = config.max_seq_len,
            "pipeline ready"
        );
        Ok(Self {
            config: Arc::new(config),
            scheduler,
            engines,
            runners,
            next_request_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn num_stages(&self) -> usize {
        self.runners.len()
    }

    /// Run every request for up to `num_steps` decoding steps.
    ///
    /// `responses[i]` receives the outputs of `requests[i]`. Responses are
    /// written only if the whole batch succeeds.
    pub async fn run(
        &self,
        requests: &[Request],
        responses: &mut [Response],
        num_steps: usize,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let shapes = self.validate_inputs(requests, responses, num_steps)?;
        let frames = self.build_frames(responses, &shapes)?;

        let mut queue = ResponseQueue::new();
        let ctx = Arc::new(RunContext::new(queue.sender()));
        info!(
            run_id = %ctx.run_id,
            requests = requests.len(),
            num_steps,
            stages = self.num_stages(),
            "run admitted"
        );

        let mut state = RunState::new(requests.len(), num_steps);
        let driven = self.drive(&ctx, &mut queue, &mut state, requests, responses, frames).await;
        if let Err(e) = driven {
            self.abort(&ctx, &e).await;
            return Err(e);
        }

        for (response, staged) in responses.iter_mut().zip(state.staged) {
            for (slot, value) in staged {
                let Some(output) = response.outputs.get_mut(slot) else { continue };
                match output.value.as_mut() {
                    Some(dest) => dest.data.copy_from_slice(&value.data),
                    None => output.value = Some(value),
                }
            }
        }

        let summary = RunSummary {
            run_id: ctx.run_id,
            requests: requests.len(),
            steps: state.steps,
            early_stopped: state.early_stopped,
            invocations: state.invocations,
            elapsed: started.elapsed(),
        };
        info!(
            run_id = %summary.run_id,
            requests = summary.requests,
            invocations = summary.invocations,
            early_stopped = summary.early_stopped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    /// [`Pipeline::run`] on a private current-thread runtime. Must not be
    /// called from inside an async context.
    pub fn run_blocking(
        &self,
        requests: &[Request],
        responses: &mut [Response],
        num_steps: usize,
    ) -> Result<RunSummary> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| PipelineError::Runtime(format!("building runtime: {e}")))?;
        runtime.block_on(self.run(requests, responses, num_steps))
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// `(batch, seq)` of every request, read from stage 0's length input.
    fn validate_inputs(
        &self,
        requests: &[Request],
        responses: &[Response],
        num_steps: usize,
    ) -> Result<Vec<(usize, usize)>> {
        if requests.len() != responses.len() {
            return Err(PipelineError::InvalidInput(format!(
                "{} requests but {} responses",
                requests.len(),
                responses.len()
            )));
        }
        if num_steps == 0 {
            return Err(PipelineError::InvalidInput("num_steps must be at least 1".into()));
        }
        let first = self
            .config
            .stages
            .first()
            .ok_or_else(|| PipelineError::InvalidInput("pipeline has no stages".into()))?;
        let axes = first.axes.input;

        requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                if request.input_names.len() != request.input_values.len() {
                    return Err(PipelineError::InvalidInput(format!(
                        "request {i}: {} input names but {} values",
                        request.input_names.len(),
                        request.input_values.len()
                    )));
                }
                let length = request.get(&first.seq_len_input).ok_or_else(|| {
                    PipelineError::InvalidInput(format!(
                        "request {i}: missing `{}`",
                        first.seq_len_input
                    ))
                })?;
                let view = length.view();
                let (Some(batch), Some(seq)) = (
                    view.dim(axes.batch).filter(|&b| b > 0),
                    view.dim(axes.seq).filter(|&s| s > 0),
                ) else {
                    return Err(PipelineError::InvalidInput(format!(
                        "request {i}: `{}` has shape {:?}",
                        first.seq_len_input, length.shape
                    )));
                };
                if seq > self.config.max_seq_len {
                    return Err(PipelineError::InvalidInput(format!(
                        "request {i}: prompt length {seq} exceeds max_seq_len {}",
                        self.config.max_seq_len
                    )));
                }
                Ok((batch, seq))
            })
            .collect()
    }

    fn build_frames(
        &self,
        responses: &[Response],
        shapes: &[(usize, usize)],
    ) -> Result<Vec<ExecutionFrame>> {
        responses
            .iter()
            .zip(shapes)
            .enumerate()
            .map(|(index, (response, &(batch, seq)))| {
                let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
                let outputs = response
                    .outputs
                    .iter()
                    .map(|o| OutputSlot { name: o.name.clone(), placement: o.placement })
                    .collect();
                let frame = ExecutionFrame::new(
                    &self.config,
                    &self.engines,
                    request_id,
                    index,
                    batch,
                    seq,
                    outputs,
                )?;
                debug!(
                    request_id,
                    batch,
                    seq,
                    bytes = frame.allocated_bytes(),
                    "execution frame allocated"
                );
                Ok(frame)
            })
            .collect()
    }

    // ── Response loop ────────────────────────────────────────────────────

    async fn drive(
        &self,
        ctx: &Arc<RunContext>,
        queue: &mut ResponseQueue<Completion>,
        state: &mut RunState,
        requests: &[Request],
        responses: &[Response],
        frames: Vec<ExecutionFrame>,
    ) -> Result<()> {
        for (frame, request) in frames.into_iter().zip(requests) {
            let values = request
                .input_names
                .iter()
                .cloned()
                .zip(request.input_values.iter().cloned().map(TensorHandle::Owned))
                .collect();
            let token = Token::with_values(frame.request_id, 0, values);

            let mut progress =
                RequestProgress::new(frame.request_id, self.num_stages(), state.num_steps);
            progress.start()?;
            state.tracked.insert(
                frame.request_id,
                Tracked { index: frame.request_index, orig_len: frame.input_seq_len, progress },
            );
            self.submit(ctx, frame, token)?;
        }

        let wait = Duration::from_millis(self.scheduler.response_timeout_ms);
        while state.done < requests.len() {
            let completion = queue.wait_and_pop(wait).await?;
            state.invocations += 1;
            self.advance(ctx, state, responses, completion)?;
        }
        Ok(())
    }

    fn advance(
        &self,
        ctx: &Arc<RunContext>,
        state: &mut RunState,
        responses: &[Response],
        completion: Completion,
    ) -> Result<()> {
        let Completion { stage, mut frame, mut token } = completion;
        let request_id = frame.request_id;
        if let Some(message) = token.error.take() {
            return Err(PipelineError::RequestFailed { request_id, message });
        }

        let tracked = state.tracked.get_mut(&request_id).ok_or_else(|| {
            PipelineError::Execution(format!("completion for unknown request {request_id}"))
        })?;
        let (index, orig_len) = (tracked.index, tracked.orig_len);
        let transition = tracked.progress.on_stage_complete(stage)?;
        debug!(run_id = %ctx.run_id, request_id, stage, ?transition, "stage completed");

        match transition {
            Transition::NextStage { stage } => {
                frame.stage_index = stage;
                self.submit(ctx, frame, token)
            }
            Transition::NextStep { step } => {
                let logits_name = &self.config.logits_name;
                let logits = token.get(logits_name).ok_or_else(|| {
                    PipelineError::Execution(format!("final stage did not forward `{logits_name}`"))
                })?;
                let next = greedy_next_tokens(
                    &frame.view(logits)?,
                    frame.batch_size,
                    self.config.eos_token_id,
                )?;

                if next.all_eos {
                    tracked.progress.finish_early();
                    info!(
                        run_id = %ctx.run_id,
                        request_id,
                        step,
                        "every batch row reached end-of-sequence"
                    );
                    state.early_stopped += 1;
                    return self.finish(state, responses, index, frame, &token, step);
                }

                let mut next_token = Token::new(request_id, step);
                let positions = next_position_ids(frame.batch_size, orig_len, step);
                next_token.push(
                    self.config.input_ids_name.as_str(),
                    TensorHandle::Owned(next.to_input_ids()),
                );
                next_token.push(
                    self.config.position_ids_name.as_str(),
                    TensorHandle::Owned(positions),
                );
                frame.stage_index = 0;
                self.submit(ctx, frame, next_token)
            }
            Transition::Finished { step } => {
                self.finish(state, responses, index, frame, &token, step + 1)
            }
        }
    }

    /// Stage the requested outputs of a finished request and release its frame.
    fn finish(
        &self,
        state: &mut RunState,
        responses: &[Response],
        index: usize,
        frame: ExecutionFrame,
        token: &Token,
        passes: usize,
    ) -> Result<()> {
        let response = responses.get(index).ok_or_else(|| {
            PipelineError::Execution(format!("no response slot for request index {index}"))
        })?;

        let mut staged = Vec::with_capacity(response.outputs.len());
        for (slot, output) in response.outputs.iter().enumerate() {
            let handle = token
                .get(&output.name)
                .ok_or_else(|| PipelineError::MissingOutput { name: output.name.clone() })?;
            let value = frame.materialize(handle)?;
            if let Some(dest) = &output.value {
                let fits = dest.dtype == value.dtype
                    && dest.data.len() == value.data.len()
                    && element_count(&dest.shape).is_some()
                    && element_count(&dest.shape) == element_count(&value.shape);
                if !fits {
                    return Err(PipelineError::InvalidInput(format!(
                        "output `{}`: destination {:?} {:?} ({} B), produced {:?} {:?} ({} B)",
                        output.name,
                        dest.dtype,
                        dest.shape,
                        dest.data.len(),
                        value.dtype,
                        value.shape,
                        value.data.len()
                    )));
                }
            }
            staged.push((slot, value));
        }

        state.staged[index] = staged;
        state.steps[index] = passes;
        state.done += 1;
        debug!(request_id = frame.request_id, passes, "request finished");
        Ok(())
    }

    fn submit(&self, ctx: &Arc<RunContext>, frame: ExecutionFrame, token: Token) -> Result<()> {
        let runner = self.runners.get(frame.stage_index).ok_or_else(|| {
            PipelineError::Execution(format!("no runner for stage {}", frame.stage_index))
        })?;
        runner.submit(StageTask { ctx: Arc::clone(ctx), frame, token })
    }

    /// Stop the run and wait (bounded) until none of its tasks is queued or
    /// executing. Other runs on the same pipeline keep going.
    async fn abort(&self, ctx: &RunContext, err: &PipelineError) {
        ctx.abort();
        warn!(run_id = %ctx.run_id, error = %err, "aborting run; draining its stage tasks");
        let wait = Duration::from_millis(self.scheduler.response_timeout_ms);
        if tokio::time::timeout(wait, ctx.settled()).await.is_err() {
            warn!(
                run_id = %ctx.run_id,
                in_flight = ctx.in_flight(),
                pending = ?self.runners.iter().map(StageRunner::pending).collect::<Vec<_>>(),
                "run did not drain in time"
            );
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.runners)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

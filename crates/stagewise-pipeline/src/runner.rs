//! Worker pool bound to one pipeline stage.
//!
//! Each stage owns `workers_per_stage` OS threads that pull tasks off a
//! shared channel, run the stage's engine, and push a [`Completion`] to the
//! run's response queue. Frames and tokens move into the task by value and
//! come back in the completion, so a request is only ever touched by one
//! thread at a time.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use stagewise_types::StageConfig;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::InferenceEngine;
use crate::error::{PipelineError, Result};
use crate::frame::ExecutionFrame;
use crate::invoke::execute_stage;
use crate::queue::ResponseSender;
use crate::token::Token;

// ── Run context ──────────────────────────────────────────────────────────────

/// State shared by every task submitted during one run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    responses: ResponseSender<Completion>,
    aborted: AtomicBool,
    /// Tasks of this run queued at or executing on any stage.
    in_flight: AtomicUsize,
    settled: Notify,
}

impl RunContext {
    pub fn new(responses: ResponseSender<Completion>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            responses,
            aborted: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    /// Queued tasks of an aborted run are dropped without executing.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no task of this run is queued or executing on any stage.
    /// Tasks of other runs sharing the same runners are not waited for.
    pub async fn settled(&self) {
        loop {
            let settled = self.settled.notified();
            if self.in_flight() == 0 {
                return;
            }
            settled.await;
        }
    }

    fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn task_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settled.notify_waiters();
        }
    }
}

/// One unit of work for a stage.
#[derive(Debug)]
pub struct StageTask {
    pub ctx: Arc<RunContext>,
    pub frame: ExecutionFrame,
    pub token: Token,
}

/// A finished stage invocation, successful or not.
#[derive(Debug)]
pub struct Completion {
    pub stage: usize,
    pub frame: ExecutionFrame,
    pub token: Token,
}

// ── Stage runner ─────────────────────────────────────────────────────────────

struct Shared {
    stage_index: usize,
    stage: StageConfig,
    max_seq_len: usize,
    engine: Arc<dyn InferenceEngine>,
    pending: AtomicUsize,
    idle: Notify,
}

pub struct StageRunner {
    shared: Arc<Shared>,
    tx: Option<mpsc::UnboundedSender<StageTask>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl StageRunner {
    /// Spawn `workers` threads for `stage`.
    pub fn new(
        stage_index: usize,
        stage: StageConfig,
        max_seq_len: usize,
        engine: Arc<dyn InferenceEngine>,
        workers: usize,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            stage_index,
            stage,
            max_seq_len,
            engine,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let count = workers.max(1);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("stage-{stage_index}-{i}"))
                .spawn(move || worker_loop(shared, rx))
                .map_err(|e| PipelineError::Runtime(format!("spawning stage worker: {e}")))?;
            handles.push(handle);
        }

        info!(
            stage = stage_index,
            name = %shared.stage.name,
            device = %shared.stage.device,
            workers = count,
            "stage runner started"
        );
        Ok(Self { shared, tx: Some(tx), workers: handles })
    }

    pub fn stage_index(&self) -> usize {
        self.shared.stage_index
    }

    pub fn name(&self) -> &str {
        &self.shared.stage.name
    }

    /// Tasks submitted and not yet completed or dropped.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Enqueue a task. Never blocks.
    pub fn submit(&self, task: StageTask) -> Result<()> {
        if task.ctx.is_aborted() {
            return Err(PipelineError::Aborted);
        }
        if task.frame.stage_index != self.shared.stage_index {
            return Err(PipelineError::Execution(format!(
                "request {} routed to stage {} while its frame is at stage {}",
                task.frame.request_id, self.shared.stage_index, task.frame.stage_index
            )));
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(self.stopped());
        };
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        task.ctx.task_started();
        if let Err(mpsc::error::SendError(task)) = tx.send(task) {
            task.ctx.task_finished();
            finish_one(&self.shared);
            return Err(self.stopped());
        }
        Ok(())
    }

    fn stopped(&self) -> PipelineError {
        PipelineError::Runtime(format!("stage {} runner has shut down", self.shared.stage_index))
    }

    /// Wait until every submitted task has completed or been dropped.
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Close the task channel and join every worker.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for StageRunner {
    fn drop(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(stage = self.shared.stage_index, "stage worker exited by panic");
            }
        }
        debug!(stage = self.shared.stage_index, "stage runner stopped");
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage_index", &self.shared.stage_index)
            .field("name", &self.shared.stage.name)
            .field("workers", &self.workers.len())
            .field("pending", &self.pending())
            .finish()
    }
}

fn finish_one(shared: &Shared) {
    if shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.idle.notify_waiters();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Arc<Mutex<mpsc::UnboundedReceiver<StageTask>>>) {
    loop {
        let next = {
            let mut guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.blocking_recv()
        };
        let Some(task) = next else { break };
        let ctx = Arc::clone(&task.ctx);
        run_task(&shared, task);
        finish_one(&shared);
        ctx.task_finished();
    }
}

fn run_task(shared: &Shared, task: StageTask) {
    let StageTask { ctx, mut frame, token } = task;
    let request_id = token.request_id;
    let step = token.step;
    let stage = shared.stage_index;

    if ctx.is_aborted() {
        debug!(run_id = %ctx.run_id, request_id, step, stage, "dropping task of aborted run");
        return;
    }

    let result = catch_unwind(AssertUnwindSafe(|| {
        execute_stage(shared.engine.as_ref(), &shared.stage, shared.max_seq_len, &mut frame, token)
    }));
    let outcome = match result {
        Ok(Ok(token)) => Ok(token),
        Ok(Err(e)) => {
            error!(
                run_id = %ctx.run_id, request_id, step, stage, error = %e,
                "stage invocation failed"
            );
            Err(e.to_string())
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(
                run_id = %ctx.run_id, request_id, step, stage, panic = %msg,
                "stage invocation panicked"
            );
            Err(format!("panic: {msg}"))
        }
    };
    let token = outcome.unwrap_or_else(|msg| {
        let message = format!("error in processing request id: {request_id}: {msg}");
        Token::failed(request_id, step, message)
    });

    let completion = Completion { stage, frame, token };
    if !ctx.responses.push(completion) {
        debug!(run_id = %ctx.run_id, request_id, "response queue gone; completion discarded");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

use std::fmt;

use crate::error::{PipelineError, Result};
use crate::token::RequestId;

// ── Request State Machine ────────────────────────────────────────────────────

/// Queued → Running → Finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Admitted; the first token has not been handed to stage 0 yet.
    Queued,
    /// A token for this request is queued at or executing on some stage.
    Running,
    /// Every step ran, or every row produced end-of-sequence.
    Finished,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued   => write!(f, "Queued"),
            Self::Running  => write!(f, "Running"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// What the orchestrator must do after a stage completes for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Forward the produced token to `stage` within the same step.
    NextStage { stage: usize },
    /// The last stage finished `step - 1`; decode and resubmit to stage 0.
    NextStep { step: usize },
    /// The last stage finished the final step.
    Finished { step: usize },
}

// ── Request Progress ─────────────────────────────────────────────────────────

/// Where one request is in the (step, stage) grid.
#[derive(Debug, Clone)]
pub struct RequestProgress {
    pub request_id: RequestId,
    pub num_stages: usize,
    pub num_steps: usize,
    pub stage: usize,
    pub step: usize,
    pub state: RequestState,
}

impl RequestProgress {
    pub fn new(request_id: RequestId, num_stages: usize, num_steps: usize) -> Self {
        Self {
            request_id,
            num_stages,
            num_steps,
            stage: 0,
            step: 0,
            state: RequestState::Queued,
        }
    }

    /// Transition `Queued → Running` when the first token is submitted.
    pub fn start(&mut self) -> Result<()> {
        if self.state != RequestState::Queued {
            return Err(self.invalid("starting"));
        }
        self.state = RequestState::Running;
        Ok(())
    }

    /// Advance past `completed_stage`.
    ///
    /// The step only increments when the last stage completes, so a
    /// single-stage pipeline advances one step per completion.
    pub fn on_stage_complete(&mut self, completed_stage: usize) -> Result<Transition> {
        if self.state != RequestState::Running {
            return Err(self.invalid("completing a stage"));
        }
        if completed_stage != self.stage {
            return Err(PipelineError::Execution(format!(
                "request {} completed stage {completed_stage} while at stage {}",
                self.request_id, self.stage
            )));
        }

        if completed_stage + 1 < self.num_stages {
            self.stage = completed_stage + 1;
            return Ok(Transition::NextStage { stage: self.stage });
        }

        self.stage = 0;
        if self.step + 1 >= self.num_steps {
            self.state = RequestState::Finished;
            return Ok(Transition::Finished { step: self.step });
        }
        self.step += 1;
        Ok(Transition::NextStep { step: self.step })
    }

    /// Every batch row produced end-of-sequence before `num_steps` ran out.
    pub fn finish_early(&mut self) {
        self.state = RequestState::Finished;
    }

    fn invalid(&self, action: &str) -> PipelineError {
        PipelineError::Execution(format!(
            "request {} cannot transition from {} by {action}",
            self.request_id, self.state
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

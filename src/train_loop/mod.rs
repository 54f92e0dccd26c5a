// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Epoch/step driver over a [`TrainSession`].
//!
//! A [`DataFeed`] fills the session inputs for each step; callbacks observe
//! every phase and may stop training at the end of an epoch.

mod callbacks;

use tracing::{debug, info};

use crate::error::{ExecError, IoError, ResizeError, TensorAccessError};
use crate::session::TrainSession;
use crate::tensor::{TensorData, TensorId};

pub use callbacks::{CheckpointSaver, LossMonitor, LrScheduler};

/// Returned from [`TrainLoopCallback::epoch_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopControl {
    #[default]
    Continue,
    /// Finish the loop normally; `end` callbacks still run.
    StopTraining,
    /// Leave immediately without running `end` callbacks.
    Exit,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("step {step}: {source}")]
    Exec { step: usize, source: ExecError },
    #[error(transparent)]
    Resize(#[from] ResizeError),
    #[error(transparent)]
    Tensor(#[from] TensorAccessError),
    #[error("no graph input named `{0}`")]
    MissingInput(String),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// State handed to every callback.
pub struct LoopContext<'a> {
    pub session: &'a mut TrainSession,
    pub train_mode: bool,
    /// Zero-based.
    pub epoch: usize,
    /// Step within the epoch, zero-based.
    pub step: usize,
    /// Loss of the step that just ran, when the graph produced one.
    pub loss: Option<f32>,
}

#[allow(unused_variables)]
pub trait TrainLoopCallback {
    fn begin(&mut self, ctx: &mut LoopContext<'_>) {}
    fn end(&mut self, ctx: &mut LoopContext<'_>) {}
    fn epoch_begin(&mut self, ctx: &mut LoopContext<'_>) {}
    fn epoch_end(&mut self, ctx: &mut LoopContext<'_>) -> LoopControl {
        LoopControl::Continue
    }
    fn step_begin(&mut self, ctx: &mut LoopContext<'_>) {}
    fn step_end(&mut self, ctx: &mut LoopContext<'_>) {}
}

/// Source of per-step inputs.
pub trait DataFeed {
    /// Steps in one epoch.
    fn steps(&self) -> usize;
    /// Populate the session's inputs for `step`.
    fn feed(&mut self, session: &mut TrainSession, step: usize) -> Result<(), LoopError>;
}

/// One input value of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

/// In-memory batches, resized into the session on demand.
#[derive(Debug, Clone, Default)]
pub struct VecFeed {
    batches: Vec<Vec<BatchInput>>,
}

impl VecFeed {
    pub fn new(batches: Vec<Vec<BatchInput>>) -> Self {
        Self { batches }
    }

    pub fn push(&mut self, batch: Vec<BatchInput>) {
        self.batches.push(batch);
    }
}

impl DataFeed for VecFeed {
    fn steps(&self) -> usize {
        self.batches.len()
    }

    fn feed(&mut self, session: &mut TrainSession, step: usize) -> Result<(), LoopError> {
        let Some(batch) = self.batches.get(step) else {
            return Ok(());
        };
        let mut targets: Vec<(TensorId, &BatchInput)> = Vec::with_capacity(batch.len());
        for input in batch {
            let id = session
                .get_input_by_tensor_name(&input.name)
                .ok_or_else(|| LoopError::MissingInput(input.name.clone()))?;
            targets.push((id, input));
        }
        let stale: Vec<(TensorId, Vec<usize>)> = targets
            .iter()
            .filter(|(id, input)| {
                session
                    .tensor(*id)
                    .is_some_and(|t| !t.is_finalized() || t.shape() != input.shape.as_slice())
            })
            .map(|(id, input)| (*id, input.shape.clone()))
            .collect();
        if !stale.is_empty() {
            let (ids, dims): (Vec<_>, Vec<_>) = stale.into_iter().unzip();
            session.resize(&ids, &dims)?;
        }
        for (id, input) in targets {
            match &input.data {
                TensorData::F32(values) => session.write_f32(id, values)?,
                TensorData::I32(values) => session.write_i32(id, values)?,
            }
        }
        Ok(())
    }
}

/// What a loop did before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    pub epochs: usize,
    pub steps: usize,
    pub control: LoopControl,
}

pub struct TrainLoop<'a> {
    session: &'a mut TrainSession,
}

impl<'a> TrainLoop<'a> {
    pub fn new(session: &'a mut TrainSession) -> Self {
        Self { session }
    }

    pub fn session(&mut self) -> &mut TrainSession {
        self.session
    }

    /// Train for up to `epochs` epochs in train mode.
    pub fn train(
        &mut self,
        epochs: usize,
        feed: &mut dyn DataFeed,
        callbacks: &mut [&mut dyn TrainLoopCallback],
    ) -> Result<LoopOutcome, LoopError> {
        self.session.train();
        info!(epochs, steps = feed.steps(), "training loop started");
        self.drive(true, epochs, feed, callbacks)
    }

    /// One pass over `feed` in eval mode.
    pub fn eval(
        &mut self,
        feed: &mut dyn DataFeed,
        callbacks: &mut [&mut dyn TrainLoopCallback],
    ) -> Result<LoopOutcome, LoopError> {
        self.session.eval();
        self.drive(false, 1, feed, callbacks)
    }

    fn drive(
        &mut self,
        train_mode: bool,
        epochs: usize,
        feed: &mut dyn DataFeed,
        callbacks: &mut [&mut dyn TrainLoopCallback],
    ) -> Result<LoopOutcome, LoopError> {
        let mut ctx = LoopContext {
            session: &mut *self.session,
            train_mode,
            epoch: 0,
            step: 0,
            loss: None,
        };
        let mut outcome = LoopOutcome {
            epochs: 0,
            steps: 0,
            control: LoopControl::Continue,
        };
        callbacks.iter_mut().for_each(|cb| cb.begin(&mut ctx));

        'epochs: for epoch in 0..epochs {
            ctx.epoch = epoch;
            ctx.step = 0;
            callbacks.iter_mut().for_each(|cb| cb.epoch_begin(&mut ctx));
            for step in 0..feed.steps() {
                ctx.step = step;
                ctx.loss = None;
                callbacks.iter_mut().for_each(|cb| cb.step_begin(&mut ctx));
                feed.feed(ctx.session, step)?;
                ctx.session
                    .run_graph()
                    .map_err(|source| LoopError::Exec { step, source })?;
                ctx.loss = ctx.session.last_loss();
                callbacks.iter_mut().for_each(|cb| cb.step_end(&mut ctx));
                outcome.steps += 1;
            }
            outcome.epochs += 1;

            // Every callback sees epoch_end; the strongest request wins.
            let mut control = LoopControl::Continue;
            for cb in callbacks.iter_mut() {
                control = match (control, cb.epoch_end(&mut ctx)) {
                    (LoopControl::Exit, _) | (_, LoopControl::Exit) => LoopControl::Exit,
                    (LoopControl::StopTraining, _) | (_, LoopControl::StopTraining) => LoopControl::StopTraining,
                    _ => LoopControl::Continue,
                };
            }
            match control {
                LoopControl::Continue => {}
                LoopControl::StopTraining => {
                    debug!(epoch, "training stopped by callback");
                    outcome.control = control;
                    break 'epochs;
                }
                LoopControl::Exit => {
                    debug!(epoch, "loop exited by callback");
                    outcome.control = control;
                    return Ok(outcome);
                }
            }
        }

        callbacks.iter_mut().for_each(|cb| cb.end(&mut ctx));
        info!(epochs = outcome.epochs, steps = outcome.steps, "loop finished");
        Ok(outcome)
    }
}

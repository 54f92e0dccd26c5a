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

use std::path::PathBuf;

use tracing::{info, warn};

use super::{LoopContext, LoopControl, TrainLoopCallback};

/// Records every step loss and the mean loss per epoch.
#[derive(Debug, Clone, Default)]
pub struct LossMonitor {
    steps: Vec<f32>,
    current: Vec<f32>,
    epochs: Vec<f32>,
}

impl LossMonitor {
    pub fn step_losses(&self) -> &[f32] {
        &self.steps
    }

    pub fn epoch_means(&self) -> &[f32] {
        &self.epochs
    }
}

impl TrainLoopCallback for LossMonitor {
    fn epoch_begin(&mut self, _: &mut LoopContext<'_>) {
        self.current.clear();
    }

    fn step_end(&mut self, ctx: &mut LoopContext<'_>) {
        if let Some(loss) = ctx.loss {
            self.steps.push(loss);
            self.current.push(loss);
        }
    }

    fn epoch_end(&mut self, ctx: &mut LoopContext<'_>) -> LoopControl {
        if !self.current.is_empty() {
            let mean = self.current.iter().sum::<f32>() / self.current.len() as f32;
            self.epochs.push(mean);
            info!(epoch = ctx.epoch, loss = mean, "epoch finished");
        }
        LoopControl::Continue
    }
}

/// Step decay: every `step_size` epochs the rate is multiplied by `gamma`.
#[derive(Debug, Clone, Copy)]
pub struct LrScheduler {
    pub step_size: usize,
    pub gamma: f32,
}

impl LrScheduler {
    pub fn new(step_size: usize, gamma: f32) -> Self {
        Self { step_size, gamma }
    }
}

impl TrainLoopCallback for LrScheduler {
    fn epoch_end(&mut self, ctx: &mut LoopContext<'_>) -> LoopControl {
        if !ctx.train_mode || self.step_size == 0 || (ctx.epoch + 1) % self.step_size != 0 {
            return LoopControl::Continue;
        }
        let rate = ctx.session.learning_rate() * self.gamma;
        if let Err(err) = ctx.session.set_learning_rate(rate) {
            warn!(epoch = ctx.epoch, %err, "learning rate schedule stopped");
            self.step_size = 0;
        }
        LoopControl::Continue
    }
}

/// Saves `<dir>/<prefix>_epoch<N>.mtgb` every `every` epochs. Failures are
/// logged and do not stop training.
#[derive(Debug, Clone)]
pub struct CheckpointSaver {
    dir: PathBuf,
    prefix: String,
    every: usize,
    saved: Vec<PathBuf>,
}

impl CheckpointSaver {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str, every: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            every: every.max(1),
            saved: Vec::new(),
        }
    }

    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }
}

impl TrainLoopCallback for CheckpointSaver {
    fn epoch_end(&mut self, ctx: &mut LoopContext<'_>) -> LoopControl {
        let epoch = ctx.epoch + 1;
        if !ctx.train_mode || epoch % self.every != 0 {
            return LoopControl::Continue;
        }
        let path = self.dir.join(format!("{}_epoch{epoch}.mtgb", self.prefix));
        match ctx.session.save_to_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "checkpoint saved");
                self.saved.push(path);
            }
            Err(err) => warn!(%err, "checkpoint failed"),
        }
        LoopControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{feed, session};
    use super::super::TrainLoop;
    use super::*;

    #[test]
    fn scheduler_decays_every_step_size_epochs() {
        let mut s = session();
        let mut sched = LrScheduler::new(2, 0.5);
        TrainLoop::new(&mut s).train(5, &mut feed(), &mut [&mut sched]).unwrap();
        assert!((s.learning_rate() - 0.025).abs() < 1e-7);
    }

    #[test]
    fn checkpoints_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session();
        let mut saver = CheckpointSaver::new(dir.path(), "reg", 2);
        let mut monitor = LossMonitor::default();
        TrainLoop::new(&mut s)
            .train(4, &mut feed(), &mut [&mut monitor, &mut saver])
            .unwrap();
        assert_eq!(saver.saved().len(), 2);
        assert_eq!(monitor.step_losses().len(), 8);
        let last = &saver.saved()[1];
        assert!(last.ends_with("reg_epoch4.mtgb"));
        let reloaded = crate::session::TrainSession::open(last, s.config().clone()).unwrap();
        assert_eq!(reloaded.weights(), s.weights());
    }

    #[test]
    fn failed_checkpoint_keeps_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session();
        let mut saver = CheckpointSaver::new(dir.path().join("missing"), "reg", 1);
        let outcome = TrainLoop::new(&mut s).train(2, &mut feed(), &mut [&mut saver]).unwrap();
        assert_eq!(outcome.epochs, 2);
        assert!(saver.saved().is_empty());
    }
}

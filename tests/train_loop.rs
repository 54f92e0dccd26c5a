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

use mindtrain::{
    BatchInput, CheckpointSaver, DType, DataFeed, GraphBuilder, GraphStore, LoopContext, LoopControl, LoopError,
    LossMonitor, LrScheduler, OpKind, Phase, SessionConfig, ShapeDim, TensorData, TrainLoop, TrainLoopCallback,
    TrainParams, TrainSession, VecFeed,
};

/// Two-class classifier over 2-d points.
fn classifier() -> GraphStore {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(2)]);
    let y = b.input("y", DType::I32, vec![ShapeDim::Dynamic]);
    let w = b.weight("w", vec![2, 2], vec![0.0; 4]);
    let bias = b.weight("bias", vec![2], vec![0.0; 2]);
    let logits = b.node("fc", OpKind::Linear { bias: true }, &[x, w, bias], Phase::Always);
    let probs = b.node("probs", OpKind::Softmax, &[logits], Phase::Always);
    let loss = b.node("ce", OpKind::SoftmaxCrossEntropy, &[logits, y], Phase::TrainOnly);
    b.output(probs).output(loss).loss(loss);
    b.train_params(TrainParams {
        learning_rate: 0.5,
        momentum: 0.5,
        weight_decay: 0.0,
    });
    b.build().unwrap()
}

fn batch(points: &[(f32, f32)]) -> Vec<BatchInput> {
    let xs = points.iter().flat_map(|&(a, b)| [a, b]).collect();
    let ys = points.iter().map(|&(a, _)| i32::from(a > 0.0)).collect();
    vec![
        BatchInput {
            name: "x".into(),
            shape: vec![points.len(), 2],
            data: TensorData::F32(xs),
        },
        BatchInput {
            name: "y".into(),
            shape: vec![points.len()],
            data: TensorData::I32(ys),
        },
    ]
}

fn feed() -> VecFeed {
    VecFeed::new(vec![
        batch(&[(1.0, 0.5), (-1.0, 0.2), (2.0, -1.0)]),
        batch(&[(-0.5, -0.5), (0.7, 1.0)]),
        batch(&[(-2.0, 1.0), (1.5, 0.0), (-1.0, -2.0), (0.3, 0.3)]),
    ])
}

fn session() -> TrainSession {
    TrainSession::from_graph(classifier(), SessionConfig::default().with_threads(2)).unwrap()
}

struct EarlyStop {
    threshold: f32,
    monitor: LossMonitor,
}

impl TrainLoopCallback for EarlyStop {
    fn epoch_begin(&mut self, ctx: &mut LoopContext<'_>) {
        self.monitor.epoch_begin(ctx);
    }

    fn step_end(&mut self, ctx: &mut LoopContext<'_>) {
        self.monitor.step_end(ctx);
    }

    fn epoch_end(&mut self, ctx: &mut LoopContext<'_>) -> LoopControl {
        self.monitor.epoch_end(ctx);
        match self.monitor.epoch_means().last() {
            Some(&loss) if loss < self.threshold => LoopControl::StopTraining,
            _ => LoopControl::Continue,
        }
    }
}

#[test]
fn classifier_learns_and_stops_early() {
    let mut s = session();
    let mut stop = EarlyStop {
        threshold: 0.2,
        monitor: LossMonitor::default(),
    };
    let outcome = TrainLoop::new(&mut s).train(500, &mut feed(), &mut [&mut stop]).unwrap();
    assert_eq!(outcome.control, LoopControl::StopTraining);
    assert!(outcome.epochs < 500);
    assert_eq!(outcome.steps, outcome.epochs * 3);

    s.eval();
    let x = s.get_input_by_tensor_name("x").unwrap();
    let y = s.get_input_by_tensor_name("y").unwrap();
    // Labels are not read in eval but must still agree on the batch size.
    s.resize(&[x, y], &[vec![2, 2], vec![2]]).unwrap();
    s.write_f32(x, &[3.0, 0.0, -3.0, 0.0]).unwrap();
    s.run_graph().unwrap();
    let probs = s.read_f32(s.get_output_by_tensor_name("probs").unwrap()).unwrap();
    assert!(probs[1] > 0.9 && probs[2] > 0.9);
}

#[test]
fn schedule_and_checkpoints_compose() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = session();
    let mut sched = LrScheduler::new(1, 0.5);
    let mut saver = CheckpointSaver::new(dir.path(), "clf", 3);
    let outcome = TrainLoop::new(&mut s)
        .train(6, &mut feed(), &mut [&mut sched, &mut saver])
        .unwrap();
    assert_eq!(outcome.epochs, 6);
    assert!((s.learning_rate() - 0.5 / 64.0).abs() < 1e-7);
    assert_eq!(saver.saved().len(), 2);

    let restored = TrainSession::open(&saver.saved()[1], SessionConfig::default()).unwrap();
    assert_eq!(restored.weights(), s.weights());
    // The checkpoint is written after the scheduler ran for that epoch.
    assert_eq!(restored.learning_rate(), s.learning_rate());
}

#[test]
fn eval_pass_reports_no_loss() {
    let mut s = session();
    let mut monitor = LossMonitor::default();
    let outcome = TrainLoop::new(&mut s).eval(&mut feed(), &mut [&mut monitor]).unwrap();
    assert_eq!(outcome.steps, 3);
    assert!(monitor.step_losses().is_empty());
}

struct BrokenFeed;

impl DataFeed for BrokenFeed {
    fn steps(&self) -> usize {
        2
    }

    fn feed(&mut self, session: &mut TrainSession, _step: usize) -> Result<(), LoopError> {
        let x = session.get_input_by_tensor_name("x").unwrap();
        session.resize(&[x], &[vec![1, 3]])?;
        Ok(())
    }
}

#[test]
fn feed_errors_stop_the_loop() {
    let mut s = session();
    let err = TrainLoop::new(&mut s).train(1, &mut BrokenFeed, &mut []).unwrap_err();
    assert!(matches!(err, LoopError::Resize(_)));
}

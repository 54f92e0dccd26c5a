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

use std::ops::ControlFlow;

use mindtrain::{
    CallbackParam, DType, ExecError, GraphBuilder, GraphStore, OpKind, Phase, SessionConfig, SessionManager,
    ShapeDim, TensorBuffer,
};

fn chain() -> GraphStore {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, ShapeDim::from_concrete(&[1, 3]));
    let r = b.node("relu", OpKind::Relu, &[x], Phase::Always);
    let s = b.node("sig", OpKind::Sigmoid, &[r], Phase::Always);
    let d = b.node("drop", OpKind::Dropout { ratio: 0.5 }, &[s], Phase::TrainOnly);
    let i = b.node("copy", OpKind::Identity, &[s], Phase::EvalOnly);
    b.output(s).output(d).output(i);
    b.build().unwrap()
}

#[test]
fn callbacks_see_executed_nodes_in_order() {
    let manager = SessionManager::start();
    let h = manager.init_from_graph(chain(), SessionConfig::default()).unwrap();
    let x = manager.get_input_by_tensor_name(h, "x").unwrap().unwrap();
    manager.write_f32(&x, &[-1.0, 0.0, 2.0]).unwrap();

    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut on_before = |p: &CallbackParam<'_>, inputs: &[&TensorBuffer], _: &[&TensorBuffer]| {
        before.push((p.node_name.to_string(), p.op_name, inputs.len()));
        ControlFlow::Continue(())
    };
    let mut on_after = |p: &CallbackParam<'_>, _: &[&TensorBuffer], outputs: &[&TensorBuffer]| {
        after.push((p.index, outputs[0].as_f32().unwrap().to_vec()));
        ControlFlow::Continue(())
    };
    manager
        .run_graph_with_callbacks(h, Some(&mut on_before), Some(&mut on_after))
        .unwrap();

    assert_eq!(
        before,
        vec![
            ("relu".to_string(), "relu", 1),
            ("sig".to_string(), "sigmoid", 1),
            ("copy".to_string(), "identity", 1),
        ]
    );
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], (0, vec![0.0, 0.0, 2.0]));
    assert_eq!(after[1].1[0], 0.5);
    assert_eq!(after[2].1, after[1].1);
}

#[test]
fn breaking_interrupts_but_keeps_the_session() {
    let manager = SessionManager::start();
    let h = manager.init_from_graph(chain(), SessionConfig::default()).unwrap();
    manager.train(h).unwrap();
    let mut stop_at_dropout = |p: &CallbackParam<'_>, _: &[&TensorBuffer], _: &[&TensorBuffer]| {
        if p.node_name == "drop" {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let err = manager
        .run_graph_with_callbacks(h, Some(&mut stop_at_dropout), None)
        .unwrap_err();
    assert_eq!(err, ExecError::Interrupted { node: "drop".into() });
    assert!(manager.is_train(h).unwrap());
    manager.run_graph(h).unwrap();
}

#[test]
fn dropout_masks_depend_on_seed_only() {
    let run = |seed: u64| {
        let manager = SessionManager::start();
        let config = SessionConfig::default().with_seed(seed);
        let h = manager.init_from_graph(chain(), config).unwrap();
        let x = manager.get_input_by_tensor_name(h, "x").unwrap().unwrap();
        manager.write_f32(&x, &[1.0, 1.0, 1.0]).unwrap();
        manager.train(h).unwrap();
        let d = manager.get_output_by_tensor_name(h, "drop").unwrap().unwrap();
        let mut outs = Vec::new();
        for _ in 0..4 {
            manager.run_graph(h).unwrap();
            outs.push(manager.read_f32(&d).unwrap());
        }
        outs
    };
    let a = run(11);
    assert_eq!(a, run(11));
    for out in &a {
        assert!(out.iter().all(|&v| v == 0.0 || (v - 2.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6));
    }
}

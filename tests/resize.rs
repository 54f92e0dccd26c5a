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
    DType, GraphBuilder, GraphStore, OpKind, Phase, ResizeError, SessionConfig, SessionHandle, SessionManager,
    ShapeDim, TensorInfo,
};

/// x[?,4] -> fc(w[4,2]) -> relu -> y, with a second input z[?,2] added to y.
fn dynamic_batch() -> GraphStore {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(4)]);
    let z = b.input("z", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(2)]);
    let w = b.weight("w", vec![4, 2], vec![0.1; 8]);
    let h = b.node("fc", OpKind::Linear { bias: false }, &[x, w], Phase::Always);
    let r = b.node("act", OpKind::Relu, &[h], Phase::Always);
    let y = b.node("sum", OpKind::Add, &[r, z], Phase::Always);
    b.output(y);
    b.build().unwrap()
}

fn snapshot(manager: &SessionManager, h: SessionHandle) -> Vec<TensorInfo> {
    manager
        .with_session(h, |s| s.tensors().iter().map(|t| t.info()).collect())
        .unwrap()
}

fn session(limit: Option<u64>) -> (SessionManager, SessionHandle) {
    let manager = SessionManager::start();
    let mut config = SessionConfig::default().with_threads(1);
    config.memory_limit_bytes = limit;
    let h = manager.init_from_graph(dynamic_batch(), config).unwrap();
    (manager, h)
}

#[test]
fn resize_propagates_to_downstream_buffers() {
    let (manager, h) = session(None);
    let inputs = manager.get_inputs(h).unwrap();
    manager.resize(h, &inputs, &[vec![3, 4], vec![3, 2]]).unwrap();
    let y = manager.get_output_by_tensor_name(h, "sum").unwrap().unwrap();
    let info = manager.tensor_info(&y).unwrap();
    assert_eq!(info.shape, vec![3, 2]);
    assert!(info.finalized);
    manager.run_graph(h).unwrap();
    assert_eq!(manager.read_f32(&y).unwrap(), vec![0.0; 6]);
}

#[test]
fn incompatible_resize_changes_nothing() {
    let (manager, h) = session(None);
    let inputs = manager.get_inputs(h).unwrap();
    manager.resize(h, &inputs, &[vec![2, 4], vec![2, 2]]).unwrap();
    let before = snapshot(&manager, h);

    // x is fine on its own; z disagrees with the batch of fc's output.
    let err = manager.resize(h, &inputs, &[vec![5, 4], vec![3, 2]]).unwrap_err();
    assert!(matches!(err, ResizeError::IncompatibleShape { ref node, .. } if node == "sum"));
    assert_eq!(snapshot(&manager, h), before);

    // Inner dimension mismatch at the Linear node.
    let err = manager.resize(h, &inputs, &[vec![2, 5], vec![2, 2]]).unwrap_err();
    assert!(matches!(err, ResizeError::IncompatibleShape { ref node, .. } if node == "fc"));
    assert_eq!(snapshot(&manager, h), before);
}

#[test]
fn malformed_requests_are_rejected() {
    let (manager, h) = session(None);
    let inputs = manager.get_inputs(h).unwrap();
    let before = snapshot(&manager, h);
    assert!(matches!(
        manager.resize(h, &inputs, &[vec![2, 4]]),
        Err(ResizeError::ArityMismatch { tensors: 2, dims: 1 })
    ));
    assert!(matches!(
        manager.resize(h, &inputs[..1], &[vec![8]]),
        Err(ResizeError::RankMismatch { expected: 2, actual: 1, .. })
    ));
    let y = manager.get_output_by_tensor_name(h, "sum").unwrap().unwrap();
    assert!(matches!(
        manager.resize(h, &[y], &[vec![2, 2]]),
        Err(ResizeError::NotAnInput(_))
    ));
    assert_eq!(snapshot(&manager, h), before);
}

#[test]
fn memory_limit_rejects_oversized_resize() {
    // At batch 2 the six buffers add up to exactly 128 bytes.
    let (manager, h) = session(Some(128));
    let inputs = manager.get_inputs(h).unwrap();
    manager.resize(h, &inputs, &[vec![2, 4], vec![2, 2]]).unwrap();
    let before = snapshot(&manager, h);
    assert!(matches!(
        manager.resize(h, &inputs, &[vec![64, 4], vec![64, 2]]),
        Err(ResizeError::AllocationFailure { .. })
    ));
    assert_eq!(snapshot(&manager, h), before);
}

#[test]
fn allocator_refusal_is_reported_not_fatal() {
    let (manager, h) = session(None);
    let before = snapshot(&manager, h);
    let inputs = manager.get_inputs(h).unwrap();
    // 2^60 f32 elements: representable, but no allocator can back them.
    let rows = 1usize << 58;
    let err = manager
        .resize(h, &inputs, &[vec![rows, 4], vec![rows, 2]])
        .unwrap_err();
    assert!(matches!(err, ResizeError::AllocationFailure { ref tensor, bytes } if tensor == "x" && bytes == 1 << 62));
    assert_eq!(snapshot(&manager, h), before);

    manager.resize(h, &inputs, &[vec![2, 4], vec![2, 2]]).unwrap();
    manager.run_graph(h).unwrap();
}

#[test]
fn running_before_resize_is_a_shape_mismatch() {
    let (manager, h) = session(None);
    assert!(matches!(
        manager.run_graph(h),
        Err(mindtrain::ExecError::ShapeMismatch { .. })
    ));
}

#[test]
fn resize_on_freed_handle() {
    let (manager, h) = session(None);
    let inputs = manager.get_inputs(h).unwrap();
    manager.free(h);
    assert!(matches!(
        manager.resize(h, &inputs, &[vec![1, 4], vec![1, 2]]),
        Err(ResizeError::InvalidHandle(_))
    ));
}

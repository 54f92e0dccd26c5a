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

use std::sync::Arc;
use std::thread;

use mindtrain::{
    DType, GraphBuilder, GraphStore, InitError, InvalidHandle, ModeError, OpKind, Phase, SessionConfig,
    SessionHandle, SessionManager, ShapeDim, TensorAccessError,
};

fn linear() -> GraphStore {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, ShapeDim::from_concrete(&[1, 4]));
    let w = b.weight("w", vec![4, 2], vec![1.0; 8]);
    let y = b.node("fc", OpKind::Linear { bias: false }, &[x, w], Phase::Always);
    b.output(y);
    b.build().unwrap()
}

fn config() -> SessionConfig {
    SessionConfig::default().with_threads(1)
}

#[test]
fn free_then_lookup_is_invalid_handle() {
    let manager = SessionManager::start();
    let h = manager.init_from_graph(linear(), config()).unwrap();
    let x = manager.get_input_by_tensor_name(h, "x").unwrap().unwrap();
    manager.free(h);

    assert_eq!(manager.get_inputs(h), Err(InvalidHandle(h)));
    assert_eq!(manager.get_output_tensor_names(h), Err(InvalidHandle(h)));
    assert!(matches!(manager.is_train(h), Err(ModeError::InvalidHandle(_))));
    assert!(matches!(manager.read_f32(&x), Err(TensorAccessError::InvalidHandle(_))));
    assert!(manager.run_graph(h).is_err());
    assert_eq!(manager.live_sessions(), 0);
}

#[test]
fn double_free_is_harmless() {
    let manager = SessionManager::start();
    let h = manager.init_from_graph(linear(), config()).unwrap();
    manager.free(h);
    manager.free(h);
    assert_eq!(manager.live_sessions(), 0);
}

#[test]
fn reused_slot_rejects_stale_handle() {
    let manager = SessionManager::start();
    let old = manager.init_from_graph(linear(), config()).unwrap();
    manager.free(old);
    let new = manager.init_from_graph(linear(), config()).unwrap();
    assert_ne!(old, new);
    assert_eq!(old.to_raw() & 0xffff_ffff, new.to_raw() & 0xffff_ffff);
    assert!(manager.get_inputs(old).is_err());
    assert_eq!(manager.get_inputs(new).unwrap().len(), 1);
    // Freeing the stale handle must not release the new session.
    manager.free(old);
    assert_eq!(manager.live_sessions(), 1);
}

#[test]
fn raw_handles_round_trip_and_zero_is_null() {
    let manager = SessionManager::start();
    let h = manager.init_from_graph(linear(), config()).unwrap();
    let raw = h.to_raw();
    assert_ne!(raw, 0);
    assert_eq!(SessionHandle::from_raw(raw), Some(h));
    assert_eq!(SessionHandle::from_raw(0), None);
}

#[test]
fn session_limit_is_enforced() {
    let manager = SessionManager::with_limit(1);
    let first = manager.init_from_graph(linear(), config()).unwrap();
    assert!(matches!(
        manager.init_from_graph(linear(), config()),
        Err(InitError::SessionLimit)
    ));
    manager.free(first);
    assert!(manager.init_from_graph(linear(), config()).is_ok());
}

#[test]
fn oversized_declared_input_fails_init() {
    let mut b = GraphBuilder::new();
    let x = b.input("x", DType::F32, ShapeDim::from_concrete(&[1 << 31, 1 << 29]));
    let y = b.node("act", OpKind::Relu, &[x], Phase::Always);
    b.output(y);
    let manager = SessionManager::start();
    let err = manager.init_from_graph(b.build().unwrap(), config()).unwrap_err();
    assert!(matches!(err, InitError::AllocationFailure { ref tensor, bytes } if tensor == "x" && bytes == 1 << 62));
    assert_eq!(manager.live_sessions(), 0);
    assert!(manager.init_from_graph(linear(), config()).is_ok());
}

#[test]
fn shutdown_releases_everything() {
    let manager = SessionManager::start();
    let handles: Vec<_> = (0..3)
        .map(|_| manager.init_from_graph(linear(), config()).unwrap())
        .collect();
    manager.free(handles[1]);
    assert_eq!(manager.live_sessions(), 2);
    assert_eq!(manager.shutdown(), 2);
}

#[test]
fn sessions_are_usable_from_many_threads() {
    let manager = Arc::new(SessionManager::start());
    let handles: Vec<_> = (0..4)
        .map(|_| manager.init_from_graph(linear(), config()).unwrap())
        .collect();
    let workers: Vec<_> = handles
        .iter()
        .enumerate()
        .map(|(i, &h)| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let x = manager.get_input_by_tensor_name(h, "x").unwrap().unwrap();
                let v = i as f32;
                manager.write_f32(&x, &[v, v, v, v]).unwrap();
                manager.run_graph(h).unwrap();
                let y = manager.get_output_by_tensor_name(h, "fc").unwrap().unwrap();
                manager.read_f32(&y).unwrap()
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        let v = 4.0 * i as f32;
        assert_eq!(worker.join().unwrap(), vec![v, v]);
    }
}

#[test]
fn tensor_refs_are_tied_to_their_session() {
    let manager = SessionManager::start();
    let a = manager.init_from_graph(linear(), config()).unwrap();
    let b = manager.init_from_graph(linear(), config()).unwrap();
    let xa = manager.get_input_by_tensor_name(a, "x").unwrap().unwrap();
    assert_eq!(xa.session(), a);
    assert!(manager.resize(b, &[xa], &[vec![1, 4]]).is_err());

    let y = manager.get_output_by_tensor_name(a, "fc").unwrap().unwrap();
    assert!(matches!(
        manager.write_f32(&y, &[0.0, 0.0]),
        Err(TensorAccessError::ReadOnly(_))
    ));
    let info = manager.tensor_info(&xa).unwrap();
    assert_eq!(info.shape, vec![1, 4]);
    assert_eq!(info.dtype, DType::F32);
}

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

//! Structural checks run before a [`GraphStore`](super::GraphStore) exists.
//!
//! Every check reports a structured [`GraphError`] instead of panicking, so
//! a malformed model file is rejected before any session state is built.

use std::collections::{HashMap, HashSet};

use super::{GraphParts, Phase};
use crate::engine::Mode;
use crate::ops::ShapeError;
use crate::tensor::{TensorId, TensorRole};
use crate::types::{self, DType, ShapeDim};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("node `{node}` references unknown tensor {tensor}")]
    UnknownTensor { node: String, tensor: TensorId },
    #[error("tensor `{tensor}` is used by node `{node}` before it is produced")]
    UseBeforeDefinition { node: String, tensor: String },
    #[error("tensor `{0}` has more than one producer")]
    DuplicateProducer(String),
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName { kind: &'static str, name: String },
    #[error("node `{node}` expects {expected} operands, got {actual}")]
    Arity {
        node: String,
        expected: usize,
        actual: usize,
    },
    #[error("node `{node}` must produce exactly one f32 tensor")]
    BadOutputs { node: String },
    #[error("operand {operand} of node `{node}` must be {expected}, found {actual}")]
    DType {
        node: String,
        operand: usize,
        expected: DType,
        actual: DType,
    },
    #[error("weight `{0}` must have concrete dims and matching initial data")]
    BadWeight(String),
    #[error("tensor `{0}` carries initial data but is not a weight")]
    UnexpectedData(String),
    #[error("graph input `{0}` must be an unproduced tensor with the input role")]
    BadInput(String),
    #[error("graph output `{0}` is not produced by any node")]
    BadOutput(String),
    #[error("node `{node}` reads `{tensor}`, which is not produced in every mode the node runs in")]
    PhaseMismatch { node: String, tensor: String },
    #[error("dropout node `{node}` has ratio {ratio}, expected [0, 1)")]
    BadDropout { node: String, ratio: f32 },
    #[error("loss tensor `{tensor}`: {reason}")]
    BadLoss { tensor: String, reason: &'static str },
    #[error("invalid train params: {0}")]
    BadTrainParams(String),
    #[error("node `{node}`: {source}")]
    Shape { node: String, source: ShapeError },
}

/// Check every structural invariant of a graph.
pub(crate) fn verify_parts(parts: &GraphParts) -> Result<(), GraphError> {
    let tensor_count = parts.tensors.len();
    let name_of = |id: TensorId| parts.tensors[id.index()].name.clone();

    let mut seen = HashSet::new();
    for t in &parts.tensors {
        if !seen.insert(t.name.as_str()) {
            return Err(GraphError::DuplicateName {
                kind: "tensor",
                name: t.name.clone(),
            });
        }
        verify_tensor_decl(t)?;
    }

    let mut defined: HashSet<TensorId> = HashSet::new();
    for &id in &parts.inputs {
        let decl = parts.tensors.get(id.index()).ok_or_else(|| GraphError::UnknownTensor {
            node: "<inputs>".to_string(),
            tensor: id,
        })?;
        if decl.role != TensorRole::Input {
            return Err(GraphError::BadInput(decl.name.clone()));
        }
        defined.insert(id);
    }
    for (i, t) in parts.tensors.iter().enumerate() {
        if t.role == TensorRole::Weight {
            defined.insert(TensorId(i));
        }
    }

    // Inputs and weights are absent: they hold values in every mode.
    let mut producer_phase: HashMap<TensorId, Phase> = HashMap::new();
    let mut node_names = HashSet::new();
    for node in &parts.nodes {
        if !node_names.insert(node.name.as_str()) {
            return Err(GraphError::DuplicateName {
                kind: "node",
                name: node.name.clone(),
            });
        }
        let expected = node.op.arity();
        if node.inputs.len() != expected {
            return Err(GraphError::Arity {
                node: node.name.clone(),
                expected,
                actual: node.inputs.len(),
            });
        }
        for (operand, &id) in node.inputs.iter().enumerate() {
            if id.index() >= tensor_count {
                return Err(GraphError::UnknownTensor {
                    node: node.name.clone(),
                    tensor: id,
                });
            }
            if !defined.contains(&id) {
                return Err(GraphError::UseBeforeDefinition {
                    node: node.name.clone(),
                    tensor: name_of(id),
                });
            }
            let actual = parts.tensors[id.index()].dtype;
            let expected = node.op.input_dtype(operand);
            if actual != expected {
                return Err(GraphError::DType {
                    node: node.name.clone(),
                    operand,
                    expected,
                    actual,
                });
            }
            if let Some(&producer) = producer_phase.get(&id) {
                let stale = [Mode::Train, Mode::Eval]
                    .into_iter()
                    .any(|m| node.phase.active_in(m) && !producer.active_in(m));
                if stale {
                    return Err(GraphError::PhaseMismatch {
                        node: node.name.clone(),
                        tensor: name_of(id),
                    });
                }
            }
        }
        let [out] = node.outputs.as_slice() else {
            return Err(GraphError::BadOutputs {
                node: node.name.clone(),
            });
        };
        let Some(decl) = parts.tensors.get(out.index()) else {
            return Err(GraphError::UnknownTensor {
                node: node.name.clone(),
                tensor: *out,
            });
        };
        if decl.dtype != DType::F32 || matches!(decl.role, TensorRole::Input | TensorRole::Weight) {
            return Err(GraphError::BadOutputs {
                node: node.name.clone(),
            });
        }
        if !defined.insert(*out) {
            return Err(GraphError::DuplicateProducer(decl.name.clone()));
        }
        producer_phase.insert(*out, node.phase);
        if let crate::ops::OpKind::Dropout { ratio } = node.op {
            if !(0.0..1.0).contains(&ratio) {
                return Err(GraphError::BadDropout {
                    node: node.name.clone(),
                    ratio,
                });
            }
        }
    }

    for &id in &parts.outputs {
        let produced = parts.nodes.iter().any(|n| n.outputs.contains(&id));
        if !produced {
            let name = parts.tensors.get(id.index()).map_or_else(|| id.to_string(), |t| t.name.clone());
            return Err(GraphError::BadOutput(name));
        }
    }

    if let Some(loss) = parts.loss {
        verify_loss(parts, loss)?;
    }
    verify_params(parts)
}

fn verify_tensor_decl(t: &super::TensorDecl) -> Result<(), GraphError> {
    match (t.role, &t.init) {
        (TensorRole::Weight, Some(data)) => {
            let shape = ShapeDim::concrete(&t.dims).ok_or_else(|| GraphError::BadWeight(t.name.clone()))?;
            let expected = types::element_count(&shape);
            if data.dtype() != t.dtype || expected != Some(data.len()) {
                return Err(GraphError::BadWeight(t.name.clone()));
            }
            Ok(())
        }
        (TensorRole::Weight, None) => Err(GraphError::BadWeight(t.name.clone())),
        (_, Some(_)) => Err(GraphError::UnexpectedData(t.name.clone())),
        (_, None) => Ok(()),
    }
}

fn verify_loss(parts: &GraphParts, loss: TensorId) -> Result<(), GraphError> {
    let decl = parts.tensors.get(loss.index()).ok_or_else(|| GraphError::UnknownTensor {
        node: "<loss>".to_string(),
        tensor: loss,
    })?;
    let bad = |reason| GraphError::BadLoss {
        tensor: decl.name.clone(),
        reason,
    };
    let producer = parts
        .nodes
        .iter()
        .find(|n| n.outputs.contains(&loss))
        .ok_or_else(|| bad("not produced by any node"))?;
    if !producer.op.is_loss() {
        return Err(bad("producer is not a loss operator"));
    }
    if producer.phase == Phase::EvalOnly {
        return Err(bad("producer never runs in train mode"));
    }
    Ok(())
}

fn verify_params(parts: &GraphParts) -> Result<(), GraphError> {
    let p = parts.params;
    if !(p.learning_rate.is_finite() && p.learning_rate > 0.0) {
        return Err(GraphError::BadTrainParams(format!("learning rate {}", p.learning_rate)));
    }
    if !(0.0..1.0).contains(&p.momentum) {
        return Err(GraphError::BadTrainParams(format!("momentum {}", p.momentum)));
    }
    if !(p.weight_decay.is_finite() && p.weight_decay >= 0.0) {
        return Err(GraphError::BadTrainParams(format!("weight decay {}", p.weight_decay)));
    }
    Ok(())
}

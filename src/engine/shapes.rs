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

//! Buffer allocation and resize planning.
//!
//! A resize is planned against cloned shapes and only committed once every
//! affected buffer has been allocated, so a rejected resize leaves the
//! session exactly as it was.

use tracing::debug;

use crate::error::{InitError, ResizeError};
use crate::graph::GraphStore;
use crate::ops::Shape;
use crate::tensor::{TensorBuffer, TensorId, TensorRole};
use crate::types::{self, DType};

fn bytes_of(dtype: DType, shape: &[usize]) -> u64 {
    types::byte_len(dtype, shape).map_or(u64::MAX, |b| b as u64)
}

/// Allocate one buffer per declared tensor. Tensors whose shape depends on
/// a dynamic input start unfinalized.
pub(crate) fn allocate(graph: &GraphStore, memory_limit: Option<u64>) -> Result<Vec<TensorBuffer>, InitError> {
    let shapes = graph
        .propagate_shapes(&graph.declared_shapes())
        .map_err(|e| InitError::BadModelFile {
            path: graph.origin().and_then(|o| o.path.as_ref()).map_or_else(String::new, |p| p.display().to_string()),
            reason: format!("node `{}`: {}", e.node, e.source),
        })?;
    let mut total = 0u64;
    let mut buffers = Vec::with_capacity(shapes.len());
    for (decl, shape) in graph.tensors().iter().zip(shapes) {
        let failure = |bytes| InitError::AllocationFailure {
            tensor: decl.name.clone(),
            bytes,
        };
        let buffer = match (shape, &decl.init) {
            (Some(shape), Some(data)) => {
                TensorBuffer::with_data(&decl.name, shape.clone(), decl.role, data.clone())
                    .map_err(|_| failure(bytes_of(decl.dtype, &shape)))?
            }
            (Some(shape), None) => TensorBuffer::zeros(&decl.name, decl.dtype, shape.clone(), decl.role)
                .map_err(|_| failure(bytes_of(decl.dtype, &shape)))?,
            (None, _) => TensorBuffer::unfinalized(&decl.name, decl.dtype, decl.dims.len(), decl.role),
        };
        total = total.saturating_add(buffer.byte_len() as u64);
        if memory_limit.is_some_and(|limit| total > limit) {
            return Err(failure(buffer.byte_len() as u64));
        }
        buffers.push(buffer);
    }
    debug!(tensors = buffers.len(), bytes = total, "allocated session buffers");
    Ok(buffers)
}

/// Buffers that a resize will replace, fully allocated but not yet installed.
#[derive(Debug)]
pub(crate) struct ResizePlan {
    replacements: Vec<(TensorId, TensorBuffer)>,
}

impl ResizePlan {
    pub(crate) fn build(
        graph: &GraphStore,
        tensors: &[TensorBuffer],
        targets: &[TensorId],
        dims: &[Vec<usize>],
        memory_limit: Option<u64>,
    ) -> Result<Self, ResizeError> {
        if targets.len() != dims.len() {
            return Err(ResizeError::ArityMismatch {
                tensors: targets.len(),
                dims: dims.len(),
            });
        }
        let mut seeds: Vec<Option<Shape>> = tensors
            .iter()
            .map(|t| match t.role() {
                TensorRole::Input | TensorRole::Weight if t.is_finalized() => Some(t.shape().to_vec()),
                _ => None,
            })
            .collect();
        for (&id, shape) in targets.iter().zip(dims) {
            let Some(current) = tensors.get(id.index()) else {
                return Err(ResizeError::NotAnInput(id.to_string()));
            };
            if !graph.inputs().contains(&id) {
                return Err(ResizeError::NotAnInput(current.name().to_string()));
            }
            let expected = graph.tensor(id).map_or(0, |d| d.dims.len());
            if shape.len() != expected {
                return Err(ResizeError::RankMismatch {
                    tensor: current.name().to_string(),
                    expected,
                    actual: shape.len(),
                });
            }
            seeds[id.index()] = Some(shape.clone());
        }

        let shapes = graph
            .propagate_shapes(&seeds)
            .map_err(|e| ResizeError::IncompatibleShape {
                node: e.node,
                source: e.source,
            })?;

        let mut replacements = Vec::new();
        let mut total = 0u64;
        for (i, (current, shape)) in tensors.iter().zip(&shapes).enumerate() {
            let Some(shape) = shape else {
                total = total.saturating_add(current.byte_len() as u64);
                continue;
            };
            if current.is_finalized() && current.shape() == shape.as_slice() {
                total = total.saturating_add(current.byte_len() as u64);
                continue;
            }
            let mut next =
                TensorBuffer::unfinalized(current.name(), current.dtype(), current.shape().len(), current.role());
            next.reallocate(shape.clone()).map_err(|_| ResizeError::AllocationFailure {
                tensor: current.name().to_string(),
                bytes: bytes_of(current.dtype(), shape),
            })?;
            total = total.saturating_add(next.byte_len() as u64);
            if memory_limit.is_some_and(|limit| total > limit) {
                return Err(ResizeError::AllocationFailure {
                    tensor: current.name().to_string(),
                    bytes: next.byte_len() as u64,
                });
            }
            replacements.push((TensorId(i), next));
        }
        Ok(Self { replacements })
    }

    pub(crate) fn changed(&self) -> usize {
        self.replacements.len()
    }

    /// Install the planned buffers. Cannot fail.
    pub(crate) fn commit(self, tensors: &mut [TensorBuffer]) {
        for (id, buffer) in self.replacements {
            tensors[id.index()] = buffer;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Phase};
    use crate::ops::OpKind;
    use crate::types::ShapeDim;

    fn graph() -> GraphStore {
        let mut b = GraphBuilder::new();
        let x = b.input("x", DType::F32, vec![ShapeDim::Dynamic, ShapeDim::Known(4)]);
        let w = b.weight("w", vec![4, 2], vec![1.0; 8]);
        let y = b.node("fc", OpKind::Linear { bias: false }, &[x, w], Phase::Always);
        b.output(y);
        b.build().unwrap()
    }

    #[test]
    fn dynamic_tensors_start_unfinalized() {
        let g = graph();
        let buffers = allocate(&g, None).unwrap();
        assert!(!buffers[0].is_finalized());
        assert!(buffers[1].is_finalized());
        assert!(!buffers[2].is_finalized());
    }

    #[test]
    fn plan_then_commit() {
        let g = graph();
        let mut buffers = allocate(&g, None).unwrap();
        let plan = ResizePlan::build(&g, &buffers, &[TensorId(0)], &[vec![3, 4]], None).unwrap();
        assert_eq!(plan.changed(), 2);
        plan.commit(&mut buffers);
        assert_eq!(buffers[2].shape(), &[3, 2]);
        assert_eq!(buffers[1].as_f32().unwrap(), &[1.0; 8]);
    }

    #[test]
    fn memory_limit_applies() {
        let g = graph();
        let err = allocate(&g, Some(16)).unwrap_err();
        assert!(matches!(err, InitError::AllocationFailure { ref tensor, .. } if tensor == "w"));

        let buffers = allocate(&g, Some(64)).unwrap();
        let err = ResizePlan::build(&g, &buffers, &[TensorId(0)], &[vec![100, 4]], Some(64)).unwrap_err();
        assert!(matches!(err, ResizeError::AllocationFailure { .. }));
    }

    #[test]
    fn only_inputs_resize() {
        let g = graph();
        let buffers = allocate(&g, None).unwrap();
        let err = ResizePlan::build(&g, &buffers, &[TensorId(1)], &[vec![4, 2]], None).unwrap_err();
        assert_eq!(err, ResizeError::NotAnInput("w".into()));
        let err = ResizePlan::build(&g, &buffers, &[TensorId(0)], &[vec![4]], None).unwrap_err();
        assert!(matches!(err, ResizeError::RankMismatch { expected: 2, actual: 1, .. }));
    }
}

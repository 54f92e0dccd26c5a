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

//! Immutable structural description of a model graph.
//!
//! A [`GraphStore`] is built once, either by decoding a model file
//! ([`format::decode`]) or with a [`GraphBuilder`], and verified on
//! construction. Afterwards only weight *values* change, and those live in
//! the session's tensor buffers, not here.

pub mod format;
pub mod varint;
pub mod verify;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::Mode;
use crate::ops::{OpKind, Shape, ShapeError};
use crate::tensor::{TensorData, TensorId, TensorRole};
use crate::types::{DType, ShapeDim};

pub use verify::GraphError;

/// Which modes a node executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Always,
    TrainOnly,
    EvalOnly,
}

impl Phase {
    pub fn active_in(self, mode: Mode) -> bool {
        match self {
            Phase::Always => true,
            Phase::TrainOnly => mode == Mode::Train,
            Phase::EvalOnly => mode == Mode::Eval,
        }
    }

    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            Phase::Always => 0,
            Phase::TrainOnly => 1,
            Phase::EvalOnly => 2,
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Phase::Always),
            1 => Some(Phase::TrainOnly),
            2 => Some(Phase::EvalOnly),
            _ => None,
        }
    }
}

/// Declared tensor: name, element type, declared dimensions, role and, for
/// weights, initial values.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDecl {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<ShapeDim>,
    pub role: TensorRole,
    pub init: Option<TensorData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub phase: Phase,
}

/// Optimizer parameters stored alongside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

/// Where a graph was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOrigin {
    pub path: Option<PathBuf>,
    /// SHA-256 of the encoded model, hex.
    pub digest: String,
}

#[derive(Debug, Clone)]
pub struct GraphStore {
    tensors: Vec<TensorDecl>,
    nodes: Vec<Node>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    loss: Option<TensorId>,
    params: TrainParams,
    origin: Option<ModelOrigin>,
    tensor_index: HashMap<String, TensorId>,
    node_index: HashMap<String, usize>,
    producers: Vec<Option<usize>>,
}

/// Raw graph parts, assembled by the decoder and the builder before verification.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphParts {
    pub tensors: Vec<TensorDecl>,
    pub nodes: Vec<Node>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub loss: Option<TensorId>,
    pub params: TrainParams,
}

/// Shape propagation failure at a specific node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeShapeError {
    pub node: String,
    pub source: ShapeError,
}

impl GraphStore {
    pub(crate) fn from_parts(parts: GraphParts) -> Result<Self, GraphError> {
        verify::verify_parts(&parts)?;
        let tensor_index = parts
            .tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), TensorId(i)))
            .collect();
        let node_index = parts
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let mut producers = vec![None; parts.tensors.len()];
        for (i, node) in parts.nodes.iter().enumerate() {
            for out in &node.outputs {
                producers[out.index()] = Some(i);
            }
        }
        let graph = Self {
            tensors: parts.tensors,
            nodes: parts.nodes,
            inputs: parts.inputs,
            outputs: parts.outputs,
            loss: parts.loss,
            params: parts.params,
            origin: None,
            tensor_index,
            node_index,
            producers,
        };
        graph
            .propagate_shapes(&graph.declared_shapes())
            .map_err(|e| GraphError::Shape {
                node: e.node,
                source: e.source,
            })?;
        Ok(graph)
    }

    pub(crate) fn with_origin(mut self, origin: ModelOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub(crate) fn parts(&self) -> GraphParts {
        GraphParts {
            tensors: self.tensors.clone(),
            nodes: self.nodes.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            loss: self.loss,
            params: self.params,
        }
    }

    pub fn tensors(&self) -> &[TensorDecl] {
        &self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorDecl> {
        self.tensors.get(id.index())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.node_index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn weights(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors
            .iter()
            .enumerate()
            .filter(|(_, t)| t.role == TensorRole::Weight)
            .map(|(i, _)| TensorId(i))
    }

    pub fn loss(&self) -> Option<TensorId> {
        self.loss
    }

    pub fn train_params(&self) -> TrainParams {
        self.params
    }

    pub fn origin(&self) -> Option<&ModelOrigin> {
        self.origin.as_ref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.digest.as_str())
    }

    pub fn tensor_id(&self, name: &str) -> Option<TensorId> {
        self.tensor_index.get(name).copied()
    }

    /// Index of the node producing `id`, if any.
    pub fn producer(&self, id: TensorId) -> Option<usize> {
        self.producers.get(id.index()).copied().flatten()
    }

    /// Structural equality: tensors (names, dtypes, dims, roles), nodes and
    /// designations. Weight values and train params are not compared.
    pub fn same_structure(&self, other: &GraphStore) -> bool {
        let decls_match = self.tensors.len() == other.tensors.len()
            && self.tensors.iter().zip(&other.tensors).all(|(a, b)| {
                a.name == b.name && a.dtype == b.dtype && a.dims == b.dims && a.role == b.role
            });
        decls_match
            && self.nodes == other.nodes
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.loss == other.loss
    }

    /// Shapes known from declarations alone: concrete inputs and weights.
    pub(crate) fn declared_shapes(&self) -> Vec<Option<Shape>> {
        self.tensors
            .iter()
            .map(|t| match t.role {
                TensorRole::Input | TensorRole::Weight => ShapeDim::concrete(&t.dims),
                _ => None,
            })
            .collect()
    }

    /// Propagate shapes through every node in stored order. `seeds` holds one
    /// entry per tensor; node outputs are overwritten. A node with any unknown
    /// operand yields an unknown output.
    pub(crate) fn propagate_shapes(&self, seeds: &[Option<Shape>]) -> Result<Vec<Option<Shape>>, NodeShapeError> {
        let mut shapes = seeds.to_vec();
        for node in &self.nodes {
            let operands: Option<Vec<&[usize]>> = node
                .inputs
                .iter()
                .map(|id| shapes[id.index()].as_deref())
                .collect();
            let out = match operands {
                Some(operands) => Some(node.op.infer_shape(&operands).map_err(|source| NodeShapeError {
                    node: node.name.clone(),
                    source,
                })?),
                None => None,
            };
            for id in &node.outputs {
                shapes[id.index()] = out.clone();
            }
        }
        Ok(shapes)
    }
}

impl fmt::Display for GraphStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.tensors {
            writeln!(
                f,
                "tensor {} {}{} {:?}",
                t.name,
                t.dtype,
                crate::types::format_dims(&t.dims),
                t.role
            )?;
        }
        for n in &self.nodes {
            let ins: Vec<&str> = n.inputs.iter().map(|i| self.tensors[i.index()].name.as_str()).collect();
            let outs: Vec<&str> = n.outputs.iter().map(|i| self.tensors[i.index()].name.as_str()).collect();
            writeln!(f, "node {} = {}({}) -> {} [{:?}]", n.name, n.op, ins.join(", "), outs.join(", "), n.phase)?;
        }
        Ok(())
    }
}

/// Incremental construction of a [`GraphStore`].
///
/// ```
/// use mindtrain::graph::{GraphBuilder, Phase};
/// use mindtrain::ops::OpKind;
/// use mindtrain::types::{DType, ShapeDim};
///
/// let mut b = GraphBuilder::new();
/// let x = b.input("x", DType::F32, vec![ShapeDim::Known(1), ShapeDim::Known(4)]);
/// let w = b.weight("w", vec![4, 2], vec![0.0; 8]);
/// let y = b.node("fc", OpKind::Linear { bias: false }, &[x, w], Phase::Always);
/// b.output(y);
/// let graph = b.build().unwrap();
/// assert_eq!(graph.nodes().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    parts: GraphParts,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, decl: TensorDecl) -> TensorId {
        let id = TensorId(self.parts.tensors.len());
        self.parts.tensors.push(decl);
        id
    }

    pub fn input(&mut self, name: &str, dtype: DType, dims: Vec<ShapeDim>) -> TensorId {
        let id = self.push(TensorDecl {
            name: name.to_string(),
            dtype,
            dims,
            role: TensorRole::Input,
            init: None,
        });
        self.parts.inputs.push(id);
        id
    }

    pub fn weight(&mut self, name: &str, shape: Vec<usize>, values: Vec<f32>) -> TensorId {
        self.push(TensorDecl {
            name: name.to_string(),
            dtype: DType::F32,
            dims: ShapeDim::from_concrete(&shape),
            role: TensorRole::Weight,
            init: Some(TensorData::F32(values)),
        })
    }

    /// Add a node with a single output tensor named after the node.
    pub fn node(&mut self, name: &str, op: OpKind, inputs: &[TensorId], phase: Phase) -> TensorId {
        let dims = self.derive_dims(&op, inputs);
        let out = self.push(TensorDecl {
            name: name.to_string(),
            dtype: DType::F32,
            dims,
            role: TensorRole::Intermediate,
            init: None,
        });
        self.parts.nodes.push(Node {
            name: name.to_string(),
            op,
            inputs: inputs.to_vec(),
            outputs: vec![out],
            phase,
        });
        out
    }

    /// Designate `id` as a graph output.
    pub fn output(&mut self, id: TensorId) -> &mut Self {
        if let Some(t) = self.parts.tensors.get_mut(id.index()) {
            t.role = TensorRole::Output;
        }
        self.parts.outputs.push(id);
        self
    }

    pub fn loss(&mut self, id: TensorId) -> &mut Self {
        self.parts.loss = Some(id);
        self
    }

    pub fn train_params(&mut self, params: TrainParams) -> &mut Self {
        self.parts.params = params;
        self
    }

    pub fn build(self) -> Result<GraphStore, GraphError> {
        GraphStore::from_parts(self.parts)
    }

    /// Declared output dims: concrete when every operand is, otherwise all
    /// dynamic with the rank the rule would produce.
    fn derive_dims(&self, op: &OpKind, inputs: &[TensorId]) -> Vec<ShapeDim> {
        let mut dynamic = false;
        let mut sample: Vec<Vec<usize>> = Vec::with_capacity(inputs.len());
        for id in inputs {
            let Some(decl) = self.parts.tensors.get(id.index()) else {
                return Vec::new();
            };
            dynamic |= !ShapeDim::all_known(&decl.dims);
            sample.push(decl.dims.iter().map(|d| d.known().unwrap_or(1)).collect());
        }
        let refs: Vec<&[usize]> = sample.iter().map(Vec::as_slice).collect();
        match op.infer_shape(&refs) {
            Ok(shape) if !dynamic => ShapeDim::from_concrete(&shape),
            Ok(shape) => vec![ShapeDim::Dynamic; shape.len()],
            Err(_) => vec![ShapeDim::Dynamic; sample.first().map_or(0, Vec::len)],
        }
    }
}

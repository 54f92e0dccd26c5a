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

use std::collections::HashMap;
use std::ops::ControlFlow;

use tracing::{debug, warn};

use super::{ExecutionEngine, Mode};
use crate::error::ExecError;
use crate::graph::{GraphStore, Node};
use crate::ops::{self, KernelCtx};
use crate::tensor::{TensorBuffer, TensorData, TensorId, TensorRole};

/// Identifies the node a kernel callback fires for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackParam<'a> {
    pub node_name: &'a str,
    pub op_name: &'static str,
    /// Position of the node in the graph.
    pub index: usize,
}

/// Called with the node identity, its input tensors and its output tensors.
/// Returning `ControlFlow::Break` stops the run.
pub type KernelCallback<'a> =
    dyn FnMut(&CallbackParam<'_>, &[&TensorBuffer], &[&TensorBuffer]) -> ControlFlow<()> + 'a;

/// What one `run` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub mode: Mode,
    pub executed: usize,
    pub skipped: usize,
    /// Loss value when a loss node ran.
    pub loss: Option<f32>,
    /// Weights updated by the optimizer.
    pub updated: usize,
}

struct Executed {
    node: usize,
    mask: Option<Vec<f32>>,
}

impl ExecutionEngine {
    /// Walk the schedule in the current mode. In train mode with a loss that
    /// ran, back-propagate and step the optimizer afterwards.
    pub fn run(
        &mut self,
        graph: &GraphStore,
        tensors: &mut [TensorBuffer],
        mut before: Option<&mut KernelCallback<'_>>,
        mut after: Option<&mut KernelCallback<'_>>,
    ) -> Result<RunSummary, ExecError> {
        let mode = self.mode();
        for &id in graph.inputs() {
            let t = &tensors[id.index()];
            if !t.is_finalized() {
                return Err(ExecError::ShapeMismatch {
                    tensor: t.name().to_string(),
                });
            }
        }

        let mut summary = RunSummary {
            mode,
            ..RunSummary::default()
        };
        let mut executed = Vec::new();
        let schedule = self.schedule.clone();
        for index in schedule {
            let node = &graph.nodes()[index];
            if !node.phase.active_in(mode) {
                summary.skipped += 1;
                continue;
            }
            let param = CallbackParam {
                node_name: &node.name,
                op_name: node.op.name(),
                index,
            };
            if let Some(cb) = before.as_deref_mut() {
                if run_callback(cb, &param, node, tensors).is_break() {
                    return Err(ExecError::Interrupted {
                        node: node.name.clone(),
                    });
                }
            }
            let mask = self.forward_node(index, node, tensors)?;
            if let Some(cb) = after.as_deref_mut() {
                if run_callback(cb, &param, node, tensors).is_break() {
                    return Err(ExecError::Interrupted {
                        node: node.name.clone(),
                    });
                }
            }
            executed.push(Executed { node: index, mask });
            summary.executed += 1;
        }

        if mode == Mode::Train {
            match graph.loss() {
                Some(loss) if executed.iter().any(|e| graph.nodes()[e.node].outputs.contains(&loss)) => {
                    summary.loss = tensors[loss.index()].as_f32().and_then(|v| v.first().copied());
                    summary.updated = self.backward(graph, tensors, loss, &executed)?;
                }
                Some(_) => {}
                None if !self.warned_no_loss => {
                    warn!("train mode without a loss tensor; running forward only");
                    self.warned_no_loss = true;
                }
                None => {}
            }
            self.runs = self.runs.wrapping_add(1);
        } else if let Some(loss) = graph.loss() {
            if executed.iter().any(|e| graph.nodes()[e.node].outputs.contains(&loss)) {
                summary.loss = tensors[loss.index()].as_f32().and_then(|v| v.first().copied());
            }
        }
        debug!(
            mode = %mode,
            executed = summary.executed,
            skipped = summary.skipped,
            loss = ?summary.loss,
            "graph run finished"
        );
        Ok(summary)
    }

    fn forward_node(
        &self,
        index: usize,
        node: &Node,
        tensors: &mut [TensorBuffer],
    ) -> Result<Option<Vec<f32>>, ExecError> {
        let failure = |reason: String| ExecError::NodeFailure {
            node: node.name.clone(),
            index,
            reason,
        };
        let out = {
            let inputs: Vec<&TensorBuffer> = node.inputs.iter().map(|id| &tensors[id.index()]).collect();
            if let Some(t) = inputs.iter().find(|t| !t.is_finalized()) {
                return Err(ExecError::ShapeMismatch {
                    tensor: t.name().to_string(),
                });
            }
            let ctx = KernelCtx {
                mode: self.mode(),
                pool: self.active_pool(),
                seed: self.node_seed(index),
            };
            ops::kernels::forward(&node.op, &ctx, &inputs).map_err(|e| failure(e.to_string()))?
        };
        let Some(&target) = node.outputs.first() else {
            return Err(failure("node has no output".to_string()));
        };
        let buffer = &mut tensors[target.index()];
        if buffer.shape() != out.shape.as_slice() || !buffer.is_finalized() {
            buffer.reallocate(out.shape.clone()).map_err(|e| failure(e.to_string()))?;
        }
        buffer
            .replace_data(TensorData::F32(out.values))
            .map_err(|e| failure(e.to_string()))?;
        Ok(out.mask)
    }

    /// Reverse-mode pass from `loss` over the executed nodes, then one
    /// optimizer step per weight that received a gradient.
    fn backward(
        &mut self,
        graph: &GraphStore,
        tensors: &mut [TensorBuffer],
        loss: TensorId,
        executed: &[Executed],
    ) -> Result<usize, ExecError> {
        let mut grads: HashMap<TensorId, Vec<f32>> = HashMap::new();
        grads.insert(loss, vec![1.0]);

        for step in executed.iter().rev() {
            let node = &graph.nodes()[step.node];
            let Some(&out) = node.outputs.first() else {
                continue;
            };
            let Some(upstream) = grads.remove(&out) else {
                continue;
            };
            let inputs: Vec<&TensorBuffer> = node.inputs.iter().map(|id| &tensors[id.index()]).collect();
            let output = &tensors[out.index()];
            let operand_grads = ops::grad::backward(
                &node.op,
                &inputs,
                output.as_f32().unwrap_or(&[]),
                output.shape(),
                &upstream,
                step.mask.as_deref(),
                self.active_pool(),
            )
            .map_err(|e| ExecError::NodeFailure {
                node: node.name.clone(),
                index: step.node,
                reason: e.to_string(),
            })?;
            for (operand, (id, grad)) in node.inputs.iter().zip(operand_grads).enumerate() {
                let Some(grad) = grad else { continue };
                if !node.op.differentiable_input(operand) || tensors[id.index()].role() == TensorRole::Input {
                    continue;
                }
                match grads.get_mut(id) {
                    Some(acc) => acc.iter_mut().zip(&grad).for_each(|(a, g)| *a += g),
                    None => {
                        grads.insert(*id, grad);
                    }
                }
            }
        }

        let mut updated = 0;
        for id in graph.weights() {
            let Some(grad) = grads.get(&id) else { continue };
            if let Some(values) = tensors[id.index()].as_f32_mut() {
                self.optimizer.step(id, values, grad);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

fn run_callback(
    cb: &mut KernelCallback<'_>,
    param: &CallbackParam<'_>,
    node: &Node,
    tensors: &[TensorBuffer],
) -> ControlFlow<()> {
    let inputs: Vec<&TensorBuffer> = node.inputs.iter().map(|id| &tensors[id.index()]).collect();
    let outputs: Vec<&TensorBuffer> = node.outputs.iter().map(|id| &tensors[id.index()]).collect();
    cb(param, &inputs, &outputs)
}

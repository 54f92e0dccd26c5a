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

//! Backward rules: given a node's operands, its forward output and the
//! gradient of the loss with respect to that output, produce the gradient
//! for every differentiable operand.

use rayon::ThreadPool;

use super::kernels::{check_labels, f32_operand, matmul, softmax_rows, KernelError};
use super::shape::broadcast_index_map;
use super::OpKind;
use crate::tensor::TensorBuffer;

/// Gradients per operand, `None` where the operand is not differentiable.
pub type OperandGrads = Vec<Option<Vec<f32>>>;

pub fn backward(
    op: &OpKind,
    inputs: &[&TensorBuffer],
    output: &[f32],
    out_shape: &[usize],
    upstream: &[f32],
    mask: Option<&[f32]>,
    pool: Option<&ThreadPool>,
) -> Result<OperandGrads, KernelError> {
    match op {
        OpKind::Linear { bias } => {
            let x = f32_operand(inputs, 0)?;
            let w = f32_operand(inputs, 1)?;
            let (n, k) = (inputs[0].shape()[0], inputs[0].shape()[1]);
            let m = inputs[1].shape()[1];
            let (dx, dw) = matmul_grads(x, w, upstream, n, k, m, pool);
            let mut grads = vec![Some(dx), Some(dw)];
            if *bias {
                let mut db = vec![0.0f32; m];
                for row in upstream.chunks(m.max(1)) {
                    db.iter_mut().zip(row).for_each(|(d, g)| *d += g);
                }
                grads.push(Some(db));
            }
            Ok(grads)
        }
        OpKind::MatMul => {
            let a = f32_operand(inputs, 0)?;
            let b = f32_operand(inputs, 1)?;
            let (n, k) = (inputs[0].shape()[0], inputs[0].shape()[1]);
            let m = inputs[1].shape()[1];
            let (da, db) = matmul_grads(a, b, upstream, n, k, m, pool);
            Ok(vec![Some(da), Some(db)])
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul => {
            let lhs = f32_operand(inputs, 0)?;
            let rhs = f32_operand(inputs, 1)?;
            let li = broadcast_index_map(inputs[0].shape(), out_shape);
            let ri = broadcast_index_map(inputs[1].shape(), out_shape);
            let mut dl = vec![0.0f32; lhs.len()];
            let mut dr = vec![0.0f32; rhs.len()];
            for (flat, &g) in upstream.iter().enumerate() {
                let (i, j) = (li[flat], ri[flat]);
                match op {
                    OpKind::Add => {
                        dl[i] += g;
                        dr[j] += g;
                    }
                    OpKind::Sub => {
                        dl[i] += g;
                        dr[j] -= g;
                    }
                    _ => {
                        dl[i] += g * rhs[j];
                        dr[j] += g * lhs[i];
                    }
                }
            }
            Ok(vec![Some(dl), Some(dr)])
        }
        OpKind::Relu => {
            let x = f32_operand(inputs, 0)?;
            let dx = x
                .iter()
                .zip(upstream)
                .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
                .collect();
            Ok(vec![Some(dx)])
        }
        OpKind::Sigmoid => {
            let dx = output.iter().zip(upstream).map(|(&y, &g)| g * y * (1.0 - y)).collect();
            Ok(vec![Some(dx)])
        }
        OpKind::Tanh => {
            let dx = output.iter().zip(upstream).map(|(&y, &g)| g * (1.0 - y * y)).collect();
            Ok(vec![Some(dx)])
        }
        OpKind::Identity => Ok(vec![Some(upstream.to_vec())]),
        OpKind::Dropout { .. } => {
            let dx = match mask {
                Some(mask) => upstream.iter().zip(mask).map(|(g, m)| g * m).collect(),
                None => upstream.to_vec(),
            };
            Ok(vec![Some(dx)])
        }
        OpKind::Softmax => {
            let last = out_shape.last().copied().unwrap_or(1).max(1);
            let mut dx = vec![0.0f32; output.len()];
            for ((y, g), d) in output.chunks(last).zip(upstream.chunks(last)).zip(dx.chunks_mut(last)) {
                let dot: f32 = y.iter().zip(g).map(|(a, b)| a * b).sum();
                for ((d, &yv), &gv) in d.iter_mut().zip(y).zip(g) {
                    *d = yv * (gv - dot);
                }
            }
            Ok(vec![Some(dx)])
        }
        OpKind::MseLoss => {
            let p = f32_operand(inputs, 0)?;
            let t = f32_operand(inputs, 1)?;
            let g = upstream.first().copied().unwrap_or(1.0);
            let scale = if p.is_empty() { 0.0 } else { 2.0 * g / p.len() as f32 };
            let dp = p.iter().zip(t).map(|(a, b)| scale * (a - b)).collect();
            Ok(vec![Some(dp), None])
        }
        OpKind::SoftmaxCrossEntropy => {
            let logits = f32_operand(inputs, 0)?;
            let labels = inputs[1].as_i32().ok_or(KernelError::DType {
                index: 1,
                expected: crate::types::DType::I32,
            })?;
            let classes = inputs[0].shape()[1];
            check_labels(labels, classes)?;
            let g = upstream.first().copied().unwrap_or(1.0);
            let n = labels.len().max(1) as f32;
            let mut dl = softmax_rows(logits, classes);
            for (row, &label) in labels.iter().enumerate() {
                dl[row * classes + label as usize] -= 1.0;
            }
            dl.iter_mut().for_each(|v| *v *= g / n);
            Ok(vec![Some(dl), None])
        }
    }
}

/// Gradients of `a[n,k] · b[k,m]`: `da = g · bᵀ`, `db = aᵀ · g`.
fn matmul_grads(
    a: &[f32],
    b: &[f32],
    g: &[f32],
    n: usize,
    k: usize,
    m: usize,
    pool: Option<&ThreadPool>,
) -> (Vec<f32>, Vec<f32>) {
    let bt = super::kernels::transpose(b, k, m);
    let at = super::kernels::transpose(a, n, k);
    let da = matmul(g, &bt, n, m, k, pool);
    let db = matmul(&at, g, k, n, m, pool);
    (da, db)
}

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

//! Forward CPU kernels.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;

use super::shape::{broadcast_index_map, ShapeError};
use super::OpKind;
use crate::engine::Mode;
use crate::tensor::TensorBuffer;
use crate::types::DType;

/// Per-invocation context handed to a kernel.
#[derive(Clone, Copy)]
pub struct KernelCtx<'a> {
    pub mode: Mode,
    /// Worker pool for row-parallel kernels; `None` runs on the calling thread.
    pub pool: Option<&'a ThreadPool>,
    /// Seed for stochastic kernels, derived per node and per run.
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("operand {index} must be {expected}")]
    DType { index: usize, expected: DType },
    #[error("label {label} at row {row} is outside [0, {classes})")]
    LabelOutOfRange { row: usize, label: i32, classes: usize },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Result of one forward invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOut {
    pub values: Vec<f32>,
    pub shape: Vec<usize>,
    /// Dropout scaling mask kept for the backward pass.
    pub mask: Option<Vec<f32>>,
}

impl ForwardOut {
    fn plain(values: Vec<f32>, shape: Vec<usize>) -> Self {
        Self {
            values,
            shape,
            mask: None,
        }
    }
}

pub(crate) fn f32_operand<'a>(inputs: &[&'a TensorBuffer], index: usize) -> Result<&'a [f32], KernelError> {
    inputs[index].as_f32().ok_or(KernelError::DType {
        index,
        expected: DType::F32,
    })
}

/// Run `op` over `inputs`.
pub fn forward(op: &OpKind, ctx: &KernelCtx<'_>, inputs: &[&TensorBuffer]) -> Result<ForwardOut, KernelError> {
    let shapes: Vec<&[usize]> = inputs.iter().map(|t| t.shape()).collect();
    let out_shape = op.infer_shape(&shapes)?;
    match op {
        OpKind::Linear { bias } => {
            let x = f32_operand(inputs, 0)?;
            let w = f32_operand(inputs, 1)?;
            let (n, k, m) = (shapes[0][0], shapes[0][1], shapes[1][1]);
            let mut y = matmul(x, w, n, k, m, ctx.pool);
            if *bias {
                let b = f32_operand(inputs, 2)?;
                for row in y.chunks_mut(m.max(1)) {
                    row.iter_mut().zip(b).for_each(|(v, bv)| *v += bv);
                }
            }
            Ok(ForwardOut::plain(y, out_shape))
        }
        OpKind::MatMul => {
            let a = f32_operand(inputs, 0)?;
            let b = f32_operand(inputs, 1)?;
            let (n, k, m) = (shapes[0][0], shapes[0][1], shapes[1][1]);
            Ok(ForwardOut::plain(matmul(a, b, n, k, m, ctx.pool), out_shape))
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul => {
            let lhs = f32_operand(inputs, 0)?;
            let rhs = f32_operand(inputs, 1)?;
            let li = broadcast_index_map(shapes[0], &out_shape);
            let ri = broadcast_index_map(shapes[1], &out_shape);
            let f: fn(f32, f32) -> f32 = match op {
                OpKind::Add => |a, b| a + b,
                OpKind::Sub => |a, b| a - b,
                _ => |a, b| a * b,
            };
            let values = li.iter().zip(&ri).map(|(&i, &j)| f(lhs[i], rhs[j])).collect();
            Ok(ForwardOut::plain(values, out_shape))
        }
        OpKind::Relu => unary(inputs, out_shape, |x| x.max(0.0)),
        OpKind::Sigmoid => unary(inputs, out_shape, |x| 1.0 / (1.0 + (-x).exp())),
        OpKind::Tanh => unary(inputs, out_shape, f32::tanh),
        OpKind::Identity => unary(inputs, out_shape, |x| x),
        OpKind::Softmax => {
            let x = f32_operand(inputs, 0)?;
            let last = *out_shape.last().unwrap_or(&1);
            Ok(ForwardOut::plain(softmax_rows(x, last), out_shape))
        }
        OpKind::Dropout { ratio } => {
            let x = f32_operand(inputs, 0)?;
            if ctx.mode == Mode::Eval || *ratio <= 0.0 {
                return Ok(ForwardOut::plain(x.to_vec(), out_shape));
            }
            let keep = 1.0 / (1.0 - ratio);
            let mut rng = StdRng::seed_from_u64(ctx.seed);
            let mask: Vec<f32> = (0..x.len())
                .map(|_| if rng.gen::<f32>() < *ratio { 0.0 } else { keep })
                .collect();
            let values = x.iter().zip(&mask).map(|(v, m)| v * m).collect();
            Ok(ForwardOut {
                values,
                shape: out_shape,
                mask: Some(mask),
            })
        }
        OpKind::MseLoss => {
            let p = f32_operand(inputs, 0)?;
            let t = f32_operand(inputs, 1)?;
            let n = p.len();
            let sum: f32 = p.iter().zip(t).map(|(a, b)| (a - b) * (a - b)).sum();
            let loss = if n == 0 { 0.0 } else { sum / n as f32 };
            Ok(ForwardOut::plain(vec![loss], out_shape))
        }
        OpKind::SoftmaxCrossEntropy => {
            let logits = f32_operand(inputs, 0)?;
            let labels = inputs[1].as_i32().ok_or(KernelError::DType {
                index: 1,
                expected: DType::I32,
            })?;
            let classes = shapes[0][1];
            check_labels(labels, classes)?;
            let probs = softmax_rows(logits, classes);
            let n = labels.len();
            let mut sum = 0.0f32;
            for (row, &label) in labels.iter().enumerate() {
                let p = probs[row * classes + label as usize].max(f32::MIN_POSITIVE);
                sum -= p.ln();
            }
            let loss = if n == 0 { 0.0 } else { sum / n as f32 };
            Ok(ForwardOut::plain(vec![loss], out_shape))
        }
    }
}

fn unary(inputs: &[&TensorBuffer], shape: Vec<usize>, f: impl Fn(f32) -> f32) -> Result<ForwardOut, KernelError> {
    let x = f32_operand(inputs, 0)?;
    Ok(ForwardOut::plain(x.iter().map(|&v| f(v)).collect(), shape))
}

pub(crate) fn check_labels(labels: &[i32], classes: usize) -> Result<(), KernelError> {
    for (row, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= classes {
            return Err(KernelError::LabelOutOfRange { row, label, classes });
        }
    }
    Ok(())
}

/// `a[n,k] · b[k,m]`, accumulated in `k` order so results are identical
/// with or without the pool.
pub(crate) fn matmul(a: &[f32], b: &[f32], n: usize, k: usize, m: usize, pool: Option<&ThreadPool>) -> Vec<f32> {
    let mut out = vec![0.0f32; n * m];
    if n == 0 || m == 0 {
        return out;
    }
    let row = |(i, out_row): (usize, &mut [f32])| {
        for p in 0..k {
            let av = a[i * k + p];
            let b_row = &b[p * m..(p + 1) * m];
            out_row.iter_mut().zip(b_row).for_each(|(o, bv)| *o += av * bv);
        }
    };
    match pool {
        Some(pool) if n > 1 => pool.install(|| out.par_chunks_mut(m).enumerate().for_each(row)),
        _ => out.chunks_mut(m).enumerate().for_each(row),
    }
    out
}

pub(crate) fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = x[r * cols + c];
        }
    }
    out
}

pub(crate) fn softmax_rows(x: &[f32], last: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    if last == 0 {
        return out;
    }
    for (src, dst) in x.chunks(last).zip(out.chunks_mut(last)) {
        let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = (s - max).exp();
            sum += *d;
        }
        dst.iter_mut().for_each(|d| *d /= sum);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{TensorData, TensorRole};

    fn t(name: &str, shape: Vec<usize>, data: Vec<f32>) -> TensorBuffer {
        TensorBuffer::with_data(name, shape, TensorRole::Input, TensorData::F32(data)).unwrap()
    }

    fn ctx(mode: Mode) -> KernelCtx<'static> {
        KernelCtx {
            mode,
            pool: None,
            seed: 7,
        }
    }

    #[test]
    fn linear_matches_hand_computation() {
        let x = t("x", vec![1, 2], vec![1.0, 2.0]);
        let w = t("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = t("b", vec![2], vec![0.5, -0.5]);
        let out = forward(&OpKind::Linear { bias: true }, &ctx(Mode::Eval), &[&x, &w, &b]).unwrap();
        assert_eq!(out.values, vec![7.5, 9.5]);
        assert_eq!(out.shape, vec![1, 2]);
    }

    #[test]
    fn pooled_matmul_is_bit_identical() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let a: Vec<f32> = (0..24).map(|i| i as f32 * 0.37 - 2.0).collect();
        let b: Vec<f32> = (0..12).map(|i| 1.0 / (i as f32 + 1.0)).collect();
        assert_eq!(matmul(&a, &b, 6, 4, 3, None), matmul(&a, &b, 6, 4, 3, Some(&pool)));
    }

    #[test]
    fn broadcast_add() {
        let a = t("a", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = t("b", vec![2], vec![10.0, 20.0]);
        let out = forward(&OpKind::Add, &ctx(Mode::Eval), &[&a, &b]).unwrap();
        assert_eq!(out.values, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = t("x", vec![2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
        let out = forward(&OpKind::Softmax, &ctx(Mode::Eval), &[&x]).unwrap();
        for row in out.values.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn dropout_is_identity_in_eval_and_seeded_in_train() {
        let x = t("x", vec![64], vec![1.0; 64]);
        let op = OpKind::Dropout { ratio: 0.5 };
        let eval = forward(&op, &ctx(Mode::Eval), &[&x]).unwrap();
        assert_eq!(eval.values, vec![1.0; 64]);
        assert!(eval.mask.is_none());

        let a = forward(&op, &ctx(Mode::Train), &[&x]).unwrap();
        let b = forward(&op, &ctx(Mode::Train), &[&x]).unwrap();
        assert_eq!(a, b);
        assert!(a.values.iter().all(|&v| v == 0.0 || v == 2.0));
    }

    #[test]
    fn cross_entropy_rejects_bad_label() {
        let logits = t("logits", vec![2, 3], vec![0.0; 6]);
        let labels =
            TensorBuffer::with_data("y", vec![2], TensorRole::Input, TensorData::I32(vec![0, 3])).unwrap();
        let err = forward(&OpKind::SoftmaxCrossEntropy, &ctx(Mode::Train), &[&logits, &labels]).unwrap_err();
        assert_eq!(err, KernelError::LabelOutOfRange { row: 1, label: 3, classes: 3 });
    }

    #[test]
    fn cross_entropy_uniform_logits() {
        let logits = t("logits", vec![1, 4], vec![0.0; 4]);
        let labels =
            TensorBuffer::with_data("y", vec![1], TensorRole::Input, TensorData::I32(vec![2])).unwrap();
        let out = forward(&OpKind::SoftmaxCrossEntropy, &ctx(Mode::Train), &[&logits, &labels]).unwrap();
        assert!((out.values[0] - 4.0f32.ln()).abs() < 1e-6);
    }
}

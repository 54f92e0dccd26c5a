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

//! Reference CPU operator set: metadata, shape rules, forward kernels and
//! backward rules.
//!
//! Every operator produces exactly one `f32` output. `i32` operands are only
//! accepted where an operator consumes class labels.

pub mod grad;
pub mod kernels;
pub mod shape;

use std::fmt;

use crate::types::DType;

pub use kernels::{KernelCtx, KernelError};
pub use shape::{broadcast_shapes, Shape, ShapeError, ShapeErrorKind};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpKind {
    /// `x[N,K] · w[K,M] (+ b[M])`.
    Linear { bias: bool },
    MatMul,
    Add,
    Sub,
    Mul,
    Relu,
    Sigmoid,
    Tanh,
    /// Softmax over the last axis.
    Softmax,
    /// Inverted dropout; identity outside training.
    Dropout { ratio: f32 },
    Identity,
    /// Mean squared error between two same-shaped operands, reduced to a scalar.
    MseLoss,
    /// Mean softmax cross-entropy of `logits[N,C]` against `i32` labels `[N]`.
    SoftmaxCrossEntropy,
}

impl OpKind {
    pub const fn name(&self) -> &'static str {
        match self {
            OpKind::Linear { .. } => "linear",
            OpKind::MatMul => "matmul",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Softmax => "softmax",
            OpKind::Dropout { .. } => "dropout",
            OpKind::Identity => "identity",
            OpKind::MseLoss => "mse_loss",
            OpKind::SoftmaxCrossEntropy => "softmax_cross_entropy",
        }
    }

    pub const fn arity(&self) -> usize {
        match self {
            OpKind::Linear { bias: true } => 3,
            OpKind::Linear { bias: false }
            | OpKind::MatMul
            | OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::MseLoss
            | OpKind::SoftmaxCrossEntropy => 2,
            OpKind::Relu
            | OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::Softmax
            | OpKind::Dropout { .. }
            | OpKind::Identity => 1,
        }
    }

    /// Dtype required for operand `index`.
    pub const fn input_dtype(&self, index: usize) -> DType {
        match (self, index) {
            (OpKind::SoftmaxCrossEntropy, 1) => DType::I32,
            _ => DType::F32,
        }
    }

    /// Whether gradients flow into operand `index`.
    pub const fn differentiable_input(&self, index: usize) -> bool {
        !matches!(
            (self, index),
            (OpKind::SoftmaxCrossEntropy, 1) | (OpKind::MseLoss, 1)
        )
    }

    pub const fn is_loss(&self) -> bool {
        matches!(self, OpKind::MseLoss | OpKind::SoftmaxCrossEntropy)
    }

    pub(crate) const fn code(&self) -> u8 {
        match self {
            OpKind::Linear { .. } => 1,
            OpKind::MatMul => 2,
            OpKind::Add => 3,
            OpKind::Sub => 4,
            OpKind::Mul => 5,
            OpKind::Relu => 6,
            OpKind::Sigmoid => 7,
            OpKind::Tanh => 8,
            OpKind::Softmax => 9,
            OpKind::Dropout { .. } => 10,
            OpKind::Identity => 11,
            OpKind::MseLoss => 12,
            OpKind::SoftmaxCrossEntropy => 13,
        }
    }

    /// Output shape for the given operand shapes.
    pub fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Shape, ShapeError> {
        let op = self.name();
        if inputs.len() != self.arity() {
            return Err(ShapeError::new(
                op,
                ShapeErrorKind::Arity {
                    expected: self.arity().to_string(),
                    actual: inputs.len(),
                },
            ));
        }
        match self {
            OpKind::Linear { bias } => {
                let (x, w) = (inputs[0], inputs[1]);
                let out = matmul_shape(op, x, w)?;
                if *bias {
                    let b = inputs[2];
                    if b != [out[1]] {
                        return Err(ShapeError::rank(op, "bias of shape [M]", w, Some(b)));
                    }
                }
                Ok(out)
            }
            OpKind::MatMul => matmul_shape(op, inputs[0], inputs[1]),
            OpKind::Add | OpKind::Sub | OpKind::Mul => {
                broadcast_shapes(inputs[0], inputs[1]).map_err(|kind| ShapeError::new(op, kind))
            }
            OpKind::Relu
            | OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::Dropout { .. }
            | OpKind::Identity => Ok(inputs[0].to_vec()),
            OpKind::Softmax => {
                if inputs[0].is_empty() {
                    return Err(ShapeError::rank(op, "rank >= 1", inputs[0], None));
                }
                Ok(inputs[0].to_vec())
            }
            OpKind::MseLoss => {
                if inputs[0] != inputs[1] {
                    return Err(ShapeError::rank(
                        op,
                        "prediction and target of equal shape",
                        inputs[0],
                        Some(inputs[1]),
                    ));
                }
                Ok(Vec::new())
            }
            OpKind::SoftmaxCrossEntropy => {
                let (logits, labels) = (inputs[0], inputs[1]);
                if logits.len() != 2 || labels.len() != 1 || logits[0] != labels[0] {
                    return Err(ShapeError::rank(
                        op,
                        "logits [N,C] and labels [N]",
                        logits,
                        Some(labels),
                    ));
                }
                Ok(Vec::new())
            }
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Linear { bias } => write!(f, "linear(bias={bias})"),
            OpKind::Dropout { ratio } => write!(f, "dropout(ratio={ratio})"),
            other => f.write_str(other.name()),
        }
    }
}

fn matmul_shape(op: &str, a: &[usize], b: &[usize]) -> Result<Shape, ShapeError> {
    if a.len() != 2 || b.len() != 2 {
        return Err(ShapeError::rank(op, "two rank-2 tensors", a, Some(b)));
    }
    if a[1] != b[0] {
        return Err(ShapeError::rank(op, "lhs.shape[1] == rhs.shape[0]", a, Some(b)));
    }
    Ok(vec![a[0], b[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_shape_with_bias() {
        let op = OpKind::Linear { bias: true };
        assert_eq!(op.infer_shape(&[&[1, 4], &[4, 2], &[2]]).unwrap(), vec![1, 2]);
        assert!(op.infer_shape(&[&[1, 4], &[4, 2], &[3]]).is_err());
    }

    #[test]
    fn matmul_inner_dim_mismatch() {
        let err = OpKind::MatMul.infer_shape(&[&[2, 3], &[4, 5]]).unwrap_err();
        assert!(matches!(err.kind, ShapeErrorKind::RankMismatch { .. }));
        assert_eq!(err.op, "matmul");
    }

    #[test]
    fn arity_is_checked() {
        let err = OpKind::Add.infer_shape(&[&[2]]).unwrap_err();
        assert!(matches!(err.kind, ShapeErrorKind::Arity { actual: 1, .. }));
    }

    #[test]
    fn losses_are_scalar() {
        assert_eq!(OpKind::MseLoss.infer_shape(&[&[3, 2], &[3, 2]]).unwrap(), Vec::<usize>::new());
        assert_eq!(
            OpKind::SoftmaxCrossEntropy.infer_shape(&[&[3, 5], &[3]]).unwrap(),
            Vec::<usize>::new()
        );
        assert!(OpKind::SoftmaxCrossEntropy.infer_shape(&[&[3, 5], &[2]]).is_err());
    }

    #[test]
    fn label_operand_is_integer_and_not_differentiable() {
        let op = OpKind::SoftmaxCrossEntropy;
        assert_eq!(op.input_dtype(0), DType::F32);
        assert_eq!(op.input_dtype(1), DType::I32);
        assert!(op.differentiable_input(0));
        assert!(!op.differentiable_input(1));
        assert!(op.is_loss());
    }
}

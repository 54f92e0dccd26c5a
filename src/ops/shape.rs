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

use std::fmt;

/// A concrete rank-N shape.
pub type Shape = Vec<usize>;

/// Error kinds produced by operator shape rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeErrorKind {
    /// Wrong number of operands for the operator.
    Arity { expected: String, actual: usize },
    /// Rank or extent mismatch for the given rule.
    RankMismatch {
        expected: String,
        actual_lhs: Vec<usize>,
        actual_rhs: Option<Vec<usize>>,
    },
    /// Broadcasting failed for the given operand shapes.
    BroadcastError { lhs: Vec<usize>, rhs: Vec<usize> },
}

/// Shape error carrying the operator name and a structured kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError {
    pub op: String,
    pub kind: ShapeErrorKind,
}

impl ShapeError {
    pub(crate) fn new(op: &str, kind: ShapeErrorKind) -> Self {
        Self {
            op: op.to_string(),
            kind,
        }
    }

    pub(crate) fn rank(op: &str, expected: &str, lhs: &[usize], rhs: Option<&[usize]>) -> Self {
        Self::new(
            op,
            ShapeErrorKind::RankMismatch {
                expected: expected.to_string(),
                actual_lhs: lhs.to_vec(),
                actual_rhs: rhs.map(|r| r.to_vec()),
            },
        )
    }
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ShapeErrorKind::Arity { expected, actual } => write!(
                f,
                "op `{}` expects {} operands, got {}",
                self.op, expected, actual
            ),
            ShapeErrorKind::RankMismatch {
                expected,
                actual_lhs,
                actual_rhs,
            } => match actual_rhs {
                Some(rhs) => write!(
                    f,
                    "shape mismatch for op `{}`: expected {}, got lhs={:?}, rhs={:?}",
                    self.op, expected, actual_lhs, rhs
                ),
                None => write!(
                    f,
                    "shape mismatch for op `{}`: expected {}, got {:?}",
                    self.op, expected, actual_lhs
                ),
            },
            ShapeErrorKind::BroadcastError { lhs, rhs } => write!(
                f,
                "cannot broadcast shapes {:?} and {:?} for op `{}`",
                lhs, rhs, self.op
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

/// Numpy-style broadcast of two shapes, aligned from the right.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Shape, ShapeErrorKind> {
    let rank = lhs.len().max(rhs.len());
    let mut result = Vec::with_capacity(rank);
    for i in 0..rank {
        let a = dim_from_right(lhs, i);
        let b = dim_from_right(rhs, i);
        let dim = if a == b || a == 1 {
            b
        } else if b == 1 {
            a
        } else {
            return Err(ShapeErrorKind::BroadcastError {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };
        result.push(dim);
    }
    result.reverse();
    Ok(result)
}

fn dim_from_right(shape: &[usize], i: usize) -> usize {
    if i < shape.len() {
        shape[shape.len() - 1 - i]
    } else {
        1
    }
}

/// Row-major strides of `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1];
    }
    out
}

/// For every flat index of `out_shape`, the flat index into an operand of
/// `shape` broadcast against it.
pub fn broadcast_index_map(shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let total: usize = out_shape.iter().product();
    if shape == out_shape {
        return (0..total).collect();
    }
    let offset = out_shape.len() - shape.len();
    let src_strides = strides(shape);
    let out_strides = strides(out_shape);
    (0..total)
        .map(|flat| {
            let mut src = 0;
            for (axis, &extent) in shape.iter().enumerate() {
                if extent == 1 {
                    continue;
                }
                let out_axis = axis + offset;
                let coord = (flat / out_strides[out_axis]) % out_shape[out_axis];
                src += coord * src_strides[axis];
            }
            src
        })
        .collect()
}

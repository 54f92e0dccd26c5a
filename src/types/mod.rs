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

//! Element types and shape dimensions shared by tensors and graphs.
//!
//! # Example
//! ```
//! use mindtrain::types::{DType, ShapeDim};
//! let dims = vec![ShapeDim::Dynamic, ShapeDim::Known(4)];
//! assert!(!ShapeDim::all_known(&dims));
//! assert_eq!(DType::F32.size_bytes(), 4);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
        }
    }

    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::I32 => 1,
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DType::F32),
            1 => Some(DType::I32),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A declared dimension. `Dynamic` extents are fixed later by a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeDim {
    Known(usize),
    Dynamic,
}

impl ShapeDim {
    pub fn known(self) -> Option<usize> {
        match self {
            ShapeDim::Known(n) => Some(n),
            ShapeDim::Dynamic => None,
        }
    }

    pub fn all_known(dims: &[ShapeDim]) -> bool {
        dims.iter().all(|d| matches!(d, ShapeDim::Known(_)))
    }

    /// Concrete shape if every dimension is known.
    pub fn concrete(dims: &[ShapeDim]) -> Option<Vec<usize>> {
        dims.iter().map(|d| d.known()).collect()
    }

    pub fn from_concrete(shape: &[usize]) -> Vec<ShapeDim> {
        shape.iter().map(|&n| ShapeDim::Known(n)).collect()
    }
}

impl fmt::Display for ShapeDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeDim::Known(n) => write!(f, "{n}"),
            ShapeDim::Dynamic => f.write_str("?"),
        }
    }
}

/// Number of elements in `shape`, or `None` on overflow. Rank-0 is one element.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Byte length of a buffer of `dtype` with `shape`, or `None` on overflow.
pub fn byte_len(dtype: DType, shape: &[usize]) -> Option<usize> {
    element_count(shape)?.checked_mul(dtype.size_bytes())
}

pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(","))
}

pub fn format_dims(dims: &[ShapeDim]) -> String {
    let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_has_one_element() {
        assert_eq!(element_count(&[]), Some(1));
        assert_eq!(byte_len(DType::F32, &[]), Some(4));
    }

    #[test]
    fn zero_extent_is_empty() {
        assert_eq!(element_count(&[3, 0, 2]), Some(0));
    }

    #[test]
    fn overflow_is_detected() {
        assert_eq!(element_count(&[usize::MAX, 2]), None);
        assert_eq!(byte_len(DType::I32, &[usize::MAX / 2, 1]), None);
    }

    #[test]
    fn dtype_bytes_roundtrip() {
        for dt in [DType::F32, DType::I32] {
            assert_eq!(DType::from_byte(dt.to_byte()), Some(dt));
        }
        assert_eq!(DType::from_byte(9), None);
    }

    #[test]
    fn concrete_requires_all_known() {
        assert_eq!(
            ShapeDim::concrete(&[ShapeDim::Known(2), ShapeDim::Known(3)]),
            Some(vec![2, 3])
        );
        assert_eq!(ShapeDim::concrete(&[ShapeDim::Dynamic, ShapeDim::Known(3)]), None);
        assert_eq!(format_dims(&[ShapeDim::Dynamic, ShapeDim::Known(3)]), "[?,3]");
    }
}

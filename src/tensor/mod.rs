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

//! Named, shaped, typed tensor storage owned by a session.
//!
//! A [`TensorBuffer`] always satisfies
//! `byte_len() == product(shape) * dtype.size_bytes()`. Constructors and
//! mutators reject anything that would break that relation.

use std::collections::TryReserveError;
use std::fmt;

use serde::Serialize;

use crate::types::{self, DType};

/// Stable index of a tensor within one graph / session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TensorId(pub usize);

impl TensorId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Structural role of a tensor in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorRole {
    Input,
    Output,
    Weight,
    Intermediate,
}

impl TensorRole {
    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            TensorRole::Input => 0,
            TensorRole::Output => 1,
            TensorRole::Weight => 2,
            TensorRole::Intermediate => 3,
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TensorRole::Input),
            1 => Some(TensorRole::Output),
            2 => Some(TensorRole::Weight),
            3 => Some(TensorRole::Intermediate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("tensor `{name}` expects {expected} elements, got {actual}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("tensor `{name}` has dtype {actual}, not {expected}")]
    DTypeMismatch {
        name: String,
        expected: DType,
        actual: DType,
    },
    #[error("tensor `{name}` with shape {shape} does not fit in memory")]
    SizeOverflow { name: String, shape: String },
    #[error("could not allocate {bytes} bytes for tensor `{name}`")]
    AllocationFailed { name: String, bytes: u64 },
}

/// Element storage. The variant always matches the owning buffer's dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn zeros(dtype: DType, len: usize) -> Result<Self, TryReserveError> {
        Ok(match dtype {
            DType::F32 => TensorData::F32(zeroed(len)?),
            DType::I32 => TensorData::I32(zeroed(len)?),
        })
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian byte image of the elements.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * 4);
        match self {
            TensorData::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::I32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }

    /// Decode little-endian bytes; `None` if the length is not a whole number of elements.
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % dtype.size_bytes() != 0 {
            return None;
        }
        let words = bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]);
        Some(match dtype {
            DType::F32 => TensorData::F32(words.map(f32::from_le_bytes).collect()),
            DType::I32 => TensorData::I32(words.map(i32::from_le_bytes).collect()),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    role: TensorRole,
    data: TensorData,
    finalized: bool,
}

impl TensorBuffer {
    /// Allocate a zero-filled buffer.
    pub fn zeros(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        role: TensorRole,
    ) -> Result<Self, TensorError> {
        let name = name.into();
        let len = checked_len(&name, dtype, &shape)?;
        let data = alloc_zeros(&name, dtype, len)?;
        Ok(Self {
            name,
            dtype,
            shape,
            role,
            data,
            finalized: true,
        })
    }

    /// Placeholder for a tensor whose shape depends on a dynamic input
    /// dimension. It holds no elements until a resize fixes its shape.
    pub fn unfinalized(
        name: impl Into<String>,
        dtype: DType,
        rank: usize,
        role: TensorRole,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: vec![0; rank],
            role,
            data: match dtype {
                DType::F32 => TensorData::F32(Vec::new()),
                DType::I32 => TensorData::I32(Vec::new()),
            },
            finalized: false,
        }
    }

    pub fn with_data(
        name: impl Into<String>,
        shape: Vec<usize>,
        role: TensorRole,
        data: TensorData,
    ) -> Result<Self, TensorError> {
        let name = name.into();
        let dtype = data.dtype();
        let expected = checked_len(&name, dtype, &shape)?;
        if data.len() != expected {
            return Err(TensorError::LengthMismatch {
                name,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            name,
            dtype,
            shape,
            role,
            data,
            finalized: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn role(&self) -> TensorRole {
        self.role
    }

    /// False while the shape still depends on an unresolved dynamic dimension.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len() * self.dtype.size_bytes()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I32(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    pub fn write_f32(&mut self, values: &[f32]) -> Result<(), TensorError> {
        self.check_len(values.len())?;
        match &mut self.data {
            TensorData::F32(v) => {
                v.copy_from_slice(values);
                Ok(())
            }
            TensorData::I32(_) => Err(self.dtype_error(DType::F32)),
        }
    }

    pub fn write_i32(&mut self, values: &[i32]) -> Result<(), TensorError> {
        self.check_len(values.len())?;
        match &mut self.data {
            TensorData::I32(v) => {
                v.copy_from_slice(values);
                Ok(())
            }
            TensorData::F32(_) => Err(self.dtype_error(DType::I32)),
        }
    }

    /// Replace the whole element storage. Dtype and length must match.
    pub fn replace_data(&mut self, data: TensorData) -> Result<(), TensorError> {
        if data.dtype() != self.dtype {
            return Err(self.dtype_error(data.dtype()));
        }
        self.check_len(data.len())?;
        self.data = data;
        Ok(())
    }

    /// Give the buffer a new shape with zeroed contents.
    pub fn reallocate(&mut self, shape: Vec<usize>) -> Result<(), TensorError> {
        let len = checked_len(&self.name, self.dtype, &shape)?;
        self.data = alloc_zeros(&self.name, self.dtype, len)?;
        self.shape = shape;
        self.finalized = true;
        Ok(())
    }

    pub fn info(&self) -> TensorInfo {
        TensorInfo {
            name: self.name.clone(),
            dtype: self.dtype,
            shape: self.shape.clone(),
            role: self.role,
            byte_len: self.byte_len(),
            finalized: self.finalized,
        }
    }

    fn check_len(&self, actual: usize) -> Result<(), TensorError> {
        if actual != self.data.len() {
            return Err(TensorError::LengthMismatch {
                name: self.name.clone(),
                expected: self.data.len(),
                actual,
            });
        }
        Ok(())
    }

    fn dtype_error(&self, requested: DType) -> TensorError {
        TensorError::DTypeMismatch {
            name: self.name.clone(),
            expected: requested,
            actual: self.dtype,
        }
    }
}

/// Owned snapshot of a tensor's metadata, handed out across the handle surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub role: TensorRole,
    pub byte_len: usize,
    pub finalized: bool,
}

fn zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v)
}

/// Zero-filled storage for `len` elements, reporting allocator refusal as an error.
fn alloc_zeros(name: &str, dtype: DType, len: usize) -> Result<TensorData, TensorError> {
    TensorData::zeros(dtype, len).map_err(|_| TensorError::AllocationFailed {
        name: name.to_string(),
        bytes: (len as u64).saturating_mul(dtype.size_bytes() as u64),
    })
}

fn checked_len(name: &str, dtype: DType, shape: &[usize]) -> Result<usize, TensorError> {
    match (types::element_count(shape), types::byte_len(dtype, shape)) {
        (Some(len), Some(bytes)) if bytes <= isize::MAX as usize => Ok(len),
        _ => Err(TensorError::SizeOverflow {
            name: name.to_string(),
            shape: types::format_shape(shape),
        }),
    }
}

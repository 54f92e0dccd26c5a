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

//! Error taxonomy of the session surface.
//!
//! Each operation family has its own enum. Every enum reachable through a
//! [`SessionHandle`] carries an `InvalidHandle` variant, so use after `free`
//! is a reported error rather than undefined behaviour.

use std::io;
use std::path::PathBuf;

use crate::manager::SessionHandle;
use crate::ops::ShapeError;
use crate::tensor::TensorError;

/// Handle does not name a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session handle {0}")]
pub struct InvalidHandle(pub SessionHandle);

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("bad model file `{path}`: {reason}")]
    BadModelFile { path: String, reason: String },
    #[error("cannot allocate tensor `{tensor}` ({bytes} bytes)")]
    AllocationFailure { tensor: String, bytes: u64 },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot start worker pool: {0}")]
    ThreadPool(String),
    #[error("cannot read `{}`: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("session limit reached")]
    SessionLimit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResizeError {
    #[error("incompatible shape at node `{node}`: {source}")]
    IncompatibleShape { node: String, source: ShapeError },
    #[error("`{0}` is not a graph input of this session")]
    NotAnInput(String),
    #[error("{tensors} tensors given with {dims} shapes")]
    ArityMismatch { tensors: usize, dims: usize },
    #[error("input `{tensor}` has rank {expected}, got {actual}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },
    #[error("cannot allocate tensor `{tensor}` ({bytes} bytes)")]
    AllocationFailure { tensor: String, bytes: u64 },
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("node `{node}` (#{index}) failed: {reason}")]
    NodeFailure {
        node: String,
        index: usize,
        reason: String,
    },
    #[error("tensor `{tensor}` has no finalized shape; resize it first")]
    ShapeMismatch { tensor: String },
    #[error("run interrupted by callback at node `{node}`")]
    Interrupted { node: String },
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModeError {
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("learning rate must be finite and positive, got {0}")]
    InvalidRate(f32),
    #[error("momentum must be in [0, 1), got {0}")]
    InvalidMomentum(f32),
    #[error("thread count must be positive, got {0}")]
    InvalidThreadCount(usize),
    #[error("invalid configuration: {0}")]
    Parse(String),
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("cannot write `{}`: {source}", .path.display())]
    WriteFailure { path: PathBuf, source: io::Error },
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

/// Reading or writing tensor contents through a reference.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorAccessError {
    #[error("no tensor {0} in this session")]
    UnknownTensor(String),
    #[error("tensor `{0}` is computed by the graph and cannot be written")]
    ReadOnly(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandle),
}

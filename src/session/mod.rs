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

//! A loaded, executable model: one graph, its tensor buffers and the engine
//! that runs them.
//!
//! [`TrainSession`] is the owned form. [`crate::manager::SessionManager`]
//! wraps sessions behind generation-checked handles.

pub mod config;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};

use crate::engine::{self, ExecutionEngine, KernelCallback, Mode, ResizePlan, RunSummary};
use crate::error::{ConfigError, ExecError, InitError, IoError, ResizeError, TensorAccessError};
use crate::graph::format::{self, FormatError};
use crate::graph::{GraphStore, TrainParams};
use crate::tensor::{TensorBuffer, TensorData, TensorId, TensorInfo, TensorRole};

pub use config::{DeviceHint, SessionConfig};

#[derive(Debug)]
pub struct TrainSession {
    graph: GraphStore,
    tensors: Vec<TensorBuffer>,
    engine: ExecutionEngine,
    config: SessionConfig,
    last_run: Option<RunSummary>,
}

impl TrainSession {
    /// Load a model file and allocate its buffers.
    pub fn open(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self, InitError> {
        let path = path.as_ref();
        config.validate()?;
        let graph = format::load(path).map_err(|e| load_error(path, e))?;
        Self::from_graph(graph, config)
    }

    /// Same as [`open`](Self::open) for a model already in memory.
    pub fn from_bytes(bytes: &[u8], config: SessionConfig) -> Result<Self, InitError> {
        config.validate()?;
        let graph = format::decode(bytes).map_err(|e| InitError::BadModelFile {
            path: "<memory>".to_string(),
            reason: e.to_string(),
        })?;
        Self::from_graph(graph, config)
    }

    pub fn from_graph(graph: GraphStore, config: SessionConfig) -> Result<Self, InitError> {
        config.validate()?;
        if config.device != DeviceHint::Cpu {
            warn!(device = ?config.device, "device hint not supported, running on cpu");
        }
        let mut params = graph.train_params();
        if let Some(rate) = config.learning_rate {
            params.learning_rate = rate;
        }
        let tensors = engine::allocate(&graph, config.memory_limit_bytes)?;
        let pool = if config.thread_count > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.thread_count)
                .thread_name(|i| format!("mindtrain-worker-{i}"))
                .build()
                .map_err(|e| InitError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        let mut engine = ExecutionEngine::new(&graph, params, config.seed, pool);
        engine.ready(config.default_mode);
        info!(
            model = ?graph.origin().and_then(|o| o.path.as_ref()),
            digest = graph.digest(),
            tensors = tensors.len(),
            nodes = graph.nodes().len(),
            mode = %config.default_mode,
            "session initialized"
        );
        Ok(Self {
            graph,
            tensors,
            engine,
            config,
            last_run: None,
        })
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tensor(&self, id: TensorId) -> Option<&TensorBuffer> {
        self.tensors.get(id.index())
    }

    pub fn tensors(&self) -> &[TensorBuffer] {
        &self.tensors
    }

    pub fn tensor_info(&self, id: TensorId) -> Option<TensorInfo> {
        self.tensor(id).map(TensorBuffer::info)
    }

    /// Pin kernels to the session's worker pool or run them inline.
    pub fn bind_thread(&mut self, bind: bool) {
        self.engine.bind_pool(bind);
        debug!(bind, bound = self.engine.pool_bound(), "bind_thread");
    }

    // --- lookups ---------------------------------------------------------

    pub fn get_inputs(&self) -> Vec<TensorId> {
        self.graph.inputs().to_vec()
    }

    pub fn get_input_by_tensor_name(&self, name: &str) -> Option<TensorId> {
        self.graph.tensor_id(name).filter(|id| self.graph.inputs().contains(id))
    }

    /// Outputs of `node`, if it exists and runs in the current mode.
    pub fn get_outputs_by_node_name(&self, node: &str) -> Option<Vec<TensorId>> {
        let node = self.graph.node(node)?;
        node.phase.active_in(self.mode()).then(|| node.outputs.clone())
    }

    /// Graph outputs produced in the current mode, keyed by tensor name.
    pub fn get_output_map_by_tensor(&self) -> BTreeMap<String, TensorId> {
        self.active_outputs()
            .map(|id| (self.tensors[id.index()].name().to_string(), id))
            .collect()
    }

    pub fn get_output_tensor_names(&self) -> Vec<String> {
        self.active_outputs()
            .map(|id| self.tensors[id.index()].name().to_string())
            .collect()
    }

    pub fn get_output_by_tensor_name(&self, name: &str) -> Option<TensorId> {
        let id = self.graph.tensor_id(name)?;
        self.active_outputs().find(|&o| o == id)
    }

    fn active_outputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        let mode = self.mode();
        self.graph.outputs().iter().copied().filter(move |&id| {
            self.graph
                .producer(id)
                .is_some_and(|n| self.graph.nodes()[n].phase.active_in(mode))
        })
    }

    // --- tensor data -----------------------------------------------------

    pub fn read_f32(&self, id: TensorId) -> Result<Vec<f32>, TensorAccessError> {
        let t = self.tensor(id).ok_or_else(|| TensorAccessError::UnknownTensor(id.to_string()))?;
        t.as_f32().map(<[f32]>::to_vec).ok_or_else(|| {
            TensorAccessError::Tensor(crate::tensor::TensorError::DTypeMismatch {
                name: t.name().to_string(),
                expected: crate::types::DType::F32,
                actual: t.dtype(),
            })
        })
    }

    pub fn read_i32(&self, id: TensorId) -> Result<Vec<i32>, TensorAccessError> {
        let t = self.tensor(id).ok_or_else(|| TensorAccessError::UnknownTensor(id.to_string()))?;
        t.as_i32().map(<[i32]>::to_vec).ok_or_else(|| {
            TensorAccessError::Tensor(crate::tensor::TensorError::DTypeMismatch {
                name: t.name().to_string(),
                expected: crate::types::DType::I32,
                actual: t.dtype(),
            })
        })
    }

    pub fn write_f32(&mut self, id: TensorId, values: &[f32]) -> Result<(), TensorAccessError> {
        self.writable(id)?.write_f32(values)?;
        Ok(())
    }

    pub fn write_i32(&mut self, id: TensorId, values: &[i32]) -> Result<(), TensorAccessError> {
        self.writable(id)?.write_i32(values)?;
        Ok(())
    }

    /// Graph inputs and weights accept writes; everything else is computed.
    fn writable(&mut self, id: TensorId) -> Result<&mut TensorBuffer, TensorAccessError> {
        let t = self
            .tensors
            .get_mut(id.index())
            .ok_or_else(|| TensorAccessError::UnknownTensor(id.to_string()))?;
        match t.role() {
            TensorRole::Input | TensorRole::Weight => Ok(t),
            _ => Err(TensorAccessError::ReadOnly(t.name().to_string())),
        }
    }

    // --- execution -------------------------------------------------------

    /// Re-derive shapes from new input dims. Either every affected buffer is
    /// reallocated or none is.
    pub fn resize(&mut self, inputs: &[TensorId], dims: &[Vec<usize>]) -> Result<(), ResizeError> {
        let plan = ResizePlan::build(
            &self.graph,
            &self.tensors,
            inputs,
            dims,
            self.config.memory_limit_bytes,
        )?;
        let changed = plan.changed();
        plan.commit(&mut self.tensors);
        info!(inputs = inputs.len(), reallocated = changed, "session resized");
        Ok(())
    }

    pub fn run_graph(&mut self) -> Result<(), ExecError> {
        self.run_graph_with_callbacks(None, None)
    }

    /// Run with optional callbacks around every executed node.
    pub fn run_graph_with_callbacks(
        &mut self,
        before: Option<&mut KernelCallback<'_>>,
        after: Option<&mut KernelCallback<'_>>,
    ) -> Result<(), ExecError> {
        self.last_run = None;
        let summary = self.engine.run(&self.graph, &mut self.tensors, before, after)?;
        self.last_run = Some(summary);
        Ok(())
    }

    /// Summary of the last successful run.
    pub fn last_run(&self) -> Option<&RunSummary> {
        self.last_run.as_ref()
    }

    pub fn last_loss(&self) -> Option<f32> {
        self.last_run.as_ref().and_then(|r| r.loss)
    }

    // --- mode ------------------------------------------------------------

    pub fn train(&mut self) {
        self.set_mode(Mode::Train);
    }

    pub fn eval(&mut self) {
        self.set_mode(Mode::Eval);
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.engine.mode() != mode {
            info!(%mode, "mode switched");
        }
        self.engine.set_mode(mode);
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    pub fn is_train(&self) -> bool {
        self.mode() == Mode::Train
    }

    pub fn is_eval(&self) -> bool {
        self.mode() == Mode::Eval
    }

    // --- optimizer -------------------------------------------------------

    pub fn set_learning_rate(&mut self, rate: f32) -> Result<(), ConfigError> {
        self.engine.optimizer_mut().set_learning_rate(rate)?;
        info!(rate, "learning rate set");
        Ok(())
    }

    pub fn learning_rate(&self) -> f32 {
        self.engine.optimizer().learning_rate()
    }

    pub fn set_momentum(&mut self, momentum: f32) -> Result<(), ConfigError> {
        self.engine.optimizer_mut().set_momentum(momentum)
    }

    pub fn train_params(&self) -> TrainParams {
        self.engine.optimizer().params()
    }

    // --- persistence -----------------------------------------------------

    /// Encoded model with the current weight values and train params.
    pub fn export_to_buf(&self) -> Vec<u8> {
        let mut parts = self.graph.parts();
        for (decl, buffer) in parts.tensors.iter_mut().zip(&self.tensors) {
            if decl.role == TensorRole::Weight {
                decl.init = Some(buffer.data().clone());
            }
        }
        parts.params = self.train_params();
        format::encode_parts(&parts)
    }

    /// Write the model to `path` through a sibling temporary file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), IoError> {
        let path = path.as_ref();
        let bytes = self.export_to_buf();
        let tmp = temp_sibling(path);
        let write_failure = |source: io::Error| IoError::WriteFailure {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, &bytes).map_err(write_failure)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(write_failure(e));
        }
        info!(path = %path.display(), bytes = bytes.len(), "model saved");
        Ok(())
    }

    /// Weight values by tensor name.
    pub fn weights(&self) -> BTreeMap<String, TensorData> {
        self.graph
            .weights()
            .map(|id| {
                let t = &self.tensors[id.index()];
                (t.name().to_string(), t.data().clone())
            })
            .collect()
    }
}

impl Drop for TrainSession {
    fn drop(&mut self) {
        debug!(tensors = self.tensors.len(), "session released");
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_error(path: &Path, err: FormatError) -> InitError {
    match err {
        FormatError::Io(source) => InitError::Io {
            path: path.to_path_buf(),
            source,
        },
        other => InitError::BadModelFile {
            path: path.display().to_string(),
            reason: other.to_string(),
        },
    }
}

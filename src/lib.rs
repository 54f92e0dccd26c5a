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

//! On-device training sessions.
//!
//! A model file decodes into a [`GraphStore`]. A [`TrainSession`] owns one
//! graph, its [`TensorBuffer`]s and an [`ExecutionEngine`] that walks the
//! graph in train or eval mode. [`SessionManager`] hands sessions out behind
//! generation-checked [`SessionHandle`]s.
//!
//! ```no_run
//! use mindtrain::{SessionConfig, SessionManager};
//!
//! let manager = SessionManager::start();
//! let session = manager.init("model.mtgb", SessionConfig::default())?;
//! manager.train(session)?;
//! manager.run_graph(session)?;
//! manager.save_to_file(session, "trained.mtgb")?;
//! manager.free(session);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod manager;
pub mod ops;
pub mod session;
pub mod tensor;
pub mod train_loop;
pub mod types;

pub use engine::{CallbackParam, ExecutionEngine, KernelCallback, Mode, RunSummary};
pub use error::{
    ConfigError, ExecError, InitError, InvalidHandle, IoError, ModeError, ResizeError, TensorAccessError,
};
pub use graph::{GraphBuilder, GraphError, GraphStore, Node, Phase, TensorDecl, TrainParams};
pub use manager::{SessionHandle, SessionManager, TensorRef};
pub use ops::OpKind;
pub use session::{DeviceHint, SessionConfig, TrainSession};
pub use tensor::{TensorBuffer, TensorData, TensorId, TensorInfo, TensorRole};
pub use train_loop::{
    BatchInput, CheckpointSaver, DataFeed, LoopControl, LoopContext, LoopError, LoopOutcome, LossMonitor,
    LrScheduler, TrainLoop, TrainLoopCallback, VecFeed,
};
pub use types::{DType, ShapeDim};

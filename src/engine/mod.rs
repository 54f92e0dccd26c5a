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

//! Execution engine: mode state, node schedule, forward walk, backward pass
//! and optimizer step over a session's tensor buffers.
//!
//! The engine never owns tensors or the graph. A session lends both to every
//! call, which keeps the engine's own state down to what changes across
//! calls: the mode, the optimizer and the run counter feeding dropout seeds.

mod exec;
mod optim;
mod shapes;

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fmt;

use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::graph::{GraphStore, TrainParams};

pub use exec::{CallbackParam, KernelCallback, RunSummary};
pub use optim::Sgd;
pub(crate) use shapes::{allocate, ResizePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
        })
    }
}

/// `Uninitialized` until a session finishes allocating its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready(Mode),
}

pub struct ExecutionEngine {
    state: EngineState,
    schedule: Vec<usize>,
    optimizer: Sgd,
    seed: u64,
    runs: u64,
    pool: Option<ThreadPool>,
    use_pool: bool,
    warned_no_loss: bool,
}

impl ExecutionEngine {
    pub fn new(graph: &GraphStore, params: TrainParams, seed: u64, pool: Option<ThreadPool>) -> Self {
        Self {
            state: EngineState::Uninitialized,
            schedule: schedule(graph),
            optimizer: Sgd::new(params),
            seed,
            runs: 0,
            use_pool: pool.is_some(),
            pool,
            warned_no_loss: false,
        }
    }

    /// Enter `Ready(mode)` once buffers exist.
    pub fn ready(&mut self, mode: Mode) {
        self.state = EngineState::Ready(mode);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        match self.state {
            EngineState::Ready(mode) => mode,
            EngineState::Uninitialized => Mode::Eval,
        }
    }

    /// Switch mode. Does nothing before `ready`.
    pub fn set_mode(&mut self, mode: Mode) {
        if let EngineState::Ready(_) = self.state {
            self.state = EngineState::Ready(mode);
        }
    }

    pub fn schedule(&self) -> &[usize] {
        &self.schedule
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Sgd {
        &mut self.optimizer
    }

    /// Route kernels through the session pool (`true`) or the calling thread.
    pub fn bind_pool(&mut self, bind: bool) {
        self.use_pool = bind && self.pool.is_some();
    }

    pub fn pool_bound(&self) -> bool {
        self.use_pool
    }

    pub(crate) fn active_pool(&self) -> Option<&ThreadPool> {
        if self.use_pool {
            self.pool.as_ref()
        } else {
            None
        }
    }

    /// Seed for the `node`-th node of the current run.
    pub(crate) fn node_seed(&self, node: usize) -> u64 {
        splitmix64(self.seed ^ splitmix64(self.runs.wrapping_mul(0x9e37_79b9) ^ node as u64))
    }
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("state", &self.state)
            .field("nodes", &self.schedule.len())
            .field("optimizer", &self.optimizer)
            .field("runs", &self.runs)
            .field("use_pool", &self.use_pool)
            .finish()
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Topological order of the graph's nodes, ties broken by declaration order.
///
/// Verified graphs are stored def-before-use, so this is the identity
/// permutation for them; it is recomputed rather than assumed.
pub fn schedule(graph: &GraphStore) -> Vec<usize> {
    let nodes = graph.nodes();
    let mut indegree = vec![0usize; nodes.len()];
    let mut users: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &input in &node.inputs {
            if let Some(p) = graph.producer(input) {
                indegree[i] += 1;
                users[p].push(i);
            }
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> =
        (0..nodes.len()).filter(|&i| indegree[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &u in &users[i] {
            indegree[u] -= 1;
            if indegree[u] == 0 {
                ready.push(Reverse(u));
            }
        }
    }
    order
}

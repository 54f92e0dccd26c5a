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

//! Handle-based surface over [`TrainSession`]s.
//!
//! Sessions live in an arena of generation-checked slots. A handle names a
//! slot index plus the generation it was issued for; freeing a session bumps
//! the generation, so every later use of the old handle (including a second
//! `free`) is detected instead of touching reused memory.
//!
//! Locking: the arena sits behind one `RwLock`, each session behind its own.
//! Lookups take the session read lock and may run concurrently; `run_graph`,
//! `resize` and mode switches take the write lock.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::KernelCallback;
use crate::error::{
    ConfigError, ExecError, InitError, InvalidHandle, IoError, ModeError, ResizeError, TensorAccessError,
};
use crate::graph::GraphStore;
use crate::session::{SessionConfig, TrainSession};
use crate::tensor::{TensorId, TensorInfo};

/// Opaque session reference. A deserialized handle is checked like any
/// other, so a stale or forged one reads as [`InvalidHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    /// Nonzero integer form for hosts that can only carry a number. `0` is
    /// never produced and stands for "no session".
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | (u64::from(self.index) + 1)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        let low = (raw & 0xffff_ffff) as u32;
        let index = low.checked_sub(1)?;
        Some(Self {
            index,
            generation: (raw >> 32) as u32,
        })
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Non-owning reference to a tensor of a specific session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TensorRef {
    session: SessionHandle,
    id: TensorId,
}

impl TensorRef {
    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn id(&self) -> TensorId {
        self.id
    }
}

type Shared = Arc<RwLock<TrainSession>>;

struct Slot {
    generation: u32,
    session: Option<Shared>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    fn get(&self, handle: SessionHandle) -> Option<&Shared> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.session.as_ref()
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }
}

pub struct SessionManager {
    arena: RwLock<Arena>,
    max_sessions: usize,
}

impl SessionManager {
    /// Slots are indexed by `u32`, and `u32::MAX` would collide with the raw
    /// null sentinel.
    pub const MAX_SESSIONS: usize = (u32::MAX - 1) as usize;

    /// Process-wide engine start. Nothing happens at load time; everything a
    /// manager owns is created here and released by [`shutdown`](Self::shutdown).
    pub fn start() -> Self {
        Self::with_limit(Self::MAX_SESSIONS)
    }

    pub fn with_limit(max_sessions: usize) -> Self {
        info!(max_sessions, "session manager started");
        Self {
            arena: RwLock::new(Arena::default()),
            max_sessions: max_sessions.min(Self::MAX_SESSIONS),
        }
    }

    /// Free every live session and stop. Returns how many were released.
    pub fn shutdown(self) -> usize {
        let mut arena = self.arena.write();
        let mut released = 0;
        for slot in &mut arena.slots {
            if slot.session.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                released += 1;
            }
        }
        info!(released, "session manager shut down");
        released
    }

    pub fn live_sessions(&self) -> usize {
        self.arena.read().live()
    }

    // --- lifecycle -------------------------------------------------------

    pub fn init(&self, model: impl AsRef<Path>, config: SessionConfig) -> Result<SessionHandle, InitError> {
        let session = TrainSession::open(model, config)?;
        self.insert(session)
    }

    pub fn init_from_buf(&self, bytes: &[u8], config: SessionConfig) -> Result<SessionHandle, InitError> {
        let session = TrainSession::from_bytes(bytes, config)?;
        self.insert(session)
    }

    pub fn init_from_graph(&self, graph: GraphStore, config: SessionConfig) -> Result<SessionHandle, InitError> {
        let session = TrainSession::from_graph(graph, config)?;
        self.insert(session)
    }

    fn insert(&self, session: TrainSession) -> Result<SessionHandle, InitError> {
        let mut arena = self.arena.write();
        let shared = Arc::new(RwLock::new(session));
        let handle = if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.session = Some(shared);
            SessionHandle {
                index,
                generation: slot.generation,
            }
        } else {
            if arena.slots.len() >= self.max_sessions {
                return Err(InitError::SessionLimit);
            }
            let index = arena.slots.len() as u32;
            arena.slots.push(Slot {
                generation: 0,
                session: Some(shared),
            });
            SessionHandle { index, generation: 0 }
        };
        debug!(%handle, "session registered");
        Ok(handle)
    }

    /// Release a session. Freeing a stale or already-freed handle does nothing.
    pub fn free(&self, handle: SessionHandle) {
        let released = {
            let mut arena = self.arena.write();
            let released = match arena.slots.get_mut(handle.index as usize) {
                Some(slot) if slot.generation == handle.generation && slot.session.is_some() => {
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.session.take()
                }
                _ => None,
            };
            if released.is_some() {
                arena.free.push(handle.index);
            }
            released
        };
        match released {
            // Dropped outside the arena lock.
            Some(session) => {
                drop(session);
                info!(%handle, "session freed");
            }
            None => debug!(%handle, "free on inactive handle ignored"),
        }
    }

    fn shared(&self, handle: SessionHandle) -> Result<Shared, InvalidHandle> {
        self.arena.read().get(handle).cloned().ok_or(InvalidHandle(handle))
    }

    /// Run `f` with shared access to the session.
    pub fn with_session<R>(&self, handle: SessionHandle, f: impl FnOnce(&TrainSession) -> R) -> Result<R, InvalidHandle> {
        let shared = self.shared(handle)?;
        let session = shared.read();
        Ok(f(&session))
    }

    /// Run `f` with exclusive access to the session.
    pub fn with_session_mut<R>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut TrainSession) -> R,
    ) -> Result<R, InvalidHandle> {
        let shared = self.shared(handle)?;
        let mut session = shared.write();
        Ok(f(&mut session))
    }

    pub fn bind_thread(&self, handle: SessionHandle, bind: bool) -> Result<(), ModeError> {
        Ok(self.with_session_mut(handle, |s| s.bind_thread(bind))?)
    }

    // --- lookups ---------------------------------------------------------

    fn tensor_ref(handle: SessionHandle, id: TensorId) -> TensorRef {
        TensorRef { session: handle, id }
    }

    pub fn get_inputs(&self, handle: SessionHandle) -> Result<Vec<TensorRef>, InvalidHandle> {
        self.with_session(handle, |s| {
            s.get_inputs().into_iter().map(|id| Self::tensor_ref(handle, id)).collect()
        })
    }

    pub fn get_input_by_tensor_name(&self, handle: SessionHandle, name: &str) -> Result<Option<TensorRef>, InvalidHandle> {
        self.with_session(handle, |s| s.get_input_by_tensor_name(name).map(|id| Self::tensor_ref(handle, id)))
    }

    pub fn get_outputs_by_node_name(
        &self,
        handle: SessionHandle,
        node: &str,
    ) -> Result<Option<Vec<TensorRef>>, InvalidHandle> {
        self.with_session(handle, |s| {
            s.get_outputs_by_node_name(node)
                .map(|ids| ids.into_iter().map(|id| Self::tensor_ref(handle, id)).collect())
        })
    }

    pub fn get_output_map_by_tensor(&self, handle: SessionHandle) -> Result<BTreeMap<String, TensorRef>, InvalidHandle> {
        self.with_session(handle, |s| {
            s.get_output_map_by_tensor()
                .into_iter()
                .map(|(name, id)| (name, Self::tensor_ref(handle, id)))
                .collect()
        })
    }

    pub fn get_output_tensor_names(&self, handle: SessionHandle) -> Result<Vec<String>, InvalidHandle> {
        self.with_session(handle, TrainSession::get_output_tensor_names)
    }

    pub fn get_output_by_tensor_name(&self, handle: SessionHandle, name: &str) -> Result<Option<TensorRef>, InvalidHandle> {
        self.with_session(handle, |s| s.get_output_by_tensor_name(name).map(|id| Self::tensor_ref(handle, id)))
    }

    // --- tensor data -----------------------------------------------------

    pub fn tensor_info(&self, tensor: &TensorRef) -> Result<TensorInfo, TensorAccessError> {
        self.with_session(tensor.session, |s| {
            s.tensor_info(tensor.id)
                .ok_or_else(|| TensorAccessError::UnknownTensor(tensor.id.to_string()))
        })?
    }

    pub fn read_f32(&self, tensor: &TensorRef) -> Result<Vec<f32>, TensorAccessError> {
        self.with_session(tensor.session, |s| s.read_f32(tensor.id))?
    }

    pub fn read_i32(&self, tensor: &TensorRef) -> Result<Vec<i32>, TensorAccessError> {
        self.with_session(tensor.session, |s| s.read_i32(tensor.id))?
    }

    pub fn write_f32(&self, tensor: &TensorRef, values: &[f32]) -> Result<(), TensorAccessError> {
        self.with_session_mut(tensor.session, |s| s.write_f32(tensor.id, values))?
    }

    pub fn write_i32(&self, tensor: &TensorRef, values: &[i32]) -> Result<(), TensorAccessError> {
        self.with_session_mut(tensor.session, |s| s.write_i32(tensor.id, values))?
    }

    // --- execution -------------------------------------------------------

    pub fn resize(&self, handle: SessionHandle, inputs: &[TensorRef], dims: &[Vec<usize>]) -> Result<(), ResizeError> {
        if let Some(foreign) = inputs.iter().find(|r| r.session != handle) {
            return Err(ResizeError::NotAnInput(format!("{} of session {}", foreign.id, foreign.session)));
        }
        let ids: Vec<TensorId> = inputs.iter().map(|r| r.id).collect();
        self.with_session_mut(handle, |s| s.resize(&ids, dims))?
    }

    pub fn run_graph(&self, handle: SessionHandle) -> Result<(), ExecError> {
        self.with_session_mut(handle, TrainSession::run_graph)?
    }

    pub fn run_graph_with_callbacks(
        &self,
        handle: SessionHandle,
        before: Option<&mut KernelCallback<'_>>,
        after: Option<&mut KernelCallback<'_>>,
    ) -> Result<(), ExecError> {
        self.with_session_mut(handle, |s| s.run_graph_with_callbacks(before, after))?
    }

    pub fn train(&self, handle: SessionHandle) -> Result<(), ModeError> {
        Ok(self.with_session_mut(handle, TrainSession::train)?)
    }

    pub fn eval(&self, handle: SessionHandle) -> Result<(), ModeError> {
        Ok(self.with_session_mut(handle, TrainSession::eval)?)
    }

    pub fn is_train(&self, handle: SessionHandle) -> Result<bool, ModeError> {
        Ok(self.with_session(handle, TrainSession::is_train)?)
    }

    pub fn is_eval(&self, handle: SessionHandle) -> Result<bool, ModeError> {
        Ok(self.with_session(handle, TrainSession::is_eval)?)
    }

    pub fn set_learning_rate(&self, handle: SessionHandle, rate: f32) -> Result<(), ConfigError> {
        self.with_session_mut(handle, |s| s.set_learning_rate(rate))?
    }

    pub fn learning_rate(&self, handle: SessionHandle) -> Result<f32, ConfigError> {
        Ok(self.with_session(handle, TrainSession::learning_rate)?)
    }

    pub fn save_to_file(&self, handle: SessionHandle, path: impl AsRef<Path>) -> Result<(), IoError> {
        self.with_session(handle, |s| s.save_to_file(path))?
    }

    pub fn export_to_buf(&self, handle: SessionHandle) -> Result<Vec<u8>, InvalidHandle> {
        self.with_session(handle, TrainSession::export_to_buf)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("live_sessions", &self.live_sessions())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

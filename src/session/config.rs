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

//! Session options, loadable from TOML.
//!
//! ```toml
//! thread_count = 2
//! default_mode = "train"
//! device = "cpu"
//! learning_rate = 0.05
//! seed = 7
//! memory_limit_bytes = 1048576
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::Mode;
use crate::error::ConfigError;

/// Advisory placement hint. Only the CPU is implemented; other hints are
/// accepted and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHint {
    #[default]
    Cpu,
    Gpu,
    Npu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Worker threads for intra-op parallelism.
    pub thread_count: usize,
    /// Mode entered right after `init`.
    pub default_mode: Mode,
    pub device: DeviceHint,
    /// Overrides the learning rate stored in the model file.
    pub learning_rate: Option<f32>,
    /// Seeds dropout masks.
    pub seed: u64,
    /// Upper bound on the bytes held by all tensor buffers of a session.
    pub memory_limit_bytes: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            default_mode: Mode::Eval,
            device: DeviceHint::Cpu,
            learning_rate: None,
            seed: 0,
            memory_limit_bytes: None,
        }
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get().min(4))
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::InvalidThreadCount(0));
        }
        if let Some(rate) = self.learning_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::InvalidRate(rate));
            }
        }
        Ok(())
    }

    pub fn with_threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

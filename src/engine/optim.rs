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

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::graph::TrainParams;
use crate::tensor::TensorId;

/// SGD with momentum and L2 weight decay:
/// `g' = g + wd*w; v = m*v + g'; w -= lr*v`.
///
/// Velocity buffers are engine state; they are not persisted with the model.
#[derive(Debug, Clone)]
pub struct Sgd {
    params: TrainParams,
    velocity: HashMap<TensorId, Vec<f32>>,
}

impl Sgd {
    pub fn new(params: TrainParams) -> Self {
        Self {
            params,
            velocity: HashMap::new(),
        }
    }

    pub fn params(&self) -> TrainParams {
        self.params
    }

    pub fn learning_rate(&self) -> f32 {
        self.params.learning_rate
    }

    /// Validated before any state changes.
    pub fn set_learning_rate(&mut self, rate: f32) -> Result<(), ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        self.params.learning_rate = rate;
        Ok(())
    }

    pub fn set_momentum(&mut self, momentum: f32) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(ConfigError::InvalidMomentum(momentum));
        }
        self.params.momentum = momentum;
        Ok(())
    }

    pub fn step(&mut self, id: TensorId, weights: &mut [f32], grad: &[f32]) {
        let TrainParams {
            learning_rate: lr,
            momentum,
            weight_decay,
        } = self.params;
        if momentum == 0.0 {
            for (w, g) in weights.iter_mut().zip(grad) {
                *w -= lr * (g + weight_decay * *w);
            }
            return;
        }
        let v = self.velocity.entry(id).or_insert_with(|| vec![0.0; weights.len()]);
        if v.len() != weights.len() {
            *v = vec![0.0; weights.len()];
        }
        for ((w, g), v) in weights.iter_mut().zip(grad).zip(v.iter_mut()) {
            *v = momentum * *v + g + weight_decay * *w;
            *w -= lr * *v;
        }
    }
}

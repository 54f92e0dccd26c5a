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

//! `mindtrain` command line: inspect, run and fine-tune model files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use mindtrain::{
    BatchInput, CheckpointSaver, DType, LossMonitor, LrScheduler, Mode, SessionConfig, SessionHandle,
    SessionManager, TensorData, TrainLoop, TrainLoopCallback, TrainSession, VecFeed,
};

#[derive(Parser, Debug)]
#[command(name = "mindtrain", version, about = "Run and train MTGB model files")]
struct Cli {
    /// Session options (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the graph, its digest and tensor metadata.
    Info {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        /// Emit tensor metadata as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the graph once on inputs from a JSON file and print the outputs.
    Run {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        /// JSON object mapping input names to `{ "shape": [...], "data": [...] }`.
        #[arg(short, long, value_name = "FILE")]
        inputs: PathBuf,
        #[arg(long, value_enum, default_value_t = CliMode::Eval)]
        mode: CliMode,
        /// Save the model after the run.
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },
    /// Train for several epochs over batches from a JSON file.
    Fit {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        /// JSON array of batches, each shaped like the `run` inputs.
        #[arg(short, long, value_name = "FILE")]
        data: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        epochs: usize,
        /// Where to write the trained model.
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
        #[arg(long)]
        learning_rate: Option<f32>,
        /// Multiply the learning rate by GAMMA every STEP epochs.
        #[arg(long, num_args = 2, value_names = ["STEP", "GAMMA"])]
        decay: Option<Vec<String>>,
        /// Directory for per-epoch checkpoints.
        #[arg(long, value_name = "DIR")]
        checkpoints: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliMode {
    Train,
    Eval,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Train => Mode::Train,
            CliMode::Eval => Mode::Eval,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InputValue {
    shape: Vec<usize>,
    data: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct OutputValue {
    shape: Vec<usize>,
    dtype: DType,
    data: serde_json::Value,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            SessionConfig::from_file(path).with_context(|| format!("loading config {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    match cli.command {
        Command::Info { model, json } => info(&model, config, json),
        Command::Run {
            model,
            inputs,
            mode,
            save,
        } => run(&model, &inputs, mode.into(), save.as_deref(), config),
        Command::Fit {
            model,
            data,
            epochs,
            output,
            learning_rate,
            decay,
            checkpoints,
        } => {
            let decay = decay.map(|v| parse_decay(&v)).transpose()?;
            let options = FitOptions {
                epochs,
                learning_rate,
                decay,
                checkpoints,
            };
            fit(&model, &data, &output, options, config)
        }
    }
}

fn info(model: &Path, config: SessionConfig, json: bool) -> Result<()> {
    let session = TrainSession::open(model, config).with_context(|| format!("loading {}", model.display()))?;
    let graph = session.graph();
    if json {
        let infos: Vec<_> = session.tensors().iter().map(|t| t.info()).collect();
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }
    println!("model   {}", model.display());
    println!("digest  {}", graph.digest().unwrap_or("-"));
    println!("params  {:?}", graph.train_params());
    print!("{graph}");
    Ok(())
}

fn run(model: &Path, inputs: &Path, mode: Mode, save: Option<&Path>, config: SessionConfig) -> Result<()> {
    let values = read_inputs(inputs)?;
    let manager = SessionManager::start();
    let handle = manager
        .init(model, config)
        .with_context(|| format!("loading {}", model.display()))?;
    let result = run_with(&manager, handle, &values, mode, save);
    manager.free(handle);
    let _ = manager.shutdown();
    result
}

fn run_with(
    manager: &SessionManager,
    handle: SessionHandle,
    values: &BTreeMap<String, InputValue>,
    mode: Mode,
    save: Option<&Path>,
) -> Result<()> {
    match mode {
        Mode::Train => manager.train(handle)?,
        Mode::Eval => manager.eval(handle)?,
    }
    let mut refs = Vec::with_capacity(values.len());
    let mut dims = Vec::with_capacity(values.len());
    for (name, value) in values {
        let Some(r) = manager.get_input_by_tensor_name(handle, name)? else {
            bail!("model has no input named `{name}`");
        };
        refs.push(r);
        dims.push(value.shape.clone());
    }
    manager.resize(handle, &refs, &dims).context("resizing inputs")?;
    for (r, value) in refs.iter().zip(values.values()) {
        match manager.tensor_info(r)?.dtype {
            DType::F32 => manager.write_f32(r, &to_f32(&value.data))?,
            DType::I32 => manager.write_i32(r, &to_i32(&value.data)?)?,
        }
    }
    manager.run_graph(handle).context("running graph")?;

    let mut outputs = BTreeMap::new();
    for (name, r) in manager.get_output_map_by_tensor(handle)? {
        let info = manager.tensor_info(&r)?;
        let data = match info.dtype {
            DType::F32 => serde_json::to_value(manager.read_f32(&r)?)?,
            DType::I32 => serde_json::to_value(manager.read_i32(&r)?)?,
        };
        outputs.insert(
            name,
            OutputValue {
                shape: info.shape,
                dtype: info.dtype,
                data,
            },
        );
    }
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    if let Some(path) = save {
        manager
            .save_to_file(handle, path)
            .with_context(|| format!("saving {}", path.display()))?;
    }
    Ok(())
}

struct FitOptions {
    epochs: usize,
    learning_rate: Option<f32>,
    decay: Option<LrScheduler>,
    checkpoints: Option<PathBuf>,
}

fn fit(model: &Path, data: &Path, output: &Path, options: FitOptions, config: SessionConfig) -> Result<()> {
    let text = fs::read_to_string(data).with_context(|| format!("reading {}", data.display()))?;
    let batches: Vec<BTreeMap<String, InputValue>> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", data.display()))?;

    let mut session = TrainSession::open(model, config).with_context(|| format!("loading {}", model.display()))?;
    if let Some(rate) = options.learning_rate {
        session.set_learning_rate(rate)?;
    }
    let mut feed = VecFeed::default();
    for batch in batches {
        let mut inputs = Vec::with_capacity(batch.len());
        for (name, value) in batch {
            let dtype = session
                .get_input_by_tensor_name(&name)
                .and_then(|id| session.tensor(id))
                .map(|t| t.dtype())
                .with_context(|| format!("model has no input named `{name}`"))?;
            let data = match dtype {
                DType::F32 => TensorData::F32(to_f32(&value.data)),
                DType::I32 => TensorData::I32(to_i32(&value.data)?),
            };
            inputs.push(BatchInput {
                name,
                shape: value.shape,
                data,
            });
        }
        feed.push(inputs);
    }

    let mut monitor = LossMonitor::default();
    let mut decay = options.decay;
    let mut saver = options
        .checkpoints
        .map(|dir| CheckpointSaver::new(dir, &file_stem(output), 1));
    let mut callbacks: Vec<&mut dyn TrainLoopCallback> = vec![&mut monitor];
    if let Some(d) = decay.as_mut() {
        callbacks.push(d);
    }
    if let Some(s) = saver.as_mut() {
        callbacks.push(s);
    }
    let outcome = TrainLoop::new(&mut session)
        .train(options.epochs, &mut feed, &mut callbacks)
        .context("training")?;
    session
        .save_to_file(output)
        .with_context(|| format!("saving {}", output.display()))?;
    println!(
        "trained {} epochs ({} steps), final loss {}",
        outcome.epochs,
        outcome.steps,
        monitor
            .epoch_means()
            .last()
            .map_or_else(|| "-".to_string(), |l| format!("{l:.6}"))
    );
    Ok(())
}

fn read_inputs(path: &Path) -> Result<BTreeMap<String, InputValue>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_decay(values: &[String]) -> Result<LrScheduler> {
    let [step, gamma] = values else {
        bail!("--decay takes STEP and GAMMA");
    };
    let step: usize = step.parse().context("--decay STEP")?;
    let gamma: f32 = gamma.parse().context("--decay GAMMA")?;
    Ok(LrScheduler::new(step, gamma))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned())
}

fn to_f32(data: &[f64]) -> Vec<f32> {
    data.iter().map(|&v| v as f32).collect()
}

fn to_i32(data: &[f64]) -> Result<Vec<i32>> {
    data.iter()
        .map(|&v| {
            if v.fract() != 0.0 || v < f64::from(i32::MIN) || v > f64::from(i32::MAX) {
                bail!("{v} is not an i32 value");
            }
            Ok(v as i32)
        })
        .collect()
}

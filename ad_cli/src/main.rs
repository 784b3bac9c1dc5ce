//! CLI demo for the autodiff tensor library.
//!
//! Trains a 2-4-1 network on XOR with a tanh hidden layer, MSE loss and
//! Adam, on either the reference CPU device or the batched device.

use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ad_backend_batch::{BatchConfig, BatchDevice};
use ad_nn::{save, Adam, Linear, Loss, MSELoss, Module, Optimizer, Sequential, Tanh};
use ad_tensor::prelude::*;
use clap::{Parser, ValueEnum};
use log::{debug, info};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceArg {
    Cpu,
    Batched,
}

#[derive(Parser)]
#[command(name = "ad_cli")]
#[command(about = "Train an XOR network with the autodiff tensor library")]
#[command(version)]
struct Cli {
    /// Device to train on
    #[arg(short, long, value_enum, default_value = "cpu")]
    device: DeviceArg,

    /// JSON training config; flags given on the command line override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Seed for parameter initialisation
    #[arg(long)]
    seed: Option<u64>,

    /// Write the trained parameters to this file
    #[arg(short, long)]
    save: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TrainConfig {
    epochs: usize,
    learning_rate: f64,
    /// Training stops once the loss drops below this value.
    loss_threshold: f32,
    hidden: usize,
    log_every: usize,
    seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 1000,
            learning_rate: 0.05,
            loss_threshold: 1e-5,
            hidden: 4,
            log_every: 100,
            seed: None,
        }
    }
}

impl TrainConfig {
    fn load(path: &Path) -> std::result::Result<Self, Box<dyn Error>> {
        let config = serde_json::from_reader(File::open(path)?)?;
        Ok(config)
    }

    fn overlay(mut self, cli: &Cli) -> Self {
        if let Some(epochs) = cli.epochs {
            self.epochs = epochs;
        }
        if let Some(lr) = cli.lr {
            self.learning_rate = lr;
        }
        if cli.seed.is_some() {
            self.seed = cli.seed;
        }
        self.log_every = self.log_every.max(1);
        self
    }
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    }
    .overlay(&cli);
    debug!("training config: {:?}", config);

    if let Some(seed) = config.seed {
        ad_tensor::manual_seed(seed);
    }

    let batch_device = match cli.device {
        DeviceArg::Cpu => None,
        DeviceArg::Batched => Some(Arc::new(BatchDevice::new(BatchConfig::from_env())?)),
    };
    let device: Arc<dyn Device> = match &batch_device {
        Some(batch) => Arc::clone(batch) as Arc<dyn Device>,
        None => cpu_device(),
    };

    println!("=== XOR Training Demo ===\n");
    println!("Device: {:?}", device.kind());

    let opts = TensorOptions::default().device(Arc::clone(&device));
    let x = tensor(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [4, 2], &opts)?;
    let y = tensor(&[0.0f32, 1.0, 1.0, 0.0], [4, 1], &opts)?;

    let model = Sequential::new()
        .with(Linear::with_options(2, config.hidden, &opts)?)
        .with(Tanh)
        .with(Linear::with_options(config.hidden, 1, &opts)?);
    println!("Learnable parameters: {}\n", model.learnable_parameters());

    let mut optimizer = Adam::new(model.parameters(), config.learning_rate);
    let start = Instant::now();
    let mut epochs_run = 0;
    let mut final_loss = f32::INFINITY;

    for epoch in 0..config.epochs {
        optimizer.zero_grad()?;
        let loss = MSELoss.forward(&model.forward(&x)?, &y)?;
        loss.backward()?;
        optimizer.step()?;
        epochs_run = epoch + 1;

        // Reading the loss is a synchronisation point on the batched device.
        final_loss = loss.item::<f32>()?;
        let converged = final_loss <= config.loss_threshold;
        if epoch % config.log_every == 0 || converged {
            info!("epoch {:5}  loss {:.6}", epoch, final_loss);
        }
        if converged {
            break;
        }
    }
    device.commit_and_wait()?;
    let elapsed = start.elapsed();

    println!(
        "\nTrained {} epochs in {:.2?} ({:.3?} per iteration), final loss {:.6}",
        epochs_run,
        elapsed,
        elapsed / epochs_run.max(1) as u32,
        final_loss
    );
    println!("\nPredictions:");
    let inputs = x.to_vec::<f32>()?;
    let targets = y.to_vec::<f32>()?;
    let outputs = model.forward(&x)?.to_vec::<f32>()?;
    for (i, (output, target)) in outputs.iter().zip(&targets).enumerate() {
        println!(
            "  [{:.0}, {:.0}] -> {:.4} (target {:.0})",
            inputs[2 * i],
            inputs[2 * i + 1],
            output,
            target
        );
    }

    if let Some(batch) = &batch_device {
        println!("\nBatch statistics:\n{}", serde_json::to_string_pretty(&batch.stats())?);
    }

    if let Some(path) = &cli.save {
        save(&model, path)?;
        println!("\nSaved parameters to {}", path.display());
    }

    Ok(())
}

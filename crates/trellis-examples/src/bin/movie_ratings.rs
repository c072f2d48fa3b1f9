//! Matrix factorization on synthetic movie ratings.
//!
//! Generates ratings from hidden user and item factors, then fits a biased
//! factorization model with the Trellis model base. The model supplies only
//! its loss; the trainer runs the steps, validation and hooks.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device, Tensor, Var};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis_optimizer::{create_optimizer, Optimizer, OptimizerConfig};
use trellis_tensor::Nested;
use trellis_training::{
    CompiledModel, EarlyStoppingHook, Metric, Model, MonitorMode, RootMeanSquaredError,
    Trackable, Trainer, TrainerConfig, TrainingResult,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Sgd,
    Adam,
    Adamw,
}

#[derive(Parser, Debug)]
#[command(about = "Train a rating factorization model on synthetic data")]
struct Args {
    /// Number of epochs. Overrides the config file.
    #[arg(long)]
    epochs: Option<usize>,

    /// Learning rate.
    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    /// Update rule.
    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,

    /// Trainer configuration as JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for data generation and initialization.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 100)]
    users: usize,

    #[arg(long, default_value_t = 80)]
    items: usize,

    /// Embedding dimension.
    #[arg(long, default_value_t = 8)]
    dim: usize,

    /// Number of synthetic ratings.
    #[arg(long, default_value_t = 5000)]
    ratings: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// L2 penalty on the factor matrices.
    #[arg(long, default_value_t = 1e-4)]
    l2: f64,

    /// Stop after this many epochs without validation improvement.
    #[arg(long)]
    patience: Option<u64>,

    /// Write the fit history as JSON.
    #[arg(long)]
    history: Option<PathBuf>,
}

/// rating = <u, i> + b_u + b_i + b
struct RatingFactorization {
    user_factors: Var,
    item_factors: Var,
    user_bias: Var,
    item_bias: Var,
    global_bias: Var,
    l2: f64,
    rmse: RootMeanSquaredError,
}

impl RatingFactorization {
    fn new(
        users: usize,
        items: usize,
        dim: usize,
        l2: f64,
        rng: &mut StdRng,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let mut init = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-0.1..0.1)).collect()
        };
        Ok(Self {
            user_factors: Var::from_vec(init(users * dim), (users, dim), device)?,
            item_factors: Var::from_vec(init(items * dim), (items, dim), device)?,
            user_bias: Var::zeros(users, DType::F32, device)?,
            item_bias: Var::zeros(items, DType::F32, device)?,
            global_bias: Var::new(&[3.0f32], device)?,
            l2,
            rmse: RootMeanSquaredError::new("rmse"),
        })
    }

    fn scores(&self, inputs: &Nested) -> TrainingResult<Tensor> {
        let users = inputs.tensor("user_id")?;
        let items = inputs.tensor("item_id")?;

        let u = self.user_factors.as_tensor().index_select(users, 0)?;
        let i = self.item_factors.as_tensor().index_select(items, 0)?;
        let ub = self.user_bias.as_tensor().index_select(users, 0)?;
        let ib = self.item_bias.as_tensor().index_select(items, 0)?;

        Ok(u.mul(&i)?
            .sum(1)?
            .add(&ub)?
            .add(&ib)?
            .broadcast_add(self.global_bias.as_tensor())?)
    }
}

impl Trackable for RatingFactorization {
    fn trainable_variables(&self) -> Vec<Var> {
        vec![
            self.user_factors.clone(),
            self.item_factors.clone(),
            self.user_bias.clone(),
            self.item_bias.clone(),
            self.global_bias.clone(),
        ]
    }

    fn metrics(&self) -> Vec<&dyn Metric> {
        vec![&self.rmse]
    }

    fn metrics_mut(&mut self) -> Vec<&mut dyn Metric> {
        vec![&mut self.rmse]
    }
}

impl Model for RatingFactorization {
    fn train_loss(&mut self, inputs: &Nested, _training: bool) -> TrainingResult<Tensor> {
        let rating = inputs.tensor("rating")?;
        let pred = self.scores(inputs)?;
        self.rmse.update_state(rating, &pred, None)?;
        Ok(pred.sub(rating)?.sqr()?.mean_all()?)
    }

    fn call(&self, inputs: &Nested) -> TrainingResult<Tensor> {
        self.scores(inputs)
    }

    fn regularization_loss(&self) -> TrainingResult<Option<Tensor>> {
        if self.l2 == 0.0 {
            return Ok(None);
        }
        let penalty = (self.user_factors.as_tensor().sqr()?.sum_all()?
            + self.item_factors.as_tensor().sqr()?.sum_all()?)?;
        Ok(Some(penalty.affine(self.l2, 0.0)?))
    }
}

struct Ratings {
    users: Vec<u32>,
    items: Vec<u32>,
    ratings: Vec<f32>,
}

fn synthesize(args: &Args, rng: &mut StdRng) -> Ratings {
    let mut factors = |n: usize| -> Vec<f32> {
        (0..n * args.dim)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect()
    };
    let user_factors = factors(args.users);
    let item_factors = factors(args.items);
    let scale = (args.dim as f32).sqrt();

    let mut data = Ratings {
        users: Vec::with_capacity(args.ratings),
        items: Vec::with_capacity(args.ratings),
        ratings: Vec::with_capacity(args.ratings),
    };
    for _ in 0..args.ratings {
        let u = rng.gen_range(0..args.users);
        let i = rng.gen_range(0..args.items);
        let dot: f32 = (0..args.dim)
            .map(|d| user_factors[u * args.dim + d] * item_factors[i * args.dim + d])
            .sum();
        let noise: f32 = rng.gen_range(-0.25..0.25);
        data.users.push(u as u32);
        data.items.push(i as u32);
        data.ratings
            .push((3.0 + 1.5 * dot / scale + noise).clamp(1.0, 5.0));
    }
    data
}

/// Splits `[start, end)` into batches, each wrapped as a one-element sequence
/// the way a feature-only input pipeline hands them over.
fn batches(
    data: &Ratings,
    start: usize,
    end: usize,
    batch_size: usize,
    device: &Device,
) -> anyhow::Result<Vec<Nested>> {
    let mut out = Vec::new();
    let mut lo = start;
    while lo < end {
        let hi = (lo + batch_size).min(end);
        let features = Nested::map_of([
            ("user_id", Tensor::new(&data.users[lo..hi], device)?),
            ("item_id", Tensor::new(&data.items[lo..hi], device)?),
            ("rating", Tensor::new(&data.ratings[lo..hi], device)?),
        ]);
        out.push(Nested::Seq(vec![features]));
        lo = hi;
    }
    Ok(out)
}

fn optimizer_config(kind: OptimizerKind, learning_rate: f64) -> OptimizerConfig {
    match kind {
        OptimizerKind::Sgd => OptimizerConfig::Sgd { learning_rate },
        OptimizerKind::Adam => OptimizerConfig::adam(learning_rate),
        OptimizerKind::Adamw => OptimizerConfig::AdamW {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        },
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
    let args = Args::parse();
    anyhow::ensure!(args.users > 0 && args.items > 0, "need at least one user and one item");
    anyhow::ensure!(args.ratings >= 10, "need at least 10 ratings");
    anyhow::ensure!(args.batch_size > 0, "batch size must be positive");

    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_json_file(path)
            .with_context(|| format!("loading trainer config from {}", path.display()))?,
        None => TrainerConfig::new(10).with_log_every_n_steps(20),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }

    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let data = synthesize(&args, &mut rng);
    let split = args.ratings * 4 / 5;
    let train = batches(&data, 0, split, args.batch_size, &device)?;
    let validation = batches(&data, split, args.ratings, args.batch_size, &device)?;
    info!(
        users = args.users,
        items = args.items,
        train_batches = train.len(),
        validation_batches = validation.len(),
        "Generated synthetic ratings"
    );

    let model = RatingFactorization::new(
        args.users,
        args.items,
        args.dim,
        args.l2,
        &mut rng,
        &device,
    )?;
    let optimizer = create_optimizer(optimizer_config(args.optimizer, args.learning_rate))?;
    info!(
        optimizer = optimizer.name(),
        learning_rate = optimizer.learning_rate(),
        "Compiled model"
    );

    let mut trainer = Trainer::new(CompiledModel::new(model, optimizer), config)?;
    if let Some(patience) = args.patience {
        trainer.add_hook(
            EarlyStoppingHook::new("val_loss", patience, 1e-4).with_mode(MonitorMode::Epoch),
        );
    }

    let history = trainer.fit(&train, Some(validation.as_slice()))?;
    let eval = trainer.evaluate(validation.iter().cloned())?;
    info!(
        global_step = history.global_step,
        stopped_early = history.stopped_early,
        val_loss = eval.mean_loss,
        val_rmse = eval.metrics.get("rmse").unwrap_or_default(),
        "movie_ratings finished"
    );

    let sample = validation.first().context("no validation batches")?;
    let predicted = trainer.compiled().predict(sample.clone())?;
    let preview: Vec<f32> = predicted.to_vec1::<f32>()?.into_iter().take(5).collect();
    info!(?preview, "Sample predictions");

    if let Some(path) = &args.history {
        std::fs::write(path, serde_json::to_string_pretty(&history)?)
            .with_context(|| format!("writing history to {}", path.display()))?;
        info!(path = %path.display(), "Wrote fit history");
    }
    Ok(())
}

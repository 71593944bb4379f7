//! Command line entry point: train, evaluate and generate synthetic data.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use unet_dann::config::{Config, ModelConfig};
use unet_dann::data::{Dataset, DomainPair, ImageDataset};
use unet_dann::train::{loader, Trainer};

#[derive(Parser, Debug)]
#[command(author, version, about = "U-Net autoencoder with domain-adversarial training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train on a source and a target domain
    Train(TrainArgs),
    /// Report test losses of a checkpoint
    Eval(EvalArgs),
    /// Write a synthetic source/target pair as SafeTensors files
    Synth(SynthArgs),
}

/// Where the four image sets come from.
#[derive(Args, Debug)]
struct DataArgs {
    /// Generate this many synthetic training images per domain instead of reading files
    #[arg(long, conflicts_with_all = ["source_train", "target_train"])]
    synthetic: Option<usize>,

    #[arg(long, requires = "target_train")]
    source_train: Option<PathBuf>,
    #[arg(long)]
    source_test: Option<PathBuf>,
    #[arg(long, requires = "source_train")]
    target_train: Option<PathBuf>,
    #[arg(long)]
    target_test: Option<PathBuf>,

    /// Tensor name inside the SafeTensors files
    #[arg(long, default_value = "images")]
    key: String,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// JSON configuration; defaults apply to missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,

    /// Directory for summaries and checkpoints
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Continue from a checkpoint directory
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    lr: Option<f32>,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Args, Debug)]
struct EvalArgs {
    /// Checkpoint directory
    #[arg(long)]
    checkpoint: PathBuf,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Output directory
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 64)]
    train_count: usize,
    #[arg(long, default_value_t = 16)]
    test_count: usize,
    #[arg(long, default_value_t = 128)]
    size: usize,
    #[arg(long, default_value_t = 1)]
    channels: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value = "images")]
    key: String,
}

/// Source train, source test, target train, target test.
type Splits = (ImageDataset, ImageDataset, ImageDataset, ImageDataset);

fn read(path: &Path, key: &str) -> Result<ImageDataset> {
    ImageDataset::from_safetensors(path, key).with_context(|| format!("failed to read '{key}' from {}", path.display()))
}

fn load_splits(data: &DataArgs, model: &ModelConfig, seed: u64) -> Result<Splits> {
    if let Some(count) = data.synthetic {
        let test_count = (count / 4).max(1);
        let train = DomainPair::new(model.input_size, seed).with_channels(model.in_channels);
        let test = DomainPair::new(model.input_size, seed.wrapping_add(1)).with_channels(model.in_channels);
        let (src_train, tar_train) = train.generate(count)?;
        let (src_test, tar_test) = test.generate(test_count)?;
        info!(train = count, test = test_count, size = model.input_size, "generated synthetic domains");
        return Ok((src_train, src_test, tar_train, tar_test));
    }

    let (Some(src_train), Some(tar_train)) = (&data.source_train, &data.target_train) else {
        bail!("pass --synthetic <count> or both --source-train and --target-train");
    };
    let src_train = read(src_train, &data.key)?;
    let tar_train = read(tar_train, &data.key)?;
    // Without test files the training sets double as test sets.
    let src_test = data.source_test.as_deref().map(|p| read(p, &data.key)).transpose()?.unwrap_or_else(|| src_train.clone());
    let tar_test = data.target_test.as_deref().map(|p| read(p, &data.key)).transpose()?.unwrap_or_else(|| tar_train.clone());

    let expected = [model.in_channels, model.input_size, model.input_size];
    for (name, ds) in [("source train", &src_train), ("source test", &src_test), ("target train", &tar_train), ("target test", &tar_test)] {
        if ds.image_shape() != expected {
            bail!("{name} images have shape {:?}, the model expects {:?}", ds.image_shape(), expected);
        }
    }
    Ok((src_train, src_test, tar_train, tar_test))
}

fn train(args: TrainArgs) -> Result<()> {
    let mut trainer = match &args.resume {
        Some(dir) => Trainer::from_checkpoint(dir).with_context(|| format!("failed to resume from {}", dir.display()))?,
        None => {
            let config = match &args.config {
                Some(path) => Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))?,
                None => Config::default(),
            };
            Trainer::new(config).context("invalid configuration")?
        }
    };

    let mut train_config = trainer.config().train.clone();
    if let Some(epochs) = args.epochs {
        train_config.epochs = epochs;
    }
    if let Some(lr) = args.lr {
        train_config.lr = lr;
    }
    if let Some(batch_size) = args.batch_size {
        train_config.batch_size = batch_size;
    }
    if args.log_dir.is_some() {
        train_config.log_dir = args.log_dir.clone();
    }
    trainer.set_train_config(train_config.clone())?;

    let (src_train, src_test, tar_train, tar_test) = load_splits(&args.data, &trainer.config().model, train_config.seed)?;
    let summary = trainer.train_net(
        &loader(src_train, &train_config, true),
        &loader(src_test, &train_config, false),
        &loader(tar_train, &train_config, true),
        &loader(tar_test, &train_config, false),
    )?;

    info!(
        epochs = summary.epochs_completed,
        steps = summary.global_step,
        final_train_loss = ?summary.final_train_loss,
        best_test_loss = ?summary.best_test_loss,
        "training finished"
    );
    Ok(())
}

fn eval(args: EvalArgs) -> Result<()> {
    let mut trainer = Trainer::from_checkpoint(&args.checkpoint)
        .with_context(|| format!("failed to load checkpoint {}", args.checkpoint.display()))?;
    let train_config = trainer.config().train.clone();
    let (_, src_test, _, tar_test) = load_splits(&args.data, &trainer.config().model, train_config.seed)?;
    let epoch = trainer.epoch();
    let losses =
        trainer.test_epoch(&loader(src_test, &train_config, false), &loader(tar_test, &train_config, false), epoch, None, false)?;
    println!("loss:     {:.6}", losses.loss);
    println!("loss-rec: {:.6}", losses.loss_rec);
    println!("loss-dom: {:.6}", losses.loss_dom);
    Ok(())
}

fn synth(args: SynthArgs) -> Result<()> {
    std::fs::create_dir_all(&args.out).with_context(|| format!("failed to create {}", args.out.display()))?;
    let train = DomainPair::new(args.size, args.seed).with_channels(args.channels);
    let test = DomainPair::new(args.size, args.seed.wrapping_add(1)).with_channels(args.channels);
    let (src_train, tar_train) = train.generate(args.train_count)?;
    let (src_test, tar_test) = test.generate(args.test_count)?;
    for (file, ds) in [
        ("source_train.safetensors", &src_train),
        ("source_test.safetensors", &src_test),
        ("target_train.safetensors", &tar_train),
        ("target_test.safetensors", &tar_test),
    ] {
        let path = args.out.join(file);
        ds.to_safetensors(&path, &args.key).with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), images = ds.len(), "wrote dataset");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("unet_dann=info".parse()?))
        .init();

    match Cli::parse().command {
        Commands::Train(args) => train(args),
        Commands::Eval(args) => eval(args),
        Commands::Synth(args) => synth(args),
    }
}

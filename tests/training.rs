//! Short end-to-end runs on synthetic domains.

use unet_dann::config::{Config, ModelConfig, TrainConfig};
use unet_dann::data::DomainPair;
use unet_dann::metrics::read_scalars;
use unet_dann::serialization::checkpoint::{CONFIG_FILE, MODEL_FILE, OPTIMIZER_FILE};
use unet_dann::train::{loader, Trainer, BEST_CHECKPOINT_DIR, CHECKPOINT_DIR};

use std::path::PathBuf;

fn tiny_config(log_dir: Option<PathBuf>) -> Config {
    Config {
        model: ModelConfig {
            feature_maps: 2,
            levels: 1,
            input_size: 16,
            group_norm: Some(2),
            lambda_rec: 0.1,
            ..Default::default()
        },
        train: TrainConfig { lr: 1e-2, epochs: 5, batch_size: 4, seed: 7, log_dir, ..Default::default() },
    }
}

fn log_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("unet_dann_training_{}_{}", name, std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

#[test]
fn training_reduces_loss_and_writes_checkpoints() {
    let dir = log_dir("e2e");
    let config = tiny_config(Some(dir.clone()));
    let (src_train, tar_train) = DomainPair::new(16, 0).generate(8).unwrap();
    let (src_test, tar_test) = DomainPair::new(16, 1).generate(4).unwrap();
    let src_train = loader(src_train, &config.train, true);
    let tar_train = loader(tar_train, &config.train, true);
    let src_test = loader(src_test, &config.train, false);
    let tar_test = loader(tar_test, &config.train, false);

    let mut trainer = Trainer::new(config).unwrap();
    let summary = trainer.train_net(&src_train, &src_test, &tar_train, &tar_test).unwrap();

    assert_eq!(summary.epochs_completed, 5);
    assert_eq!(summary.global_step, 10);
    let train_losses = summary.history.get_history("train/loss").unwrap();
    assert_eq!(train_losses.len(), 5);
    assert!(
        train_losses[4].1 < train_losses[0].1,
        "loss did not decrease: {:?}",
        train_losses
    );
    let (best, _) = summary.history.get_best("test/loss").unwrap();
    assert!((summary.best_test_loss.unwrap() as f64 - best).abs() < 1e-6);

    for checkpoint in [CHECKPOINT_DIR, BEST_CHECKPOINT_DIR] {
        for file in [CONFIG_FILE, MODEL_FILE, OPTIMIZER_FILE] {
            assert!(dir.join(checkpoint).join(file).exists(), "{checkpoint}/{file} missing");
        }
    }

    let events = read_scalars(&dir).unwrap();
    for tag in ["train/loss", "train/loss-rec", "train/loss-dom", "test/loss", "learning_rate"] {
        assert_eq!(events.iter().filter(|e| e.tag == tag).count(), 5, "{tag}");
    }
    assert!(dir.join("images").join("train_x-rec-input_000000.pgm").exists());
    assert!(dir.join("images").join("test_x-rec-output_000004.pgm").exists());

    std::fs::remove_dir_all(dir).ok();
}

#[test]
fn resumed_training_continues_from_checkpoint() {
    let dir = log_dir("resume");
    let mut config = tiny_config(Some(dir.clone()));
    config.train.epochs = 2;
    config.train.gamma = 0.5;
    let (src, tar) = DomainPair::new(16, 2).generate(4).unwrap();
    let src = loader(src, &config.train, false);
    let tar = loader(tar, &config.train, false);

    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.train_net(&src, &src, &tar, &tar).unwrap();
    // lr is base * gamma^epoch after each epoch: 1e-2, then 5e-3.
    assert!((trainer.learning_rate() - 5e-3).abs() < 1e-8);

    let mut resumed = Trainer::from_checkpoint(dir.join(CHECKPOINT_DIR)).unwrap();
    assert_eq!(resumed.epoch(), 2);
    assert_eq!(resumed.global_step(), trainer.global_step());
    assert_eq!(resumed.store().parameters(), trainer.store().parameters());
    assert!((resumed.learning_rate() - 5e-3).abs() < 1e-8);

    let mut train = resumed.config().train.clone();
    train.epochs = 3;
    resumed.set_train_config(train).unwrap();
    let summary = resumed.train_net(&src, &src, &tar, &tar).unwrap();
    assert_eq!(summary.epochs_completed, 3);
    assert_eq!(summary.global_step, 3);
    assert!((resumed.learning_rate() - 2.5e-3).abs() < 1e-8);

    std::fs::remove_dir_all(dir).ok();
}

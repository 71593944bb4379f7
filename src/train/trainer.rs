//! Domain-adversarial training loop.

use super::step::StepCache;
use super::{EpochLosses, TrainError, TrainResult, TrainingSummary};
use crate::config::{Config, TrainConfig};
use crate::data::{DataLoader, ImageDataset};
use crate::metrics::{make_grid, sigmoid_images, GridOptions, MetricLogger, RunningMean, SummaryWriter};
use crate::model::UNetAE;
use crate::optimizers::{Adam, Optimizer, StepLr};
use crate::runtime::cpu_backend::CpuBackend;
use crate::serialization::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointMetadata};
use crate::state::ParamStore;
use crate::tensor::{GraphContext, Mode};
use ndarray::{concatenate, Array2, ArrayD, Axis};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{info, warn};

/// Checkpoint written after every epoch, inside the log directory.
pub const CHECKPOINT_DIR: &str = "checkpoint";
/// Checkpoint of the epoch with the lowest test loss.
pub const BEST_CHECKPOINT_DIR: &str = "best_checkpoint";

/// Output of [`Trainer::reconstruct`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Sigmoid of the reconstruction logits, shaped like the input.
    pub images: ArrayD<f32>,
    /// `[N, 2]` softmax over (source, target).
    pub domain_probabilities: ArrayD<f32>,
}

/// Stacks a source and a target batch along the batch axis and builds the
/// one-hot domain labels: `[1, 0]` for source rows, `[0, 1]` for target rows.
pub fn domain_batch(source: &ArrayD<f32>, target: &ArrayD<f32>) -> TrainResult<(ArrayD<f32>, ArrayD<f32>)> {
    if source.ndim() != 4 || source.shape()[1..] != target.shape()[1..] {
        return Err(TrainError::InvalidBatch(format!(
            "source batch {:?} and target batch {:?} do not share an image shape",
            source.shape(),
            target.shape()
        )));
    }
    let n_src = source.shape()[0];
    let n = n_src + target.shape()[0];
    let x = concatenate(Axis(0), &[source.view(), target.view()])
        .map_err(|e| TrainError::InvalidBatch(e.to_string()))?;
    let labels = Array2::from_shape_fn((n, 2), |(i, k)| if (i < n_src) == (k == 0) { 1.0 } else { 0.0 });
    Ok((x, labels.into_dyn()))
}

/// Builds a loader with the batch size, shuffling and seed of `config`.
pub fn loader(dataset: ImageDataset, config: &TrainConfig, shuffle: bool) -> DataLoader {
    DataLoader::new(dataset, config.batch_size).shuffle(shuffle && config.shuffle).seed(config.seed)
}

/// Owns the weights, the optimizer and the compiled graphs of a training run.
///
/// ```rust,ignore
/// let mut trainer = Trainer::new(config)?;
/// let summary = trainer.train_net(&src_train, &src_test, &tar_train, &tar_test)?;
/// ```
pub struct Trainer {
    config: Config,
    store: ParamStore,
    optimizer: Adam,
    scheduler: StepLr,
    backend: CpuBackend,
    steps: StepCache,
    /// Completed epochs.
    epoch: usize,
    global_step: usize,
    best_test_loss: Option<f32>,
    last_train_loss: Option<f32>,
    history: MetricLogger,
}

impl Trainer {
    pub fn new(config: Config) -> TrainResult<Self> {
        config.validate()?;
        let ctx = Rc::new(RefCell::new(GraphContext::with_mode(Mode::Train)));
        UNetAE::new(&ctx, &config.model);
        let store = ParamStore::from_context(&ctx.borrow(), config.train.seed);
        info!(
            parameters = store.num_parameters(),
            tensors = store.parameters().len(),
            "initialized U-Net autoencoder with domain classifier"
        );

        let train = &config.train;
        Ok(Self {
            store,
            optimizer: Adam::new(train.lr),
            scheduler: StepLr::new(train.lr, train.step_size, train.gamma),
            backend: CpuBackend::new(),
            steps: StepCache::new(config.model.clone(), train.reconstruction_loss),
            epoch: 0,
            global_step: 0,
            best_test_loss: None,
            last_train_loss: None,
            history: MetricLogger::new(),
            config,
        })
    }

    /// Restores weights, running statistics, optimizer state and progress.
    pub fn from_checkpoint<P: AsRef<Path>>(dir: P) -> TrainResult<Self> {
        let checkpoint = load_checkpoint(&dir)?;
        let meta = checkpoint.metadata;
        let mut trainer = Self::new(Config { model: meta.model, train: meta.train })?;
        trainer.store.load(checkpoint.model_weights)?;
        if let Some(state) = checkpoint.optimizer_state {
            trainer.optimizer.load_state(state)?;
        }
        trainer.optimizer.set_learning_rate(meta.learning_rate);
        trainer.epoch = meta.epoch;
        trainer.global_step = meta.global_step;
        trainer.best_test_loss = meta.best_loss;
        trainer.last_train_loss = meta.last_loss;
        info!(dir = %dir.as_ref().display(), epoch = trainer.epoch, "resumed from checkpoint");
        Ok(trainer)
    }

    /// Replaces the training schedule, e.g. to extend a resumed run. The model
    /// configuration stays fixed.
    pub fn set_train_config(&mut self, train: TrainConfig) -> TrainResult<()> {
        train.validate()?;
        if train.reconstruction_loss != self.config.train.reconstruction_loss {
            self.steps = StepCache::new(self.config.model.clone(), train.reconstruction_loss);
        }
        self.scheduler = StepLr::new(train.lr, train.step_size, train.gamma);
        // The schedule was last applied after epoch `self.epoch - 1`.
        self.optimizer.set_learning_rate(self.scheduler.lr_at(self.epoch.saturating_sub(1)));
        self.config.train = train;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn best_test_loss(&self) -> Option<f32> {
        self.best_test_loss
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    /// Number of graphs compiled so far.
    pub fn compiled_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn train_epoch(
        &mut self,
        src: &DataLoader,
        tar: &DataLoader,
        epoch: usize,
        writer: Option<&mut SummaryWriter>,
        write_images: bool,
    ) -> TrainResult<EpochLosses> {
        self.run_epoch(Mode::Train, src, tar, epoch, writer, write_images)
    }

    /// Same losses as [`Trainer::train_epoch`] with running statistics and no updates.
    pub fn test_epoch(
        &mut self,
        src: &DataLoader,
        tar: &DataLoader,
        epoch: usize,
        writer: Option<&mut SummaryWriter>,
        write_images: bool,
    ) -> TrainResult<EpochLosses> {
        self.run_epoch(Mode::Eval, src, tar, epoch, writer, write_images)
    }

    fn run_epoch(
        &mut self,
        mode: Mode,
        src: &DataLoader,
        tar: &DataLoader,
        epoch: usize,
        writer: Option<&mut SummaryWriter>,
        write_images: bool,
    ) -> TrainResult<EpochLosses> {
        let iterations = src.num_batches().min(tar.num_batches());
        if iterations == 0 {
            return Err(TrainError::EmptyLoader);
        }
        if src.num_batches() != tar.num_batches() {
            warn!(
                source = src.num_batches(),
                target = tar.num_batches(),
                "loaders differ in length, extra batches are skipped"
            );
        }
        let phase = match mode {
            Mode::Train => "train",
            Mode::Eval => "test",
        };

        let (mut loss, mut loss_rec, mut loss_dom) = (RunningMean::new(), RunningMean::new(), RunningMean::new());
        let mut last = None;
        for (i, (s, t)) in src.iter().zip(tar.iter()).enumerate() {
            let (x, labels) = domain_batch(&s.images, &t.images)?;
            let step = self.steps.get(mode, x.shape())?;
            let out = step.run(&self.backend, &self.store, &x, &labels)?;

            if mode == Mode::Train {
                self.optimizer.step(self.store.parameters_mut(), &out.gradients);
                for update in &out.batch_updates {
                    self.store.update_running_statistics(&update.stats, &update.mean, &update.var, update.count);
                }
                self.global_step += 1;
                if i % self.config.train.print_stats == 0 {
                    info!("Epoch {:5} - Iteration {:5}/{:5} - Loss: {:.6}", epoch, i, iterations, out.loss);
                }
            }

            loss.update(out.loss as f64);
            loss_rec.update(out.loss_rec as f64);
            loss_dom.update(out.loss_dom as f64);
            if write_images {
                last = Some((x, out.reconstruction));
            }
        }

        let losses = EpochLosses {
            loss: loss.compute() as f32,
            loss_rec: loss_rec.compute() as f32,
            loss_dom: loss_dom.compute() as f32,
            iterations: loss.count(),
        };
        info!("Epoch {:5} - Average {} loss: {:.6}", epoch, phase, losses.loss);
        self.history.log(&format!("{phase}/loss"), epoch, losses.loss as f64);

        if let Some(writer) = writer {
            writer.add_scalar(&format!("{phase}/loss-rec"), losses.loss_rec as f64, epoch)?;
            writer.add_scalar(&format!("{phase}/loss-dom"), losses.loss_dom as f64, epoch)?;
            writer.add_scalar(&format!("{phase}/loss"), losses.loss as f64, epoch)?;
            if let Some((x, reconstruction)) = last {
                if let Some(grid) = make_grid(&x, GridOptions::normalized()) {
                    writer.add_image(&format!("{phase}/x-rec-input"), &grid, epoch)?;
                }
                if let Some(grid) = make_grid(&sigmoid_images(&reconstruction), GridOptions::normalized()) {
                    writer.add_image(&format!("{phase}/x-rec-output"), &grid, epoch)?;
                }
            }
        }
        Ok(losses)
    }

    /// Runs epochs `self.epoch()..epochs`.
    ///
    /// After every epoch the learning rate follows the step schedule. Every
    /// `test_freq` epochs the test loaders are evaluated and, with a log
    /// directory, an improved test loss is saved to `best_checkpoint/`. The
    /// latest state always goes to `checkpoint/`.
    pub fn train_net(
        &mut self,
        src_train: &DataLoader,
        src_test: &DataLoader,
        tar_train: &DataLoader,
        tar_test: &DataLoader,
    ) -> TrainResult<TrainingSummary> {
        let train = self.config.train.clone();
        let mut writer = train.log_dir.as_ref().map(SummaryWriter::new).transpose()?;

        for epoch in self.epoch..train.epochs {
            info!("Epoch {:5}/{:5}", epoch, train.epochs);

            let write_images = epoch % train.write_images_freq == 0;
            let losses = self.train_epoch(src_train, tar_train, epoch, writer.as_mut(), write_images)?;
            self.last_train_loss = Some(losses.loss);

            let lr = self.scheduler.apply(&mut self.optimizer, epoch);
            info!(epoch, lr, "learning rate");
            if let Some(writer) = writer.as_mut() {
                writer.add_scalar("learning_rate", lr as f64, epoch)?;
            }
            self.epoch = epoch + 1;

            if epoch % train.test_freq == 0 {
                let test = self.test_epoch(src_test, tar_test, epoch, writer.as_mut(), true)?;
                if self.best_test_loss.map_or(true, |best| test.loss < best) {
                    self.best_test_loss = Some(test.loss);
                    if let Some(dir) = &train.log_dir {
                        self.save_checkpoint(dir.join(BEST_CHECKPOINT_DIR))?;
                    }
                }
            }

            if let Some(dir) = &train.log_dir {
                self.save_checkpoint(dir.join(CHECKPOINT_DIR))?;
            }
            if let Some(writer) = writer.as_mut() {
                writer.flush()?;
            }
        }

        if let Some(writer) = writer {
            writer.close()?;
        }
        Ok(TrainingSummary {
            epochs_completed: self.epoch,
            global_step: self.global_step,
            final_train_loss: self.last_train_loss,
            best_test_loss: self.best_test_loss,
            history: self.history.clone(),
        })
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, dir: P) -> TrainResult<PathBuf> {
        let metadata = CheckpointMetadata::new(self.config.model.clone(), self.config.train.clone())
            .with_epoch(self.epoch)
            .with_global_step(self.global_step)
            .with_learning_rate(self.optimizer.learning_rate())
            .with_last_loss(self.last_train_loss)
            .with_best_loss(self.best_test_loss);
        let checkpoint = Checkpoint::new(self.store.named_tensors(), metadata).with_optimizer_state(self.optimizer.state());
        save_checkpoint(&dir, &checkpoint)?;
        Ok(dir.as_ref().to_path_buf())
    }

    /// Eval-mode reconstruction of a `[N, C, H, W]` batch.
    pub fn reconstruct(&mut self, images: &ArrayD<f32>) -> TrainResult<Reconstruction> {
        let step = self.steps.get(Mode::Eval, images.shape())?;
        let (logits, domain_logits) = step.infer(&self.backend, &self.store, images)?;
        Ok(Reconstruction { images: sigmoid_images(&logits), domain_probabilities: softmax_rows(&domain_logits) })
    }
}

fn softmax_rows(logits: &ArrayD<f32>) -> ArrayD<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::DomainPair;
    use ndarray::IxDyn;

    fn tiny_config() -> Config {
        Config {
            model: ModelConfig { feature_maps: 2, levels: 1, input_size: 16, lambda_rec: 0.5, ..Default::default() },
            train: TrainConfig { batch_size: 2, epochs: 1, shuffle: false, ..Default::default() },
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("unet_dann_trainer_{}_{}", name, std::process::id()))
    }

    #[test]
    fn domain_batch_stacks_and_labels() {
        let src = ArrayD::from_elem(IxDyn(&[2, 1, 4, 4]), 1.0);
        let tar = ArrayD::from_elem(IxDyn(&[1, 1, 4, 4]), 2.0);
        let (x, labels) = domain_batch(&src, &tar).unwrap();
        assert_eq!(x.shape(), &[3, 1, 4, 4]);
        assert_eq!(x[[2, 0, 0, 0]], 2.0);
        assert_eq!(labels.into_dimensionality::<ndarray::Ix2>().unwrap(), ndarray::array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);

        let other = ArrayD::zeros(IxDyn(&[1, 1, 8, 8]));
        assert!(matches!(domain_batch(&src, &other), Err(TrainError::InvalidBatch(_))));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = ndarray::array![[0.0_f32, 0.0], [10.0, -10.0]].into_dyn();
        let p = softmax_rows(&logits);
        assert!((p[[0, 0]] - 0.5).abs() < 1e-6);
        assert!(p[[1, 0]] > 0.99);
        assert!((p[[1, 0]] + p[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_loader_is_an_error() {
        let mut trainer = Trainer::new(tiny_config()).unwrap();
        let (src, _) = DomainPair::new(16, 0).generate(2).unwrap();
        let empty = crate::data::ImageDataset::new(ArrayD::zeros(IxDyn(&[0, 1, 16, 16]))).unwrap();
        let src = DataLoader::new(src, 2);
        let tar = DataLoader::new(empty, 2);
        assert!(matches!(trainer.test_epoch(&src, &tar, 0, None, false), Err(TrainError::EmptyLoader)));
    }

    #[test]
    fn train_epoch_updates_weights_and_statistics() {
        let mut trainer = Trainer::new(tiny_config()).unwrap();
        let (src, tar) = DomainPair::new(16, 1).generate(3).unwrap();
        let before = trainer.store().clone();
        let src = DataLoader::new(src, 2);
        let tar = DataLoader::new(tar, 2);

        let losses = trainer.train_epoch(&src, &tar, 0, None, false).unwrap();
        assert_eq!(losses.iterations, 2);
        assert!(losses.loss.is_finite());
        assert!((losses.loss - (losses.loss_rec + 0.5 * losses.loss_dom)).abs() < 1e-3);
        assert_eq!(trainer.global_step(), 2);
        // Full batch and the trailing batch of one image per domain.
        assert_eq!(trainer.compiled_steps(), 2);
        assert_ne!(trainer.store().parameters(), before.parameters());
        assert_ne!(trainer.store().buffers(), before.buffers());

        let test = trainer.test_epoch(&src, &tar, 0, None, false).unwrap();
        assert!(test.loss.is_finite());
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn iteration_stops_at_the_shorter_loader() {
        let mut trainer = Trainer::new(tiny_config()).unwrap();
        let (src, _) = DomainPair::new(16, 4).generate(6).unwrap();
        let (_, tar) = DomainPair::new(16, 5).generate(4).unwrap();
        let src = DataLoader::new(src, 2);
        let tar = DataLoader::new(tar, 2);
        assert_eq!((src.num_batches(), tar.num_batches()), (3, 2));

        let losses = trainer.train_epoch(&src, &tar, 0, None, false).unwrap();
        assert_eq!(losses.iterations, 2);
        assert_eq!(trainer.global_step(), 2);

        let test = trainer.test_epoch(&tar, &src, 0, None, false).unwrap();
        assert_eq!(test.iterations, 2);
    }

    /// Pixel range of every tile in a binary PGM grid of `count` square images.
    fn tile_ranges(path: &Path, count: usize, size: usize) -> Vec<(u8, u8)> {
        let bytes = std::fs::read(path).unwrap();
        let header = format!("P5\n{} {}\n255\n", count * (size + 2) + 2, size + 4);
        assert!(bytes.starts_with(header.as_bytes()), "unexpected header in {}", path.display());
        let pixels = ArrayD::from_shape_vec(IxDyn(&[size + 4, count * (size + 2) + 2]), bytes[header.len()..].to_vec()).unwrap();
        (0..count)
            .map(|k| {
                let left = 2 + k * (size + 2);
                let tile = pixels.slice(ndarray::s![2..2 + size, left..left + size]);
                (*tile.iter().min().unwrap(), *tile.iter().max().unwrap())
            })
            .collect()
    }

    #[test]
    fn image_grids_are_normalized_per_image() {
        let dir = temp_dir("grids");
        std::fs::remove_dir_all(&dir).ok();
        let mut config = tiny_config();
        config.train.log_dir = Some(dir.clone());
        let mut trainer = Trainer::new(config).unwrap();
        let (src, tar) = DomainPair::new(16, 6).generate(2).unwrap();
        let (src, tar) = (DataLoader::new(src, 2), DataLoader::new(tar, 2));
        trainer.train_net(&src, &src, &tar, &tar).unwrap();

        for phase in ["train", "test"] {
            for tag in ["x-rec-input", "x-rec-output"] {
                let path = dir.join("images").join(format!("{phase}_{tag}_000000.pgm"));
                for (k, range) in tile_ranges(&path, 4, 16).into_iter().enumerate() {
                    assert_eq!(range, (0, 255), "{phase}/{tag} tile {k} is not normalized");
                }
            }
        }
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn reconstruct_returns_probabilities() {
        let mut trainer = Trainer::new(tiny_config()).unwrap();
        let (src, _) = DomainPair::new(16, 2).generate(3).unwrap();
        let out = trainer.reconstruct(src.images()).unwrap();
        assert_eq!(out.images.shape(), &[3, 1, 16, 16]);
        assert!(out.images.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(out.domain_probabilities.shape(), &[3, 2]);
        for row in out.domain_probabilities.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn checkpoint_restores_progress() {
        let dir = temp_dir("resume");
        let mut trainer = Trainer::new(tiny_config()).unwrap();
        let (src, tar) = DomainPair::new(16, 3).generate(2).unwrap();
        let (src, tar) = (DataLoader::new(src, 2), DataLoader::new(tar, 2));
        trainer.train_epoch(&src, &tar, 0, None, false).unwrap();
        trainer.save_checkpoint(&dir).unwrap();

        let restored = Trainer::from_checkpoint(&dir).unwrap();
        assert_eq!(restored.store().parameters(), trainer.store().parameters());
        assert_eq!(restored.store().buffers(), trainer.store().buffers());
        assert_eq!(restored.global_step(), 1);
        assert_eq!(restored.config(), trainer.config());
        assert_eq!(restored.optimizer.steps(), 1);
        std::fs::remove_dir_all(dir).ok();
    }
}

//! File-based summary writer for training curves and reconstructions.
//!
//! Layout of a log directory:
//!
//! ```text
//! log_dir/
//! ├── scalars.jsonl            # one {"tag", "step", "value", "wall_time"} object per line
//! └── images/
//!     └── train_x-rec-input_000003.pgm
//! ```

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Images must be [C, H, W] with 1 or 3 channels, got {0:?}")]
    UnsupportedImage(Vec<usize>),
}

type Result<T> = std::result::Result<T, WriterError>;

/// One line of `scalars.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

pub struct SummaryWriter {
    log_dir: PathBuf,
    scalars: BufWriter<File>,
}

impl SummaryWriter {
    /// Creates `log_dir` if needed; scalars are appended to an existing file.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(log_dir.join("images"))?;
        let file = OpenOptions::new().create(true).append(true).open(log_dir.join("scalars.jsonl"))?;
        Ok(Self { log_dir, scalars: BufWriter::new(file) })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let wall_time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let event = ScalarEvent { tag: tag.to_string(), step, value, wall_time };
        serde_json::to_writer(&mut self.scalars, &event)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    /// Writes a `[C, H, W]` image with values in `[0, 1]` as binary PGM (one
    /// channel) or PPM (three channels). Returns the path of the file.
    pub fn add_image(&mut self, tag: &str, image: &ArrayD<f32>, step: usize) -> Result<PathBuf> {
        let &[channels, height, width] = image.shape() else {
            return Err(WriterError::UnsupportedImage(image.shape().to_vec()));
        };
        let (magic, extension) = match channels {
            1 => ("P5", "pgm"),
            3 => ("P6", "ppm"),
            _ => return Err(WriterError::UnsupportedImage(image.shape().to_vec())),
        };

        // [C, H, W] -> interleaved [H, W, C]
        let mut hwc = image.view();
        hwc.swap_axes(0, 1);
        hwc.swap_axes(1, 2);
        let pixels: Vec<u8> = hwc.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8).collect();

        let file_name = format!("{}_{:06}.{}", tag.replace('/', "_"), step, extension);
        let path = self.log_dir.join("images").join(file_name);
        let mut out = BufWriter::new(File::create(&path)?);
        write!(out, "{magic}\n{width} {height}\n255\n")?;
        out.write_all(&pixels)?;
        out.flush()?;
        Ok(path)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// Reads back every event of `scalars.jsonl`.
pub fn read_scalars<P: AsRef<Path>>(log_dir: P) -> Result<Vec<ScalarEvent>> {
    let text = fs::read_to_string(log_dir.as_ref().join("scalars.jsonl"))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(WriterError::from))
        .collect()
}

/// Converts an `[N, C, H, W]` batch of logits to intensities.
pub fn sigmoid_images(logits: &ArrayD<f32>) -> ArrayD<f32> {
    logits.mapv(|x| 1.0 / (1.0 + (-x).exp()))
}

//! Scalar and image summaries written next to the training run.
//!
//! Scalars are appended to `scalars.csv` as `step,tag,value` rows. Kernel
//! visualizations are written as `kernels_<step>.png`.

use image::{GrayImage, Luma};
use seg_core::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SCALARS_FILE: &str = "scalars.csv";

/// Pixels per kernel cell in the visualization
const KERNEL_ZOOM: u32 = 8;

/// Appends summaries to one log directory.
pub struct SummaryWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl SummaryWriter {
    /// Opens (or creates) the summary directory. An existing `scalars.csv`
    /// is appended to, so a restored run keeps one continuous log.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join(SCALARS_FILE);
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut scalars = BufWriter::new(file);
        if is_new {
            writeln!(scalars, "step,tag,value")?;
        }
        Ok(Self { dir, scalars })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scalars_path(&self) -> PathBuf {
        self.dir.join(SCALARS_FILE)
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        writeln!(self.scalars, "{},{},{}", step, tag, value)?;
        Ok(())
    }

    pub fn add_scalars<'a, I>(&mut self, scalars: I, step: u64) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (tag, value) in scalars {
            self.add_scalar(tag, value, step)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }

    /// Writes a grid of kernels, one cell per `(output, input)` channel pair,
    /// min-max normalized over the whole tensor.
    ///
    /// `values` is the flattened kernel tensor of shape `[out, in, k, k]`.
    pub fn write_kernel_image(&self, values: &[f32], shape: [usize; 4], step: u64) -> Result<PathBuf> {
        let image = kernel_grid(values, shape)?;
        let path = self.dir.join(format!("kernels_{}.png", step));
        image.save(&path)?;
        debug!("Kernel image written to {:?}", path);
        Ok(path)
    }
}

/// Tiles the kernels into a near-square grayscale grid with 1px separators.
pub fn kernel_grid(values: &[f32], shape: [usize; 4]) -> Result<GrayImage> {
    let [out_channels, in_channels, kh, kw] = shape;
    let tiles = out_channels * in_channels;
    if tiles == 0 || kh == 0 || kw == 0 || values.len() != tiles * kh * kw {
        return Err(Error::InvalidArgument(format!(
            "kernel data of length {} does not match shape {:?}",
            values.len(),
            shape
        )));
    }

    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = if max > min { max - min } else { 1.0 };

    let cols = (tiles as f64).sqrt().ceil() as usize;
    let rows = tiles.div_ceil(cols);
    let cell_w = kw as u32 * KERNEL_ZOOM + 1;
    let cell_h = kh as u32 * KERNEL_ZOOM + 1;
    let mut image = GrayImage::new(cols as u32 * cell_w + 1, rows as u32 * cell_h + 1);

    for tile in 0..tiles {
        let origin_x = (tile % cols) as u32 * cell_w + 1;
        let origin_y = (tile / cols) as u32 * cell_h + 1;
        let kernel = &values[tile * kh * kw..(tile + 1) * kh * kw];
        for (i, &v) in kernel.iter().enumerate() {
            let shade = (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8;
            let x0 = origin_x + (i % kw) as u32 * KERNEL_ZOOM;
            let y0 = origin_y + (i / kw) as u32 * KERNEL_ZOOM;
            for dy in 0..KERNEL_ZOOM {
                for dx in 0..KERNEL_ZOOM {
                    image.put_pixel(x0 + dx, y0 + dy, Luma([shade]));
                }
            }
        }
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scalars_append_with_single_header() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = SummaryWriter::new(dir.path()).unwrap();
            writer.add_scalar("accuracy", 0.5, 50).unwrap();
            writer.flush().unwrap();
        }
        {
            let mut writer = SummaryWriter::new(dir.path()).unwrap();
            writer
                .add_scalars([("recall_1", 0.25), ("learning_rate", 0.001)], 100)
                .unwrap();
        }

        let content = fs::read_to_string(dir.path().join("scalars.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "step,tag,value");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "50,accuracy,0.5");
        assert_eq!(lines[3], "100,learning_rate,0.001");
    }

    #[test]
    fn test_kernel_grid_layout() {
        // 4 kernels of 3x3 -> 2x2 grid
        let values: Vec<f32> = (0..36).map(|v| v as f32).collect();
        let image = kernel_grid(&values, [4, 1, 3, 3]).unwrap();
        assert_eq!(image.width(), 2 * (3 * KERNEL_ZOOM + 1) + 1);
        assert_eq!(image.height(), image.width());
        // first cell of the first kernel holds the minimum, last cell of the last kernel the maximum
        assert_eq!(image.get_pixel(1, 1)[0], 0);
        let last = image.width() - 2;
        assert_eq!(image.get_pixel(last, last)[0], 255);
    }

    #[test]
    fn test_kernel_grid_rejects_bad_shape() {
        assert!(kernel_grid(&[0.0; 10], [1, 1, 3, 3]).is_err());
    }

    #[test]
    fn test_write_kernel_image() {
        let dir = TempDir::new().unwrap();
        let writer = SummaryWriter::new(dir.path()).unwrap();
        let path = writer.write_kernel_image(&[0.1; 18], [2, 1, 3, 3], 7).unwrap();
        assert_eq!(path, dir.path().join("kernels_7.png"));
        assert!(path.is_file());
    }
}

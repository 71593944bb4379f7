//! Tiling of image batches into a single image.

use ndarray::{s, ArrayD, ArrayView3, ArrayViewMutD, Axis, IxDyn};

/// Layout of [`make_grid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOptions {
    /// Images per row.
    pub nrow: usize,
    /// Border between and around images, in pixels.
    pub padding: usize,
    /// Min-max normalize into `[0, 1]`.
    pub normalize: bool,
    /// Normalize every image by its own range instead of the batch range.
    pub scale_each: bool,
    /// Fill value of the border.
    pub pad_value: f32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self { nrow: 8, padding: 2, normalize: false, scale_each: false, pad_value: 0.0 }
    }
}

impl GridOptions {
    pub fn normalized() -> Self {
        Self { normalize: true, scale_each: true, ..Default::default() }
    }
}

/// Min-max normalizes `values` in place; non-finite ranges are left alone.
fn normalize_range(mut values: ArrayViewMutD<f32>) {
    let (low, high) = values.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(low.is_finite() && high.is_finite()) {
        return;
    }
    let span = (high - low).max(1e-5);
    values.mapv_inplace(|v| (v.clamp(low, high) - low) / span);
}

/// Tiles an `[N, C, H, W]` batch into one `[C, H', W']` image with
/// `min(nrow, N)` images per row.
///
/// Returns `None` when `batch` is not 4-D or is empty.
pub fn make_grid(batch: &ArrayD<f32>, options: GridOptions) -> Option<ArrayD<f32>> {
    let &[n, c, h, w] = batch.shape() else {
        return None;
    };
    if n == 0 {
        return None;
    }

    let mut batch = batch.to_owned();
    if options.normalize {
        if options.scale_each {
            batch.axis_iter_mut(Axis(0)).for_each(normalize_range);
        } else {
            normalize_range(batch.view_mut());
        }
    }

    let pad = options.padding;
    let xmaps = options.nrow.max(1).min(n);
    let ymaps = (n + xmaps - 1) / xmaps;
    let (cell_h, cell_w) = (h + pad, w + pad);
    let mut grid = ArrayD::from_elem(IxDyn(&[c, ymaps * cell_h + pad, xmaps * cell_w + pad]), options.pad_value);

    for (k, image) in batch.axis_iter(Axis(0)).enumerate() {
        let image: ArrayView3<f32> = image.into_dimensionality().ok()?;
        let (y, x) = (k / xmaps, k % xmaps);
        let top = y * cell_h + pad;
        let left = x * cell_w + pad;
        grid.slice_mut(s![.., top..top + h, left..left + w]).assign(&image);
    }
    Some(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout_matches_padding() {
        let batch = ArrayD::ones(IxDyn(&[10, 1, 4, 4]));
        let grid = make_grid(&batch, GridOptions::default()).unwrap();
        // 8 per row, 2 rows: 2 * (4 + 2) + 2 = 14 high, 8 * 6 + 2 = 50 wide.
        assert_eq!(grid.shape(), &[1, 14, 50]);
        assert_eq!(grid[[0, 0, 0]], 0.0);
        assert_eq!(grid[[0, 2, 2]], 1.0);
        assert_eq!(grid[[0, 8, 2]], 1.0);
        // Tenth image is the second of the second row; the rest of that row stays padding.
        assert_eq!(grid[[0, 8, 8]], 1.0);
        assert_eq!(grid[[0, 8, 14]], 0.0);
    }

    #[test]
    fn scale_each_normalizes_per_image() {
        let mut batch = ArrayD::zeros(IxDyn(&[2, 1, 1, 2]));
        batch[[0, 0, 0, 1]] = 2.0;
        batch[[1, 0, 0, 0]] = 10.0;
        batch[[1, 0, 0, 1]] = 20.0;
        let grid = make_grid(&batch, GridOptions { padding: 0, ..GridOptions::normalized() }).unwrap();
        assert_eq!(grid.shape(), &[1, 1, 4]);
        let values: Vec<f32> = grid.iter().copied().collect();
        for (v, e) in values.iter().zip([0.0, 1.0, 0.0, 1.0]) {
            assert!((v - e).abs() < 1e-4);
        }
    }

    #[test]
    fn batch_range_when_not_scale_each() {
        let mut batch = ArrayD::zeros(IxDyn(&[2, 1, 1, 1]));
        batch[[1, 0, 0, 0]] = 4.0;
        let options = GridOptions { padding: 0, normalize: true, ..Default::default() };
        let grid = make_grid(&batch, options).unwrap();
        assert!((grid[[0, 0, 1]] - 1.0).abs() < 1e-4);
        assert!(make_grid(&ArrayD::zeros(IxDyn(&[3, 3])), options).is_none());
    }
}

//! Image grid rendering

use std::path::Path;

use burn::prelude::*;
use image::RgbImage;

use crate::error::GlidError;

pub const GRID_PADDING: usize = 2;

/// Tile `[N, C, H, W]` images into one `[C, H', W']` grid
///
/// `nrow` images per row, `padding` pixels of `pad_value` around every tile.
/// A single image is returned unpadded.
pub fn make_grid<B: Backend>(
    images: Tensor<B, 4>,
    nrow: usize,
    padding: usize,
    pad_value: f64,
) -> Tensor<B, 3> {
    let [n, c, h, w] = images.dims();
    if n == 1 {
        return images.reshape([c, h, w]);
    }

    let xmaps = nrow.clamp(1, n.max(1));
    let ymaps = n.div_ceil(xmaps);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let device = images.device();

    let mut grid = Tensor::<B, 3>::full(
        [c, cell_h * ymaps + padding, cell_w * xmaps + padding],
        pad_value,
        &device,
    );
    for k in 0..n {
        let (y, x) = (k / xmaps, k % xmaps);
        let top = y * cell_h + padding;
        let left = x * cell_w + padding;
        let tile = images.clone().slice([k..k + 1, 0..c, 0..h, 0..w]).reshape([c, h, w]);
        grid = grid.slice_assign([0..c, top..top + h, left..left + w], tile);
    }
    grid
}

/// Convert a `[3, H, W]` tensor in `[0, 1]` to 8-bit RGB
///
/// Values are clamped then scaled by 255 and truncated.
pub fn tensor_to_rgb_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<RgbImage, GlidError> {
    let [c, h, w] = tensor.dims();
    if c != 3 {
        return Err(GlidError::invalid("image", format!("expected 3 channels, got {c}")));
    }
    let floats: Vec<f32> = tensor
        .clamp(0.0, 1.0)
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| GlidError::invalid("image", format!("{e:?}")))?;

    let mut rgb = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..3 {
                rgb.push((floats[ch * h * w + y * w + x] * 255.0) as u8);
            }
        }
    }

    RgbImage::from_raw(w as u32, h as u32, rgb)
        .ok_or_else(|| GlidError::invalid("image", "buffer size mismatch"))
}

/// Write a `[3, H, W]` grid as PNG, replacing any existing file
pub fn save_grid<B: Backend, P: AsRef<Path>>(grid: Tensor<B, 3>, path: P) -> Result<(), GlidError> {
    let img = tensor_to_rgb_image(grid)?;
    img.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn images(n: usize, h: usize, w: usize) -> Tensor<TestBackend, 4> {
        let data: Vec<f32> = (0..n)
            .flat_map(|k| vec![(k + 1) as f32 / 10.0; 3 * h * w])
            .collect();
        Tensor::from_data(TensorData::new(data, [n, 3, h, w]), &Default::default())
    }

    #[test]
    fn test_single_image_unpadded() {
        let grid = make_grid(images(1, 4, 5), 1, GRID_PADDING, 0.0);
        assert_eq!(grid.dims(), [3, 4, 5]);
    }

    #[test]
    fn test_grid_dims() {
        // 8 images, 4 per row -> 2 rows
        let grid = make_grid(images(8, 4, 6), 4, GRID_PADDING, 0.0);
        assert_eq!(grid.dims(), [3, 2 * (4 + 2) + 2, 4 * (6 + 2) + 2]);

        // 3 images in one row
        let grid = make_grid(images(3, 4, 6), 3, GRID_PADDING, 0.0);
        assert_eq!(grid.dims(), [3, 4 + 4, 3 * 8 + 2]);

        // ragged last row
        let grid = make_grid(images(3, 4, 6), 2, GRID_PADDING, 0.0);
        assert_eq!(grid.dims(), [3, 2 * 6 + 2, 2 * 8 + 2]);
    }

    #[test]
    fn test_tiles_placed_row_major() {
        let grid = make_grid(images(4, 2, 2), 2, GRID_PADDING, 0.0);
        let [_, gh, gw] = grid.dims();
        let v: Vec<f32> = grid.into_data().to_vec().unwrap();
        let at = |y: usize, x: usize| v[y * gw + x];
        assert_eq!(gh, 10);
        assert_eq!(at(0, 0), 0.0);
        assert_eq!(at(2, 2), 0.1);
        assert_eq!(at(2, 6), 0.2);
        assert_eq!(at(6, 2), 0.3);
        assert_eq!(at(7, 7), 0.4);
        assert_eq!(at(4, 4), 0.0);
    }

    #[test]
    fn test_to_rgb_truncates() {
        let data = vec![0.5f32, 1.5, -0.2, 0.999];
        let t = Tensor::<TestBackend, 3>::from_data(TensorData::new(data.repeat(3), [3, 2, 2]), &Default::default());
        let img = tensor_to_rgb_image(t).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [127, 127, 127]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 255, 255]);
        assert_eq!(img.get_pixel(0, 1).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(1, 1).0, [254, 254, 254]);
    }

    #[test]
    fn test_save_grid_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current.png");
        save_grid(make_grid(images(2, 4, 4), 2, GRID_PADDING, 0.0), &path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (2 * 6 + 2, 8));
    }
}

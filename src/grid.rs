//! Image grids

use image::{DynamicImage, RgbImage};
use tracing::debug;

use crate::error::{Result, SvdiffError};

/// Tile `images` row-major into a `rows` x `cols` grid
///
/// Cells take the size of the first image; image `i` lands in column
/// `i % cols`, row `i / cols`. Larger images are clipped at the canvas edge.
pub fn image_grid(images: &[DynamicImage], rows: u32, cols: u32) -> Result<RgbImage> {
    let cells = rows as usize * cols as usize;
    let first = match images.first() {
        Some(first) if images.len() == cells => first,
        _ => {
            return Err(SvdiffError::GridShape {
                rows,
                cols,
                actual: images.len(),
            })
        }
    };

    let (w, h) = (first.width(), first.height());
    let (width, height) = match (cols.checked_mul(w), rows.checked_mul(h)) {
        (Some(width), Some(height)) => (width, height),
        _ => {
            return Err(SvdiffError::GridShape {
                rows,
                cols,
                actual: images.len(),
            })
        }
    };
    debug!(rows, cols, cell_width = w, cell_height = h, "Composing image grid");

    let mut grid = RgbImage::new(width, height);
    for (i, img) in images.iter().enumerate() {
        let i = i as u32;
        let x = (i % cols) * w;
        let y = (i / cols) * h;
        image::imageops::replace(&mut grid, &img.to_rgb8(), x as i64, y as i64);
    }
    Ok(grid)
}

//! Prediction grid rendering.
//!
//! Each cell is the sample image framed green (correct) or red (wrong) above
//! a caption strip reading `pred: <label>` and `true: <label>`.

use std::path::Path;

use ab_glyph::{FontRef, PxScale};
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use memesense_core::{MemeSenseError, Result};
use memesense_data::ImageSet;
use tracing::info;

use super::Prediction;

const CORRECT: Rgb<u8> = Rgb([0, 170, 0]);
const WRONG: Rgb<u8> = Rgb([210, 0, 0]);
const TEXT: Rgb<u8> = Rgb([0, 0, 0]);
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GAP: u32 = 4;
const TEXT_PAD: u32 = 2;
const MAX_TEXT_PX: f32 = 16.0;
const MIN_TEXT_PX: f32 = 6.0;

static FONT_BYTES: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");

fn label_font() -> Result<FontRef<'static>> {
    FontRef::try_from_slice(FONT_BYTES)
        .map_err(|e| MemeSenseError::Image(format!("Failed to load label font: {e}")))
}

/// Rows and columns of a near-square grid holding `n` tiles.
pub fn grid_shape(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let cols = (n as f64).sqrt().ceil() as usize;
    let rows = n.div_ceil(cols);
    (rows, cols)
}

/// Paint a `thickness`-pixel frame along the edges of `tile`.
pub fn draw_border(tile: &mut RgbImage, color: Rgb<u8>, thickness: u32) {
    let (w, h) = tile.dimensions();
    for (x, y, pixel) in tile.enumerate_pixels_mut() {
        if x < thickness || y < thickness || x + thickness >= w || y + thickness >= h {
            *pixel = color;
        }
    }
}

/// Caption lines drawn under a tile.
pub fn tile_labels(prediction: &Prediction) -> [String; 2] {
    [
        format!("pred: {}", prediction.predicted),
        format!("true: {}", prediction.actual),
    ]
}

/// Largest text size, capped at `MAX_TEXT_PX`, at which every line fits in
/// `max_width` pixels. Never below `MIN_TEXT_PX`.
fn label_scale(font: &FontRef<'_>, max_width: u32, lines: &[String]) -> PxScale {
    let mut size = MAX_TEXT_PX;
    while size > MIN_TEXT_PX {
        let fits = lines
            .iter()
            .all(|line| text_size(PxScale::from(size), font, line).0 <= max_width);
        if fits {
            break;
        }
        size -= 1.0;
    }
    PxScale::from(size)
}

/// Draw `predictions` (whose `position`s index into `images`) as a labelled
/// grid and save it as PNG.
pub fn render_grid(images: &ImageSet, predictions: &[Prediction], path: &Path) -> Result<()> {
    let font = label_font()?;
    let (rows, cols) = grid_shape(predictions.len());
    let (tile_w, tile_h) = (images.width as u32, images.height as u32);
    let thickness = (tile_w.min(tile_h) / 25).max(2);

    let labels: Vec<[String; 2]> = predictions.iter().map(tile_labels).collect();
    let all_lines: Vec<String> = labels.iter().flatten().cloned().collect();
    let scale = label_scale(&font, tile_w.saturating_sub(2 * TEXT_PAD), &all_lines);
    let line_h = scale.y.ceil() as u32;
    let strip_h = 2 * line_h + 3 * TEXT_PAD;
    let cell_h = tile_h + strip_h;

    let canvas_w = cols as u32 * (tile_w + GAP) + GAP;
    let canvas_h = rows as u32 * (cell_h + GAP) + GAP;
    let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, BACKGROUND);

    for (i, (prediction, [pred_line, true_line])) in predictions.iter().zip(&labels).enumerate() {
        if prediction.position >= images.len {
            return Err(MemeSenseError::Image(format!(
                "prediction position {} outside {} images",
                prediction.position, images.len
            )));
        }
        let mut tile = images.to_rgb_image(prediction.position);
        let color = if prediction.is_correct() { CORRECT } else { WRONG };
        draw_border(&mut tile, color, thickness);

        let (r, c) = ((i / cols) as u32, (i % cols) as u32);
        let x = GAP + c * (tile_w + GAP);
        let y = GAP + r * (cell_h + GAP);
        imageops::replace(&mut canvas, &tile, x as i64, y as i64);

        let text_x = (x + TEXT_PAD) as i32;
        let text_y = y + tile_h + TEXT_PAD;
        draw_text_mut(&mut canvas, color, text_x, text_y as i32, scale, &font, pred_line);
        let text_y = text_y + line_h + TEXT_PAD;
        draw_text_mut(&mut canvas, TEXT, text_x, text_y as i32, scale, &font, true_line);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    canvas.save(path).map_err(|e| {
        MemeSenseError::Image(format!("Failed to save grid {}: {}", path.display(), e))
    })?;
    info!(path = %path.display(), tiles = predictions.len(), "Saved prediction grid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memesense_core::{Sentiment, NUM_CLASSES};
    use std::path::PathBuf;

    fn prediction(position: usize, predicted: Sentiment, actual: Sentiment) -> Prediction {
        Prediction {
            position,
            image: PathBuf::from(format!("{position}.png")),
            caption: String::new(),
            predicted,
            actual,
            confidence: 0.5,
            probabilities: [0.2; NUM_CLASSES],
        }
    }

    fn grey_images(side: usize, count: usize) -> ImageSet {
        let mut images = ImageSet::new(side, side);
        for _ in 0..count {
            images.push(&vec![0.5; 3 * side * side]).unwrap();
        }
        images
    }

    /// Pixels in `[x0, x1) × [y0, y1)` that differ from the background.
    fn inked(grid: &RgbImage, (x0, x1): (u32, u32), (y0, y1): (u32, u32)) -> usize {
        (y0..y1)
            .flat_map(|y| (x0..x1).map(move |x| (x, y)))
            .filter(|&(x, y)| *grid.get_pixel(x, y) != BACKGROUND)
            .count()
    }

    #[test]
    fn test_grid_shape() {
        assert_eq!(grid_shape(9), (3, 3));
        assert_eq!(grid_shape(7), (3, 3));
        assert_eq!(grid_shape(5), (2, 3));
        assert_eq!(grid_shape(1), (1, 1));
        assert_eq!(grid_shape(0), (0, 0));
    }

    #[test]
    fn test_border_leaves_interior() {
        let mut tile = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        draw_border(&mut tile, CORRECT, 2);
        assert_eq!(*tile.get_pixel(0, 0), CORRECT);
        assert_eq!(*tile.get_pixel(9, 5), CORRECT);
        assert_eq!(*tile.get_pixel(5, 1), CORRECT);
        assert_eq!(*tile.get_pixel(5, 5), Rgb([1, 2, 3]));
        assert_eq!(*tile.get_pixel(2, 7), Rgb([1, 2, 3]));
    }

    #[test]
    fn test_tile_labels_name_both_classes() {
        let p = prediction(0, Sentiment::VeryNegative, Sentiment::Positive);
        assert_eq!(tile_labels(&p), ["pred: very_negative", "true: positive"]);
    }

    #[test]
    fn test_label_scale_fits_a_meme_sized_tile() {
        let font = label_font().unwrap();
        let lines = vec![
            "pred: very_negative".to_string(),
            "true: very_positive".to_string(),
        ];
        let scale = label_scale(&font, 96, &lines);
        assert!(scale.y >= MIN_TEXT_PX && scale.y <= MAX_TEXT_PX);
        for line in &lines {
            assert!(text_size(scale, &font, line).0 <= 96);
        }
        // short lines get the largest size
        let scale = label_scale(&font, 400, &["pred: neutral".to_string()]);
        assert_eq!(scale.y, MAX_TEXT_PX);
    }

    #[test]
    fn test_render_grid_frames_and_labels_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("grid.png");
        let images = grey_images(40, 4);
        let predictions = vec![
            prediction(0, Sentiment::Neutral, Sentiment::Neutral),
            prediction(3, Sentiment::Neutral, Sentiment::Positive),
        ];
        render_grid(&images, &predictions, &path).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        // 2 tiles → 1 row × 2 columns, each with a caption strip below
        let (w, h) = grid.dimensions();
        assert_eq!(w, 2 * (40 + GAP) + GAP);
        assert!(h > 40 + 2 * GAP);
        assert_eq!(*grid.get_pixel(GAP, GAP), CORRECT);
        assert_eq!(*grid.get_pixel(2 * GAP + 40, GAP), WRONG);
        assert_eq!(*grid.get_pixel(GAP + 20, GAP + 20), Rgb([128, 128, 128]));

        let strip_rows = (GAP + 40, h - GAP);
        assert!(inked(&grid, (GAP, GAP + 40), strip_rows) > 0);
        assert!(inked(&grid, (2 * GAP + 40, 2 * GAP + 80), strip_rows) > 0);
    }

    #[test]
    fn test_render_grid_leaves_unused_cells_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let images = grey_images(100, 2);
        // 3 tiles → 2 × 2 grid with the last cell empty
        let predictions = vec![
            prediction(0, Sentiment::Negative, Sentiment::Negative),
            prediction(1, Sentiment::Negative, Sentiment::Neutral),
            prediction(0, Sentiment::Positive, Sentiment::Negative),
        ];
        render_grid(&images, &predictions, &path).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        let (w, h) = grid.dimensions();
        assert_eq!(w, 2 * (100 + GAP) + GAP);
        let cell_h = (h - GAP) / 2 - GAP;
        let second_row = (2 * GAP + cell_h, h - GAP);
        assert!(inked(&grid, (GAP, GAP + 100), second_row) > 0);
        assert_eq!(inked(&grid, (2 * GAP + 100, w - GAP), second_row), 0);
    }

    #[test]
    fn test_render_grid_rejects_bad_position() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageSet::new(8, 8);
        let predictions = vec![prediction(0, Sentiment::Neutral, Sentiment::Neutral)];
        assert!(render_grid(&images, &predictions, &dir.path().join("g.png")).is_err());
    }
}

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::text_render::{draw_text, draw_text_centered, draw_text_vertical, text_width};

/// Plot annotations: title, x label, y label, colour bar label
#[derive(Debug, Clone)]
pub struct PlotLabels {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub z_label: String,
}

impl PlotLabels {
    pub fn new(title: &str, x_label: &str, y_label: &str, z_label: &str) -> Self {
        Self {
            title: title.to_string(),
            x_label: x_label.to_string(),
            y_label: y_label.to_string(),
            z_label: z_label.to_string(),
        }
    }
}

/// Two-dimensional histogram of paired samples.
///
/// `counts` is row-major with `num_bins` rows; row `j` holds the y bin
/// `[y_edges[j], y_edges[j + 1])`, column `i` the x bin.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Histogram2D {
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    pub counts: Vec<u64>,
    pub num_bins: usize,
}

impl Histogram2D {
    #[inline]
    pub fn count(&self, x_bin: usize, y_bin: usize) -> u64 {
        self.counts[y_bin * self.num_bins + x_bin]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Smallest and largest non-empty bin; empty bins carry no data
    pub fn nonzero_range(&self) -> Option<(u64, u64)> {
        let mut nonzero = self.counts.iter().copied().filter(|&c| c > 0);
        let first = nonzero.next()?;
        Some(nonzero.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c))))
    }
}

/// Evenly spaced edges over the data range, widened by 0.5 when the range
/// is degenerate and 0..1 with no data at all
fn bin_edges(values: &[f64], num_bins: usize) -> Vec<f64> {
    let (mut lo, mut hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if values.is_empty() {
        lo = 0.0;
        hi = 1.0;
    } else if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let step = (hi - lo) / num_bins as f64;
    (0..=num_bins)
        .map(|i| if i == num_bins { hi } else { lo + step * i as f64 })
        .collect()
}

/// Index of the bin holding `v`; the last bin is closed on the right
fn bin_index(edges: &[f64], v: f64) -> usize {
    let num_bins = edges.len() - 1;
    let lo = edges[0];
    let hi = edges[num_bins];
    if v >= hi {
        return num_bins - 1;
    }
    let mut i = (((v - lo) / (hi - lo)) * num_bins as f64) as usize;
    i = i.min(num_bins - 1);
    // Float division can land one bin off next to an edge
    while i > 0 && v < edges[i] {
        i -= 1;
    }
    while i + 1 < num_bins && v >= edges[i + 1] {
        i += 1;
    }
    i
}

/// Bin paired samples into a `num_bins x num_bins` histogram.
///
/// Pairs with a NaN or infinity on either side, or with `y == mask_value`,
/// are dropped.
/// When `output_path` is given the histogram is also rendered to a PNG with
/// a logarithmic colour scale; the numeric histogram is returned either way.
pub fn histogram_2d(
    x: &[f64],
    y: &[f64],
    num_bins: usize,
    mask_value: f64,
    output_path: Option<&Path>,
    labels: Option<&PlotLabels>,
) -> Result<Histogram2D> {
    anyhow::ensure!(num_bins > 0, "histogram needs at least one bin");
    anyhow::ensure!(
        x.len() == y.len(),
        "paired samples differ in length: {} vs {}",
        x.len(),
        y.len()
    );

    let (xs, ys): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| a.is_finite() && b.is_finite() && **b != mask_value)
        .map(|(a, b)| (*a, *b))
        .unzip();

    let x_edges = bin_edges(&xs, num_bins);
    let y_edges = bin_edges(&ys, num_bins);
    let mut counts = vec![0u64; num_bins * num_bins];
    for (&a, &b) in xs.iter().zip(&ys) {
        let i = bin_index(&x_edges, a);
        let j = bin_index(&y_edges, b);
        counts[j * num_bins + i] += 1;
    }

    let histogram = Histogram2D {
        x_edges,
        y_edges,
        counts,
        num_bins,
    };

    tracing::debug!(
        kept = xs.len(),
        dropped = x.len() - xs.len(),
        bins = num_bins,
        "built correlation histogram"
    );

    if let Some(path) = output_path {
        render_histogram(&histogram, labels, path)?;
    }

    Ok(histogram)
}

const PLOT_WIDTH: u32 = 1200;
const PLOT_HEIGHT: u32 = 1000;
const MARGIN_LEFT: u32 = 140;
const MARGIN_RIGHT: u32 = 220;
const MARGIN_TOP: u32 = 90;
const MARGIN_BOTTOM: u32 = 120;
const COLORBAR_WIDTH: u32 = 40;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Perceptual ramp from dark purple through teal to yellow
const RAMP: [[f32; 3]; 5] = [
    [68.0, 1.0, 84.0],
    [59.0, 82.0, 139.0],
    [33.0, 145.0, 140.0],
    [94.0, 201.0, 98.0],
    [253.0, 231.0, 37.0],
];

fn ramp_color(t: f64) -> Rgb<u8> {
    let t = t.clamp(0.0, 1.0) as f32 * (RAMP.len() - 1) as f32;
    let i = (t.floor() as usize).min(RAMP.len() - 2);
    let f = t - i as f32;
    let mut rgb = [0u8; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        *out = (RAMP[i][c] * (1.0 - f) + RAMP[i + 1][c] * f).round() as u8;
    }
    Rgb(rgb)
}

/// Position of `count` on a log scale between the extreme non-empty bins
fn log_position(count: u64, lo: u64, hi: u64) -> f64 {
    if hi <= lo {
        return 1.0;
    }
    let (l, h) = ((lo as f64).ln(), (hi as f64).ln());
    ((count as f64).ln() - l) / (h - l)
}

fn format_tick(v: f64) -> String {
    if v != 0.0 && (v.abs() >= 1e4 || v.abs() < 1e-2) {
        format!("{:.2E}", v)
    } else {
        format!("{:.2}", v)
    }
}

/// Render the histogram as a PNG heat map with a log colour bar
pub fn render_histogram(
    histogram: &Histogram2D,
    labels: Option<&PlotLabels>,
    path: &Path,
) -> Result<()> {
    let mut img = RgbImage::from_pixel(PLOT_WIDTH, PLOT_HEIGHT, WHITE);

    let plot_w = PLOT_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_h = PLOT_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let n = histogram.num_bins as u32;
    let range = histogram.nonzero_range();

    if let Some((lo, hi)) = range {
        for j in 0..n {
            for i in 0..n {
                let count = histogram.count(i as usize, j as usize);
                if count == 0 {
                    continue;
                }
                let x0 = MARGIN_LEFT + i * plot_w / n;
                let x1 = MARGIN_LEFT + (i + 1) * plot_w / n;
                // Row 0 is the lowest y bin, drawn at the bottom
                let y1 = MARGIN_TOP + plot_h - j * plot_h / n;
                let y0 = MARGIN_TOP + plot_h - (j + 1) * plot_h / n;
                if x1 > x0 && y1 > y0 {
                    let color = ramp_color(log_position(count, lo, hi));
                    draw_filled_rect_mut(
                        &mut img,
                        Rect::at(x0 as i32, y0 as i32).of_size(x1 - x0, y1 - y0),
                        color,
                    );
                }
            }
        }
    }

    draw_hollow_rect_mut(
        &mut img,
        Rect::at(MARGIN_LEFT as i32 - 1, MARGIN_TOP as i32 - 1).of_size(plot_w + 2, plot_h + 2),
        BLACK,
    );

    // Axis extents
    let scale = 2;
    let x_lo = format_tick(histogram.x_edges[0]);
    let x_hi = format_tick(histogram.x_edges[histogram.num_bins]);
    let y_lo = format_tick(histogram.y_edges[0]);
    let y_hi = format_tick(histogram.y_edges[histogram.num_bins]);
    let below = MARGIN_TOP + plot_h + 10;
    draw_text(&mut img, MARGIN_LEFT, below, &x_lo, BLACK, scale);
    draw_text(
        &mut img,
        (MARGIN_LEFT + plot_w).saturating_sub(text_width(&x_hi, scale)),
        below,
        &x_hi,
        BLACK,
        scale,
    );
    let left_of = |text: &str| MARGIN_LEFT.saturating_sub(text_width(text, scale) + 8);
    draw_text(&mut img, left_of(&y_hi), MARGIN_TOP, &y_hi, BLACK, scale);
    draw_text(
        &mut img,
        left_of(&y_lo),
        MARGIN_TOP + plot_h - 14,
        &y_lo,
        BLACK,
        scale,
    );

    // Colour bar
    let bar_x = MARGIN_LEFT + plot_w + 40;
    for row in 0..plot_h {
        let t = 1.0 - row as f64 / (plot_h - 1).max(1) as f64;
        let color = if range.is_some() { ramp_color(t) } else { WHITE };
        for col in 0..COLORBAR_WIDTH {
            img.put_pixel(bar_x + col, MARGIN_TOP + row, color);
        }
    }
    draw_hollow_rect_mut(
        &mut img,
        Rect::at(bar_x as i32, MARGIN_TOP as i32).of_size(COLORBAR_WIDTH, plot_h),
        BLACK,
    );
    if let Some((lo, hi)) = range {
        let tick_x = bar_x + COLORBAR_WIDTH + 6;
        draw_text(&mut img, tick_x, MARGIN_TOP, &hi.to_string(), BLACK, scale);
        draw_text(
            &mut img,
            tick_x,
            MARGIN_TOP + plot_h - 14,
            &lo.to_string(),
            BLACK,
            scale,
        );
    }

    if let Some(labels) = labels {
        draw_text_centered(&mut img, PLOT_WIDTH / 2, 30, &labels.title, BLACK, 3);
        draw_text_centered(
            &mut img,
            MARGIN_LEFT + plot_w / 2,
            MARGIN_TOP + plot_h + 60,
            &labels.x_label,
            BLACK,
            scale,
        );
        draw_text_vertical(
            &mut img,
            20,
            MARGIN_TOP + plot_h / 2,
            &labels.y_label,
            BLACK,
            scale,
        );
        draw_text_vertical(
            &mut img,
            bar_x + COLORBAR_WIDTH + 110,
            MARGIN_TOP + plot_h / 2,
            &labels.z_label,
            BLACK,
            scale,
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    img.save(path)
        .with_context(|| format!("Failed to save plot to: {}", path.display()))?;
    Ok(())
}
